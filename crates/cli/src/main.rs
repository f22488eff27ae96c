use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use flotilla::bulk_copy::CopySpec;
use flotilla::config::{self, ClusterConfig, Defaults, ZoneChoice};
use flotilla::prompt::StdinConfirm;
use flotilla::spinner::create_spinner;
use flotilla::ssh::{self, SshTransport};
use flotilla::{info, Controller};
use flotilla_core::error::{FlotillaError, Result};
use flotilla_ec2::Ec2;

#[derive(Parser, Debug)]
#[command(name = "flotilla", version)]
#[command(about = "Flotilla - launch, configure and tear down short-lived EC2 clusters")]
struct Args {
    /// What to do with the cluster
    action: Action,
    /// Name of the cluster; its security groups are derived from it
    cluster_name: String,

    /// Number of slaves to launch
    #[arg(short, long, default_value_t = 1)]
    slaves: usize,
    /// Key pair to launch instances with
    #[arg(short, long)]
    key_pair: Option<String>,
    /// SSH private key file for the key pair
    #[arg(short, long)]
    identity_file: Option<String>,
    /// Instance type of the slaves
    #[arg(short = 't', long)]
    instance_type: Option<String>,
    /// Instance type of the master and ambari nodes (default: --instance-type)
    #[arg(short, long)]
    master_instance_type: Option<String>,
    #[arg(short, long)]
    region: Option<String>,
    /// Availability zone; "all" spreads slaves over every zone, empty picks one at random
    #[arg(short, long)]
    zone: Option<String>,
    /// Machine image to launch
    #[arg(short, long)]
    ami: Option<String>,
    /// User to configure the nodes as once root login is enabled
    #[arg(short, long)]
    user: Option<String>,
    /// User the image accepts logins for before root is enabled
    #[arg(long, default_value = "ec2-user")]
    login_user: String,
    /// Bid for spot instances at this maximum hourly price instead of launching on-demand
    #[arg(long)]
    spot_price: Option<f64>,
    /// Attach an EBS volume of this many GB to each node, mounted at /vol
    #[arg(long, default_value_t = 0)]
    ebs_vol_size: u32,
    /// Swap space per node in MB
    #[arg(long, default_value_t = 1024)]
    swap: u32,
    /// Extra time to wait for instances to boot, in seconds or as a duration ("2m")
    #[arg(short, long, default_value = "120")]
    wait: String,
    /// Configure an existing cluster instead of launching a new one
    #[arg(long)]
    resume: bool,
    /// Maximum number of nodes configured at once
    #[arg(long, default_value_t = 20)]
    parallelism: usize,
    /// Open a SOCKS proxy at [ADDRESS:]PORT when logging in
    #[arg(short = 'D', long)]
    proxy: Option<String>,
    /// Print cluster info as JSON
    #[arg(long)]
    json: bool,
    /// Source URI for copy-data
    #[arg(long)]
    source: Option<String>,
    /// Destination path for copy-data
    #[arg(long)]
    dest: Option<String>,
    /// Maximum simultaneous copy tasks for copy-data
    #[arg(long)]
    max_maps: Option<u32>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Launch,
    Info,
    Stop,
    Destroy,
    GetMaster,
    Login,
    AuxStart,
    CopyData,
}

impl Action {
    fn needs_identity(&self) -> bool {
        matches!(self, Action::Launch | Action::Login | Action::AuxStart | Action::CopyData)
    }
}

/// Seconds ("120") or a humantime duration ("2m 30s").
fn parse_wait(value: &str) -> Result<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value.trim())
        .map_err(|e| FlotillaError::InvalidArguments(format!("invalid --wait '{}': {}", value, e)))
}

fn build_config(args: &Args, defaults: &Defaults) -> Result<ClusterConfig> {
    if args.cluster_name.trim().is_empty() {
        return Err(FlotillaError::InvalidArguments("cluster name must not be empty".into()));
    }
    let mut config = ClusterConfig::new(args.cluster_name.clone());

    config.slaves = args.slaves;
    config.key_pair = args.key_pair.clone().or_else(|| defaults.key_pair.clone());
    config.identity_file = args
        .identity_file
        .clone()
        .or_else(|| defaults.identity_file.clone())
        .map(|path| config::expand_tilde(&path));
    if let Some(region) = args.region.clone().or_else(|| defaults.region.clone()) {
        config.region = region;
    }
    if let Some(instance_type) = args.instance_type.clone().or_else(|| defaults.instance_type.clone()) {
        config.instance_type = instance_type;
    }
    config.master_instance_type = args
        .master_instance_type
        .clone()
        .unwrap_or_else(|| config.instance_type.clone());
    if let Some(ami) = args.ami.clone().or_else(|| defaults.ami.clone()) {
        config.ami = ami;
    }
    if let Some(user) = args.user.clone().or_else(|| defaults.user.clone()) {
        config.user = user;
    }
    config.login_user = args.login_user.clone();
    config.zone = ZoneChoice::parse(args.zone.as_deref().or(defaults.zone.as_deref()).unwrap_or(""));
    config.spot_price = args.spot_price.or(defaults.spot_price);
    if let Some(price) = config.spot_price {
        if price.is_nan() || price <= 0.0 {
            return Err(FlotillaError::InvalidArguments(format!("spot price must be positive, got {}", price)));
        }
    }
    config.ebs_vol_size = args.ebs_vol_size;
    config.swap_mb = args.swap;
    config.resume = args.resume;
    config.parallelism = args.parallelism.max(1);
    config.timing.post_launch_wait = parse_wait(&args.wait)?;

    if args.action == Action::Launch && config.key_pair.is_none() {
        return Err(FlotillaError::InvalidArguments("the -k or --key-pair argument is required".into()));
    }
    if args.action.needs_identity() {
        let identity = config.identity_file()?;
        if !identity.is_file() {
            return Err(FlotillaError::InvalidArguments(format!(
                "identity file {} does not exist",
                identity.display()
            )));
        }
    }
    Ok(config)
}

fn copy_spec(args: &Args) -> Result<CopySpec> {
    match (&args.source, &args.dest) {
        (Some(source), Some(dest)) => Ok(CopySpec {
            source: source.clone(),
            dest: dest.clone(),
            max_maps: args.max_maps,
        }),
        _ => Err(FlotillaError::InvalidArguments(
            "copy-data needs both --source and --dest".into(),
        )),
    }
}

async fn run(args: Args) -> Result<()> {
    let file = config::parse_config()?;
    file.logging.init();

    let cluster = build_config(&args, &file.defaults)?;
    let credentials = config::resolve_credentials()?;
    let provider = Ec2::new(cluster.region.clone(), credentials.credentials_file());
    let transport = SshTransport::new(cluster.identity_file.clone().unwrap_or_else(PathBuf::new));
    let confirm = StdinConfirm;
    let mut controller = Controller::new(&provider, transport, &cluster, &confirm);

    match args.action {
        Action::Launch => {
            let mut controller = controller.with_spinner(create_spinner("Launching cluster..."));
            let nodes = controller.launch().await?;
            for line in info::address_lines(&nodes) {
                println!("{}", line);
            }
        }
        Action::Info => {
            let nodes = controller.info().await?;
            info::print_info(&nodes, args.json)?;
        }
        Action::GetMaster => {
            println!("{}", controller.get_master().await?);
        }
        Action::Login => {
            let target = controller.login_target().await?;
            println!("Logging into master {}...", target.host);
            ssh::login(cluster.identity_file()?, &target, args.proxy.as_deref())?;
        }
        Action::AuxStart => {
            let host = controller.aux_start().await?;
            println!("{}", host);
        }
        Action::CopyData => {
            let spec = copy_spec(&args)?;
            let controller = controller.with_spinner(create_spinner("Locating master..."));
            let handle = controller.copy_data(&spec).await?;
            println!("Copy job {} finished", handle.id);
        }
        Action::Stop => {
            let report = controller.stop().await?;
            if report.is_empty() {
                println!("Nothing stopped.");
            } else {
                println!("Stopped: {}", report.stopped.join(" "));
                if !report.terminated.is_empty() {
                    println!("Terminated (spot-backed): {}", report.terminated.join(" "));
                }
            }
        }
        Action::Destroy => {
            let terminated = controller.destroy().await?;
            if terminated.is_empty() {
                println!("Nothing destroyed.");
            } else {
                println!("Terminated: {}", terminated.join(" "));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
