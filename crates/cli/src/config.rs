use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::RetryPolicy;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const CONFIG_PATH: &str = "~/.flotilla/config.toml";
const HOME_CREDENTIALS_PATH: &str = "~/.aws/credentials";
const SYSTEM_CREDENTIALS_PATH: &str = "/etc/aws/credentials";

/// Contents of `~/.flotilla/config.toml`. Every field is optional; command
/// line flags take precedence over anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub defaults: Defaults,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Defaults {
    pub key_pair: Option<String>,
    pub identity_file: Option<String>,
    pub region: Option<String>,
    pub user: Option<String>,
    pub instance_type: Option<String>,
    pub ami: Option<String>,
    pub zone: Option<String>,
    pub spot_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `RUST_LOG` overrides the configured level.
    /// Logs go to stderr; stdout is reserved for cluster output.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).with_writer(std::io::stderr).init(),
            _ => fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Read the user config, returning defaults when the file does not exist.
pub fn parse_config() -> Result<FileConfig> {
    parse_config_from(&expand_tilde(CONFIG_PATH))
}

pub fn parse_config_from(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| FlotillaError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| FlotillaError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Where provider credentials were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    HomeFile(PathBuf),
    SystemFile(PathBuf),
    Environment,
}

impl CredentialSource {
    /// Shared credentials file to hand to the provider, if it is not the
    /// one the provider tooling already reads by default.
    pub fn credentials_file(&self) -> Option<PathBuf> {
        match self {
            CredentialSource::SystemFile(path) => Some(path.clone()),
            _ => None,
        }
    }
}

pub fn resolve_credentials() -> Result<CredentialSource> {
    resolve_credentials_with(
        &expand_tilde(HOME_CREDENTIALS_PATH),
        Path::new(SYSTEM_CREDENTIALS_PATH),
        |key| std::env::var(key).ok(),
    )
}

/// Home file, then system file, then access-key environment variables.
pub fn resolve_credentials_with(
    home_file: &Path,
    system_file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CredentialSource> {
    if home_file.is_file() {
        return Ok(CredentialSource::HomeFile(home_file.to_path_buf()));
    }
    if system_file.is_file() {
        return Ok(CredentialSource::SystemFile(system_file.to_path_buf()));
    }
    let present = |key: &str| env(key).is_some_and(|v| !v.is_empty());
    if present("AWS_ACCESS_KEY_ID") && present("AWS_SECRET_ACCESS_KEY") {
        return Ok(CredentialSource::Environment);
    }
    Err(FlotillaError::CredentialsMissing {
        checked: format!(
            "{}, {}, AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY",
            home_file.display(),
            system_file.display()
        ),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneChoice {
    /// One zone picked at random from the region.
    Random,
    /// Spread workers over every available zone.
    All,
    Named(String),
}

impl ZoneChoice {
    pub fn parse(value: &str) -> ZoneChoice {
        match value.trim() {
            "" => ZoneChoice::Random,
            "all" => ZoneChoice::All,
            zone => ZoneChoice::Named(zone.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub ssh_retry: RetryPolicy,
    pub spot_poll: RetryPolicy,
    pub instance_poll: RetryPolicy,
    /// How often a running bulk copy is checked for completion.
    pub copy_poll: RetryPolicy,
    /// Extra settling time once every instance has left `pending`.
    pub post_launch_wait: Duration,
    /// Settling time after the configure step reboots the nodes.
    pub reboot_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            ssh_retry: RetryPolicy::fixed(3, Duration::from_secs(30)),
            spot_poll: RetryPolicy::forever(Duration::from_secs(10)),
            instance_poll: RetryPolicy::forever(Duration::from_secs(5)),
            copy_poll: RetryPolicy::forever(Duration::from_secs(30)),
            post_launch_wait: Duration::from_secs(120),
            reboot_wait: Duration::from_secs(90),
        }
    }
}

impl Timing {
    /// No sleeping anywhere; for driving the controller in tests.
    pub fn immediate() -> Self {
        Timing {
            ssh_retry: RetryPolicy::fixed(3, Duration::ZERO),
            spot_poll: RetryPolicy::forever(Duration::ZERO),
            instance_poll: RetryPolicy::forever(Duration::ZERO),
            copy_poll: RetryPolicy::forever(Duration::ZERO),
            post_launch_wait: Duration::ZERO,
            reboot_wait: Duration::ZERO,
        }
    }
}

/// Everything one invocation needs, fixed before any component runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub region: String,
    pub slaves: usize,
    pub instance_type: String,
    pub master_instance_type: String,
    pub zone: ZoneChoice,
    pub ami: String,
    pub key_pair: Option<String>,
    pub identity_file: Option<PathBuf>,
    /// Account used for configuration once root login is enabled.
    pub user: String,
    /// Account the image allows logins for before root is enabled.
    pub login_user: String,
    pub spot_price: Option<f64>,
    pub ebs_vol_size: u32,
    pub swap_mb: u32,
    pub resume: bool,
    pub parallelism: usize,
    pub timing: Timing,
}

impl ClusterConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        ClusterConfig {
            cluster_name: cluster_name.into(),
            region: "us-east-1".into(),
            slaves: 1,
            instance_type: "m1.large".into(),
            master_instance_type: "m1.large".into(),
            zone: ZoneChoice::Random,
            ami: "ami-a25415cb".into(),
            key_pair: None,
            identity_file: None,
            user: "root".into(),
            login_user: "ec2-user".into(),
            spot_price: None,
            ebs_vol_size: 0,
            swap_mb: 1024,
            resume: false,
            parallelism: 20,
            timing: Timing::default(),
        }
    }

    pub fn launch_group(&self) -> String {
        format!("launch-group-{}", self.cluster_name)
    }

    pub fn identity_file(&self) -> Result<&Path> {
        self.identity_file.as_deref().ok_or_else(|| {
            FlotillaError::InvalidArguments("the -i or --identity-file argument is required".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config_from(&dir.path().join("config.toml")).unwrap();
        assert!(config.defaults.key_pair.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn reads_defaults_and_logging() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[defaults]
key-pair = "ops"
identity-file = "~/.ssh/ops.pem"
region = "eu-west-1"
spot-price = 0.12

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();
        let config = parse_config_from(file.path()).unwrap();
        assert_eq!(config.defaults.key_pair.as_deref(), Some("ops"));
        assert_eq!(config.defaults.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.defaults.spot_price, Some(0.12));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[defaults\nkey-pair = ").unwrap();
        let err = parse_config_from(file.path()).unwrap_err();
        assert!(matches!(err, FlotillaError::Config(_)));
    }

    #[test]
    fn credentials_prefer_home_then_system_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home-credentials");
        let system = dir.path().join("system-credentials");
        let env = |key: &str| match key {
            "AWS_ACCESS_KEY_ID" => Some("AKIA".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".to_string()),
            _ => None,
        };

        assert_eq!(
            resolve_credentials_with(&home, &system, env).unwrap(),
            CredentialSource::Environment
        );

        fs::write(&system, "[default]\n").unwrap();
        let source = resolve_credentials_with(&home, &system, env).unwrap();
        assert_eq!(source, CredentialSource::SystemFile(system.clone()));
        assert_eq!(source.credentials_file(), Some(system.clone()));

        fs::write(&home, "[default]\n").unwrap();
        let source = resolve_credentials_with(&home, &system, env).unwrap();
        assert_eq!(source, CredentialSource::HomeFile(home));
        assert_eq!(source.credentials_file(), None);
    }

    #[test]
    fn no_credentials_anywhere_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let only_key_id = |key: &str| (key == "AWS_ACCESS_KEY_ID").then(|| "AKIA".to_string());
        let err = resolve_credentials_with(&dir.path().join("a"), &dir.path().join("b"), only_key_id)
            .unwrap_err();
        assert!(matches!(err, FlotillaError::CredentialsMissing { .. }));
    }

    #[test]
    fn zone_choice_parsing() {
        assert_eq!(ZoneChoice::parse(""), ZoneChoice::Random);
        assert_eq!(ZoneChoice::parse("all"), ZoneChoice::All);
        assert_eq!(ZoneChoice::parse("us-east-1c"), ZoneChoice::Named("us-east-1c".into()));
    }
}
