use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::{CloudProvider, ClusterNodes, IngressRule, InstanceState, Node, Role, SecurityGroup};
use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::bootstrap;
use crate::bulk_copy::{BulkCopy, CopySpec, DistCpJob, JobHandle};
use crate::capacity::{resolve_zones, CapacityRequester, Provisioned};
use crate::config::ClusterConfig;
use crate::fanout::map_concurrent;
use crate::prompt::Confirm;
use crate::remote::{RemoteExecutor, Target, Transport};
use crate::resolver;
use crate::spinner::hidden_spinner;
use crate::waiter;

/// Where the controller is in the cluster lifecycle during this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    None,
    Launching,
    Configuring,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::None => "none",
            ClusterState::Launching => "launching",
            ClusterState::Configuring => "configuring",
            ClusterState::Running => "running",
            ClusterState::Stopping => "stopping",
            ClusterState::Stopped => "stopped",
            ClusterState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// What `stop` did to each node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    /// Spot-backed nodes, which cannot be restarted and so were terminated.
    pub terminated: Vec<String>,
}

impl StopReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.terminated.is_empty()
    }
}

/// Drives launch, info, stop and destroy for one named cluster.
///
/// Nothing is remembered between runs: every action starts by asking the
/// provider which instances belong to the cluster.
pub struct Controller<'a, T> {
    provider: &'a dyn CloudProvider,
    executor: RemoteExecutor<T>,
    config: &'a ClusterConfig,
    confirm: &'a dyn Confirm,
    spinner: ProgressBar,
    state: ClusterState,
}

impl<'a, T: Transport> Controller<'a, T> {
    pub fn new(provider: &'a dyn CloudProvider, transport: T, config: &'a ClusterConfig, confirm: &'a dyn Confirm) -> Self {
        Controller {
            provider,
            executor: RemoteExecutor::new(transport, config.timing.ssh_retry),
            config,
            confirm,
            spinner: hidden_spinner(),
            state: ClusterState::None,
        }
    }

    pub fn with_spinner(mut self, spinner: ProgressBar) -> Self {
        self.spinner = spinner;
        self
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn executor(&self) -> &RemoteExecutor<T> {
        &self.executor
    }

    fn cluster(&self) -> &str {
        &self.config.cluster_name
    }

    fn transition(&mut self, next: ClusterState) {
        info!(cluster = %self.config.cluster_name, from = %self.state, to = %next, "cluster state");
        self.state = next;
    }

    /// Find or create the per-role security groups. Only groups created by
    /// this call get rules; existing groups are used as they are.
    pub async fn ensure_security_groups(&self) -> Result<BTreeMap<Role, SecurityGroup>> {
        let mut groups = BTreeMap::new();
        let mut created = Vec::new();
        for role in Role::ALL {
            let name = role.group_name(self.cluster());
            let group = match self.provider.find_security_group(&name).await? {
                Some(group) => group,
                None => {
                    info!(group = %name, "creating security group");
                    let description = format!("{} group for cluster {}", role, self.cluster());
                    created.push(role);
                    self.provider.create_security_group(&name, &description).await?
                }
            };
            groups.insert(role, group);
        }

        for role in created {
            let group = &groups[&role];
            for source in groups.values() {
                self.provider.authorize_group_ingress(group, source).await?;
            }
            self.provider.authorize_cidr_ingress(group, &IngressRule::open_tcp()).await?;
        }
        Ok(groups)
    }

    /// Bring the cluster up and configure it.
    ///
    /// Without `resume`, refuses to run when any instance already carries
    /// the cluster's groups. With it, configures the nodes that exist.
    pub async fn launch(&mut self) -> Result<ClusterNodes> {
        self.transition(ClusterState::Launching);
        self.config.identity_file()?;
        self.spinner.set_message("Setting up security groups...");
        self.ensure_security_groups().await?;

        let nodes = if self.config.resume {
            self.spinner.set_message("Searching for existing cluster...");
            let nodes = resolver::resolve(self.provider, self.cluster(), true).await?;
            waiter::wait_for_cluster(self.provider, self.config.timing.instance_poll, std::time::Duration::ZERO, &nodes).await?
        } else {
            self.provision().await?
        };

        self.transition(ClusterState::Configuring);
        self.setup_cluster(&nodes).await?;
        self.transition(ClusterState::Running);
        self.spinner.finish_and_clear();
        Ok(nodes)
    }

    async fn provision(&self) -> Result<ClusterNodes> {
        let existing = resolver::resolve(self.provider, self.cluster(), false).await?;
        if !existing.is_empty() {
            let groups: Vec<String> = existing
                .roles()
                .filter(|(_, nodes)| !nodes.is_empty())
                .map(|(role, _)| role.group_name(self.cluster()))
                .collect();
            return Err(FlotillaError::CapacityConflict {
                cluster: self.cluster().to_string(),
                groups: groups.join(", "),
            });
        }

        let zones = resolve_zones(self.provider, &self.config.zone).await?;
        self.spinner.set_message("Requesting capacity...");
        let provisioned = CapacityRequester::new(self.provider, self.config)
            .request(&zones)
            .await?;

        let nodes = match provisioned {
            Provisioned::OnDemand(nodes) => nodes,
            Provisioned::Spot(batch) => {
                self.spinner.set_message("Waiting for spot instances to be granted...");
                let spinner = &self.spinner;
                waiter::wait_for_spot(
                    self.provider,
                    self.config.timing.spot_poll,
                    &batch,
                    self.cluster(),
                    &|message| spinner.set_message(message),
                )
                .await?
            }
        };

        self.spinner.set_message("Waiting for instances to start up...");
        waiter::wait_for_cluster(
            self.provider,
            self.config.timing.instance_poll,
            self.config.timing.post_launch_wait,
            &nodes,
        )
        .await
    }

    /// First-boot configuration. Each step finishes on every node before the
    /// next starts; a step that fails anywhere ends the sequence.
    pub async fn setup_cluster(&self, nodes: &ClusterNodes) -> Result<()> {
        let master = nodes
            .control_plane()
            .ok_or_else(|| FlotillaError::ClusterNotFound(self.cluster().to_string()))?;
        let aux = nodes.auxiliary().ok_or_else(|| {
            warn!(cluster = %self.cluster(), "cluster has no ambari node");
            FlotillaError::ClusterNotFound(self.cluster().to_string())
        })?;
        let all = nodes.all();
        let user = self.config.user.as_str();

        self.spinner.set_message("Enabling root on all nodes...");
        let enable_root = bootstrap::enable_root(&self.config.login_user);
        self.run_everywhere("enable root", &all, &self.config.login_user, &enable_root)
            .await?;

        self.spinner.set_message("Copying SSH key to ambari & master...");
        let identity = self.config.identity_file()?;
        let key_holders = [aux, master];
        self.step("deploy key", &key_holders, |node| {
            let target = Target::new(node.public_dns.clone(), user);
            async move {
                self.executor.run(&target, &bootstrap::prepare_key_dir()).await?;
                self.executor.put(&target, identity, bootstrap::REMOTE_KEY_PATH).await?;
                self.executor.run(&target, &bootstrap::lock_key()).await
            }
        })
        .await?;

        self.spinner.set_message("Configuring nodes...");
        self.run_everywhere("configure", &all, user, &bootstrap::configure_node())
            .await?;

        self.spinner.set_message("Waiting for nodes to come back from reboot...");
        waiter::wait_for_cluster(
            self.provider,
            self.config.timing.instance_poll,
            self.config.timing.reboot_wait,
            nodes,
        )
        .await?;

        self.spinner.set_message("Setting up ambari node...");
        self.run_everywhere("setup ambari", &[aux], user, &bootstrap::setup_auxiliary())
            .await?;

        self.spinner.set_message("Starting all services...");
        let mut service_nodes: Vec<&Node> = vec![master];
        service_nodes.extend(nodes.workers());
        let start = bootstrap::start_services(self.config.swap_mb, self.config.ebs_vol_size > 0);
        self.run_everywhere("start services", &service_nodes, user, &start)
            .await?;

        self.run_everywhere("start ambari", &[aux], user, bootstrap::AUX_START)
            .await
    }

    async fn run_everywhere(&self, step: &str, nodes: &[&Node], user: &str, command: &str) -> Result<()> {
        self.step(step, nodes, |node| {
            let target = Target::new(node.public_dns.clone(), user);
            async move { self.executor.run(&target, command).await }
        })
        .await
    }

    /// Fan `op` out over `nodes` and fold the per-node outcomes into one.
    async fn step<'n, F, Fut>(&self, step: &str, nodes: &'n [&'n Node], op: F) -> Result<()>
    where
        F: Fn(&'n &'n Node) -> Fut,
        Fut: Future<Output = Result<()>> + 'n,
    {
        info!(step, nodes = nodes.len(), "running step");
        let results = map_concurrent(nodes, self.config.parallelism, op).await;
        let total = results.len();

        let mut failures = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            if let Err(e) = result {
                warn!(step, host = %node.public_dns, error = %e, "step failed on node");
                failures.push(e);
            }
        }
        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(FlotillaError::StepFailed {
                step: step.to_string(),
                failed,
                total,
                first: Box::new(first),
            }),
        }
    }

    /// Current members of the cluster; fails when there is no control plane.
    pub async fn info(&self) -> Result<ClusterNodes> {
        resolver::resolve(self.provider, self.cluster(), true).await
    }

    pub async fn get_master(&self) -> Result<String> {
        let nodes = self.info().await?;
        nodes
            .control_plane()
            .map(|n| n.public_dns.clone())
            .ok_or_else(|| FlotillaError::ClusterNotFound(self.cluster().to_string()))
    }

    pub fn stop_prompt(&self) -> String {
        let name = self.cluster();
        format!(
            "Are you sure you want to stop the cluster {name}?\n\
             DATA ON EPHEMERAL DISKS WILL BE LOST, BUT THE CLUSTER WILL KEEP USING SPACE ON\n\
             AMAZON EBS IF IT IS EBS-BACKED!!\n\
             Spot-backed nodes cannot be stopped: they will be TERMINATED and all their data lost.\n\
             Stop cluster {name} (y/N): "
        )
    }

    pub fn destroy_prompt(&self) -> String {
        let name = self.cluster();
        format!(
            "Are you sure you want to destroy the cluster {name}?\n\
             ALL DATA ON ALL NODES WILL BE LOST!!\n\
             Destroy cluster {name} (y/N): "
        )
    }

    /// Stop on-demand nodes and terminate spot-backed ones.
    ///
    /// The provider cannot restart a stopped spot instance, so stopping one
    /// would only strand it. Nothing happens unless the operator answers `y`.
    pub async fn stop(&mut self) -> Result<StopReport> {
        if !self.confirm.confirm(&self.stop_prompt())? {
            info!(cluster = %self.cluster(), "not stopping cluster");
            return Ok(StopReport::default());
        }

        let nodes = resolver::resolve(self.provider, self.cluster(), false).await?;
        if nodes.is_empty() {
            return Err(FlotillaError::ClusterNotFound(self.cluster().to_string()));
        }
        self.transition(ClusterState::Stopping);

        let mut report = StopReport::default();
        for role in [Role::ControlPlane, Role::Worker, Role::Auxiliary] {
            let (spot, on_demand): (Vec<&Node>, Vec<&Node>) = nodes
                .nodes(role)
                .iter()
                .filter(|n| !stop_skips(n.state))
                .partition(|n| n.is_spot());
            let spot: Vec<String> = spot.into_iter().map(|n| n.id.clone()).collect();
            let on_demand: Vec<String> = on_demand.into_iter().map(|n| n.id.clone()).collect();

            if !on_demand.is_empty() {
                info!(role = %role, count = on_demand.len(), "stopping {} nodes", role);
                self.provider.stop_instances(&on_demand).await?;
            }
            if !spot.is_empty() {
                warn!(
                    role = %role,
                    count = spot.len(),
                    "terminating spot-backed {} nodes instead of stopping them",
                    role
                );
                self.provider.terminate_instances(&spot).await?;
            }
            report.stopped.extend(on_demand);
            report.terminated.extend(spot);
        }

        self.transition(ClusterState::Stopped);
        Ok(report)
    }

    /// Terminate every node of the cluster after an explicit `y`. Any other
    /// answer returns before the provider is contacted.
    pub async fn destroy(&mut self) -> Result<Vec<String>> {
        if !self.confirm.confirm(&self.destroy_prompt())? {
            info!(cluster = %self.cluster(), "not destroying cluster");
            return Ok(Vec::new());
        }

        let nodes = resolver::resolve(self.provider, self.cluster(), false).await?;
        if nodes.is_empty() {
            return Err(FlotillaError::ClusterNotFound(self.cluster().to_string()));
        }

        let mut terminated = Vec::new();
        for role in [Role::Auxiliary, Role::ControlPlane, Role::Worker] {
            let ids: Vec<String> = nodes.nodes(role).iter().map(|n| n.id.clone()).collect();
            if ids.is_empty() {
                continue;
            }
            info!(role = %role, count = ids.len(), "terminating {} nodes", role);
            self.provider.terminate_instances(&ids).await?;
            terminated.extend(ids);
        }

        self.transition(ClusterState::Destroyed);
        Ok(terminated)
    }

    /// Start the management service on the auxiliary node; returns its address.
    pub async fn aux_start(&self) -> Result<String> {
        let nodes = self.info().await?;
        let aux = nodes
            .auxiliary()
            .ok_or_else(|| FlotillaError::ClusterNotFound(self.cluster().to_string()))?;
        let target = Target::new(aux.public_dns.clone(), self.config.user.clone());
        self.executor.run(&target, bootstrap::AUX_START).await?;
        Ok(aux.public_dns.clone())
    }

    /// Control-plane login target for an interactive session.
    pub async fn login_target(&self) -> Result<Target> {
        let master = self.get_master().await?;
        Ok(Target::new(master, self.config.user.clone()))
    }

    /// Run a bulk copy on the cluster and wait for it to finish.
    pub async fn copy_data(&self, spec: &CopySpec) -> Result<JobHandle> {
        let target = self.login_target().await?;
        let job = DistCpJob::new(&self.executor, target, self.config.timing.copy_poll);
        self.spinner.set_message(format!("Copying {} to {}...", spec.source, spec.dest));
        let handle = job.submit(spec).await?;
        job.await_completion(&handle).await?;
        self.spinner.finish_and_clear();
        Ok(handle)
    }
}

/// States `stop` leaves alone. A `stopped` node is not among them: a
/// stopped spot-backed node still holds capacity and must be terminated.
fn stop_skips(state: InstanceState) -> bool {
    matches!(
        state,
        InstanceState::ShuttingDown | InstanceState::Terminated | InstanceState::Stopping
    )
}
