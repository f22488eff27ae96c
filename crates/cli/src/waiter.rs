use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::{CloudProvider, ClusterNodes, InstanceState, Node, RetryPolicy, Role, SpotRequest, SpotRequestState};
use tracing::{debug, info, warn};

use crate::capacity::SpotBatch;
use crate::resolver;

/// Where each requested reservation stood at the last poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotProgress {
    /// Instance ids of granted requests, by role.
    pub granted: BTreeMap<Role, Vec<String>>,
    /// Request ids that have been granted.
    pub active: Vec<String>,
    pub open: Vec<String>,
    /// Requested but not reported back by the provider.
    pub missing: Vec<String>,
    /// Closed, cancelled or failed; these will never produce an instance.
    pub dead: Vec<String>,
}

impl SpotProgress {
    pub fn classify(batch: &SpotBatch, observed: &[SpotRequest]) -> SpotProgress {
        let by_id: HashMap<&str, &SpotRequest> = observed.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut progress = SpotProgress::default();
        for (role, ids) in &batch.requests {
            for id in ids {
                match by_id.get(id.as_str()) {
                    Some(SpotRequest {
                        state: SpotRequestState::Active,
                        instance_id: Some(instance),
                        ..
                    }) => {
                        progress.granted.entry(*role).or_default().push(instance.clone());
                        progress.active.push(id.clone());
                    }
                    Some(request) if request.state.is_dead() => progress.dead.push(id.clone()),
                    Some(_) => progress.open.push(id.clone()),
                    None => progress.missing.push(id.clone()),
                }
            }
        }
        progress
    }

    pub fn granted_count(&self, role: Role) -> usize {
        self.granted.get(&role).map_or(0, Vec::len)
    }

    pub fn is_satisfied(&self, batch: &SpotBatch) -> bool {
        Role::ALL
            .iter()
            .all(|role| self.granted_count(*role) == batch.desired(*role))
    }

    /// Requests of `batch` that have not been granted.
    pub fn outstanding(&self, batch: &SpotBatch) -> Vec<String> {
        batch
            .all_ids()
            .into_iter()
            .filter(|id| !self.active.contains(id))
            .collect()
    }
}

/// Poll the reservations of `batch` until every role has its instances.
///
/// Any failure while polling, including a reservation the provider refuses,
/// cancels the outstanding reservations, checks for instances that were
/// granted before the cancel, and aborts with `ProvisioningAborted`.
pub async fn wait_for_spot(
    provider: &dyn CloudProvider,
    policy: RetryPolicy,
    batch: &SpotBatch,
    cluster: &str,
    progress: &(dyn Fn(String) + Sync),
) -> Result<ClusterNodes> {
    let ids = batch.all_ids();
    let last: Mutex<Option<SpotProgress>> = Mutex::new(None);

    let polled: Result<Option<BTreeMap<Role, Vec<String>>>> = policy
        .poll_until(|_| {
            let (ids, last) = (&ids, &last);
            async move {
                let observed = provider.describe_spot_requests(ids).await?;
                let current = SpotProgress::classify(batch, &observed);
                let dead = current.dead.clone();
                let satisfied = current.is_satisfied(batch);
                let granted = current.granted.clone();
                let workers = current.granted_count(Role::Worker);
                *lock(last) = Some(current);

                if !dead.is_empty() {
                    return Err(FlotillaError::provider(
                        "describe-spot-instance-requests",
                        format!("spot requests {} will not be fulfilled", dead.join(", ")),
                    ));
                }
                if satisfied {
                    return Ok(Some(granted));
                }
                progress(format!(
                    "{} of {} slaves granted, waiting longer",
                    workers, batch.desired_workers
                ));
                debug!(workers, desired = batch.desired_workers, "spot batch not yet satisfied");
                Ok(None)
            }
        })
        .await;

    let granted = match polled {
        Ok(Some(granted)) => granted,
        Ok(None) => {
            let last = lock(&last).take();
            return Err(abort(provider, batch, last, cluster, "spot requests were not granted in time".into()).await);
        }
        Err(e) => {
            warn!(error = %e, "spot polling failed");
            let last = lock(&last).take();
            return Err(abort(provider, batch, last, cluster, e.to_string()).await);
        }
    };

    info!(slaves = batch.desired_workers, "all spot requests granted");
    let instance_ids: Vec<String> = granted.values().flatten().cloned().collect();
    let role_by_instance: HashMap<String, Role> = granted
        .iter()
        .flat_map(|(role, ids)| ids.iter().map(move |id| (id.clone(), *role)))
        .collect();

    let mut nodes = ClusterNodes::new();
    for node in wait_for_instances(provider, policy, &instance_ids).await? {
        if let Some(role) = role_by_instance.get(&node.id) {
            nodes.push(*role, node);
        }
    }
    Ok(nodes)
}

async fn abort(
    provider: &dyn CloudProvider,
    batch: &SpotBatch,
    last: Option<SpotProgress>,
    cluster: &str,
    reason: String,
) -> FlotillaError {
    let outstanding = match &last {
        Some(progress) => progress.outstanding(batch),
        None => batch.all_ids(),
    };
    info!(count = outstanding.len(), "cancelling spot instance requests");
    let mut clean = true;
    if let Err(e) = provider.cancel_spot_requests(&outstanding).await {
        warn!(error = %e, "could not cancel spot instance requests");
        clean = false;
    }

    let leaked = match resolver::resolve(provider, cluster, false).await {
        Ok(nodes) => nodes.len(),
        Err(e) => {
            warn!(error = %e, "could not check for instances left running");
            clean = false;
            0
        }
    };
    if leaked > 0 {
        warn!(leaked, "{} instances are still running", leaked);
    }
    if !clean {
        warn!(cluster, "cleanup could not be confirmed; check the provider console for stray capacity");
    }
    FlotillaError::ProvisioningAborted { reason, leaked }
}

/// Poll `ids` until every one is visible and none is `pending`, returning
/// their latest state.
pub async fn wait_for_instances(provider: &dyn CloudProvider, policy: RetryPolicy, ids: &[String]) -> Result<Vec<Node>> {
    let settled: Option<Vec<Node>> = policy
        .poll_until(|_| async move {
            let nodes = provider.describe_instances(Some(ids)).await?;
            let unseen = ids.iter().filter(|id| !nodes.iter().any(|n| &n.id == *id)).count();
            let pending = nodes.iter().filter(|n| n.state == InstanceState::Pending).count();
            if unseen > 0 || pending > 0 {
                debug!(unseen, pending, "instances not settled");
                Ok::<_, FlotillaError>(None)
            } else {
                Ok(Some(nodes))
            }
        })
        .await?;
    settled.ok_or_else(|| FlotillaError::Other("instances did not leave the pending state".into()))
}

/// Wait for every node of the cluster to leave `pending`, then give the
/// nodes `settle` more time to boot. Returns the refreshed nodes.
pub async fn wait_for_cluster(
    provider: &dyn CloudProvider,
    policy: RetryPolicy,
    settle: Duration,
    nodes: &ClusterNodes,
) -> Result<ClusterNodes> {
    info!("waiting for instances to start up");
    let role_by_id: HashMap<String, Role> = nodes
        .roles()
        .flat_map(|(role, nodes)| nodes.iter().map(move |n| (n.id.clone(), role)))
        .collect();

    let mut refreshed = ClusterNodes::new();
    for node in wait_for_instances(provider, policy, &nodes.ids()).await? {
        if let Some(role) = role_by_id.get(&node.id) {
            refreshed.push(*role, node);
        }
    }

    if !settle.is_zero() {
        info!("waiting {} more seconds", settle.as_secs());
        tokio::time::sleep(settle).await;
    }
    Ok(refreshed)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
