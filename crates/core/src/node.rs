use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Logical function of a node within a cluster.
///
/// A cluster has no stored representation: membership is derived from the
/// security group an instance was launched into, `<cluster>-<suffix>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
    Auxiliary,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::ControlPlane, Role::Worker, Role::Auxiliary];

    pub fn suffix(&self) -> &'static str {
        match self {
            Role::ControlPlane => "master",
            Role::Worker => "slaves",
            Role::Auxiliary => "ambari",
        }
    }

    pub fn group_name(&self, cluster: &str) -> String {
        format!("{}-{}", cluster, self.suffix())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::ControlPlane => "master",
            Role::Worker => "slave",
            Role::Auxiliary => "ambari",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// Usable for cluster operations. Stopped nodes count because a stopped
    /// cluster can be started again.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending
                | InstanceState::Running
                | InstanceState::Stopping
                | InstanceState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "shutting-down" => Ok(InstanceState::ShuttingDown),
            "terminated" => Ok(InstanceState::Terminated),
            "stopping" => Ok(InstanceState::Stopping),
            "stopped" => Ok(InstanceState::Stopped),
            other => Err(format!("unknown instance state '{}'", other)),
        }
    }
}

/// A provider compute instance as last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub public_dns: String,
    pub private_dns: String,
    pub state: InstanceState,
    pub zone: String,
    pub security_groups: Vec<String>,
    pub spot_request_id: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_spot(&self) -> bool {
        self.spot_request_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub rule_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
}

impl SpotRequestState {
    /// The request can no longer produce an instance.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            SpotRequestState::Closed | SpotRequestState::Cancelled | SpotRequestState::Failed
        )
    }
}

impl FromStr for SpotRequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SpotRequestState::Open),
            "active" => Ok(SpotRequestState::Active),
            "closed" => Ok(SpotRequestState::Closed),
            "cancelled" => Ok(SpotRequestState::Cancelled),
            "failed" => Ok(SpotRequestState::Failed),
            other => Err(format!("unknown spot request state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotRequest {
    pub id: String,
    pub state: SpotRequestState,
    pub instance_id: Option<String>,
}

/// The nodes of one cluster, partitioned by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterNodes {
    by_role: BTreeMap<Role, Vec<Node>>,
}

impl ClusterNodes {
    pub fn new() -> Self {
        ClusterNodes::default()
    }

    pub fn push(&mut self, role: Role, node: Node) {
        self.by_role.entry(role).or_default().push(node);
    }

    pub fn extend(&mut self, role: Role, nodes: impl IntoIterator<Item = Node>) {
        self.by_role.entry(role).or_default().extend(nodes);
    }

    pub fn nodes(&self, role: Role) -> &[Node] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn control_plane(&self) -> Option<&Node> {
        self.nodes(Role::ControlPlane).first()
    }

    pub fn auxiliary(&self) -> Option<&Node> {
        self.nodes(Role::Auxiliary).first()
    }

    pub fn workers(&self) -> &[Node] {
        self.nodes(Role::Worker)
    }

    /// Every node in role order: control plane, workers, auxiliary.
    pub fn all(&self) -> Vec<&Node> {
        Role::ALL.iter().flat_map(|r| self.nodes(*r)).collect()
    }

    pub fn roles(&self) -> impl Iterator<Item = (Role, &[Node])> {
        Role::ALL.into_iter().map(move |r| (r, self.nodes(r)))
    }

    pub fn len(&self) -> usize {
        self.by_role.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.all().into_iter().map(|n| n.id.clone()).collect()
    }

    pub fn ids_by_role(&self) -> BTreeMap<Role, BTreeSet<String>> {
        self.roles()
            .map(|(role, nodes)| (role, nodes.iter().map(|n| n.id.clone()).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, state: InstanceState) -> Node {
        Node {
            id: id.into(),
            public_dns: format!("{}.public", id),
            private_dns: format!("{}.internal", id),
            state,
            zone: "us-east-1a".into(),
            security_groups: vec![],
            spot_request_id: None,
            launch_time: None,
        }
    }

    #[test]
    fn group_names_follow_cluster_name() {
        assert_eq!(Role::ControlPlane.group_name("bench"), "bench-master");
        assert_eq!(Role::Worker.group_name("bench"), "bench-slaves");
        assert_eq!(Role::Auxiliary.group_name("bench"), "bench-ambari");
    }

    #[test]
    fn stopped_nodes_are_active_terminated_are_not() {
        assert!(InstanceState::Stopped.is_active());
        assert!(InstanceState::Pending.is_active());
        assert!(!InstanceState::Terminated.is_active());
        assert!(!InstanceState::ShuttingDown.is_active());
    }

    #[test]
    fn parses_provider_state_names() {
        assert_eq!("shutting-down".parse(), Ok(InstanceState::ShuttingDown));
        assert!("rebooting".parse::<InstanceState>().is_err());
        assert_eq!("active".parse(), Ok(SpotRequestState::Active));
    }

    #[test]
    fn all_lists_nodes_in_role_order() {
        let mut nodes = ClusterNodes::new();
        nodes.push(Role::Auxiliary, node("i-aux", InstanceState::Running));
        nodes.push(Role::Worker, node("i-w1", InstanceState::Running));
        nodes.push(Role::ControlPlane, node("i-m", InstanceState::Running));
        let ids: Vec<_> = nodes.all().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["i-m", "i-w1", "i-aux"]);
        assert_eq!(nodes.len(), 3);
        assert!(nodes.workers().len() == 1);
    }
}
