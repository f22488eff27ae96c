use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::{CloudProvider, ClusterNodes, Role};
use tracing::info;

/// Find the active nodes of `cluster` by security group membership.
///
/// A node belongs to a role when its group set is exactly the role's group.
/// With `die_on_missing`, a cluster without a control-plane node is an error;
/// otherwise whatever was found is returned, possibly nothing.
pub async fn resolve(provider: &dyn CloudProvider, cluster: &str, die_on_missing: bool) -> Result<ClusterNodes> {
    info!(cluster, "searching for existing cluster");
    let expected: Vec<(Role, Vec<String>)> = Role::ALL
        .iter()
        .map(|role| (*role, vec![role.group_name(cluster)]))
        .collect();

    let mut nodes = ClusterNodes::new();
    for node in provider.describe_instances(None).await? {
        if !node.state.is_active() {
            continue;
        }
        if let Some((role, _)) = expected.iter().find(|(_, groups)| *groups == node.security_groups) {
            nodes.push(*role, node);
        }
    }

    if !nodes.is_empty() {
        info!(
            cluster,
            masters = nodes.nodes(Role::ControlPlane).len(),
            slaves = nodes.workers().len(),
            ambari = nodes.nodes(Role::Auxiliary).len(),
            "found existing nodes"
        );
    }

    if die_on_missing && nodes.control_plane().is_none() {
        return Err(FlotillaError::ClusterNotFound(cluster.to_string()));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::testkit::{running_node, MockProvider};
    use flotilla_core::InstanceState;

    fn provider() -> MockProvider {
        let provider = MockProvider::new(&["zone-a"]);
        provider.seed_instance(running_node("i-m", "bench-master", None));
        provider.seed_instance(running_node("i-w1", "bench-slaves", Some("sir-1")));
        provider.seed_instance(running_node("i-a", "bench-ambari", None));
        provider.seed_instance(running_node("i-other", "other-master", None));
        provider.seed_instance(running_node("i-mixed", "bench-slaves", None));
        let mut dead = running_node("i-dead", "bench-slaves", None);
        dead.state = InstanceState::Terminated;
        provider.seed_instance(dead);
        let mut stopped = running_node("i-stopped", "bench-slaves", None);
        stopped.state = InstanceState::Stopped;
        provider.seed_instance(stopped);
        let mut two_groups = running_node("i-two", "bench-slaves", None);
        two_groups.security_groups.push("bench-master".into());
        provider.seed_instance(two_groups);
        provider
    }

    #[tokio::test]
    async fn partitions_active_nodes_by_exact_group() {
        let provider = provider();
        let nodes = resolve(&provider, "bench", true).await.unwrap();
        assert_eq!(nodes.control_plane().unwrap().id, "i-m");
        assert_eq!(nodes.auxiliary().unwrap().id, "i-a");
        let workers: Vec<_> = nodes.workers().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(workers, vec!["i-w1", "i-mixed", "i-stopped"]);
    }

    #[tokio::test]
    async fn resolving_twice_gives_identical_membership() {
        let provider = provider();
        let first = resolve(&provider, "bench", false).await.unwrap();
        let second = resolve(&provider, "bench", false).await.unwrap();
        assert_eq!(first.ids_by_role(), second.ids_by_role());
    }

    #[tokio::test]
    async fn missing_control_plane_fails_only_when_asked() {
        let provider = MockProvider::new(&["zone-a"]);
        provider.seed_instance(running_node("i-w1", "lonely-slaves", None));

        let err = resolve(&provider, "lonely", true).await.unwrap_err();
        assert!(matches!(err, FlotillaError::ClusterNotFound(name) if name == "lonely"));

        let nodes = resolve(&provider, "lonely", false).await.unwrap();
        assert_eq!(nodes.workers().len(), 1);
        assert!(nodes.control_plane().is_none());
    }

    #[tokio::test]
    async fn unknown_cluster_is_empty() {
        let provider = provider();
        assert!(resolve(&provider, "nobody", false).await.unwrap().is_empty());
    }
}
