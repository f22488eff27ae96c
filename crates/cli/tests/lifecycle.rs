mod common;

use common::{test_config, RecordingTransport, Remote};
use flotilla::config::ZoneChoice;
use flotilla::prompt::ScriptedConfirm;
use flotilla::{ClusterState, Controller};
use flotilla_core::testkit::{running_node, MockProvider, ProviderCall};
use flotilla_core::{FlotillaError, InstanceState, Role};

fn run_calls(provider: &MockProvider) -> Vec<(String, String, usize)> {
    provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ProviderCall::RunInstances { group, zone, count } => Some((group, zone, count)),
            _ => None,
        })
        .collect()
}

fn seed_cluster(provider: &MockProvider, name: &str, spot_workers: bool) {
    provider.seed_instance(running_node("i-m", &format!("{name}-master"), None));
    for (i, id) in ["i-w1", "i-w2", "i-w3"].iter().enumerate() {
        let spot = format!("sir-{}", i + 1);
        let spot = spot_workers.then_some(spot.as_str());
        provider.seed_instance(running_node(id, &format!("{name}-slaves"), spot));
    }
    provider.seed_instance(running_node("i-a", &format!("{name}-ambari"), None));
}

#[tokio::test]
async fn launch_spreads_workers_over_all_zones() {
    let provider = MockProvider::new(&["zone-a", "zone-b"]);
    let mut config = test_config("clusterA");
    config.slaves = 3;
    config.zone = ZoneChoice::All;
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let nodes = controller.launch().await.unwrap();
    assert_eq!(controller.state(), ClusterState::Running);
    assert_eq!(nodes.workers().len(), 3);
    assert!(nodes.all().iter().all(|n| n.state == InstanceState::Running));

    let runs = run_calls(&provider);
    let workers: Vec<_> = runs
        .iter()
        .filter(|(group, _, _)| group == "clusterA-slaves")
        .map(|(_, zone, count)| (zone.as_str(), *count))
        .collect();
    assert_eq!(workers, vec![("zone-a", 2), ("zone-b", 1)]);
    assert_eq!(runs.iter().filter(|(g, _, c)| g == "clusterA-master" && *c == 1).count(), 1);
    assert_eq!(runs.iter().filter(|(g, _, c)| g == "clusterA-ambari" && *c == 1).count(), 1);
    assert_eq!(runs.len(), 4);
}

#[tokio::test]
async fn launch_runs_first_boot_steps_in_order() {
    let provider = MockProvider::new(&["zone-a"]);
    let mut config = test_config("bench");
    config.slaves = 2;
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let nodes = controller.launch().await.unwrap();
    let calls = controller.executor().transport().calls();

    let position = |needle: &str| -> Vec<usize> {
        calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.command().is_some_and(|cmd| cmd.contains(needle)))
            .map(|(i, _)| i)
            .collect()
    };
    let enable = position("PermitRootLogin");
    let configure = position("chkconfig iptables off");
    let services = position("mkfs.ext4");
    let ambari = position("ambari-server setup");
    assert_eq!(enable.len(), 4);
    assert_eq!(configure.len(), 4);
    assert_eq!(services.len(), 3);
    assert_eq!(ambari.len(), 1);
    assert!(enable.iter().max() < configure.iter().min());
    assert!(configure.iter().max() < ambari.iter().min());
    assert!(ambari.iter().max() < services.iter().min());

    // root is enabled through the image's login user, everything else runs as root
    for call in &calls {
        if let Remote::Exec { user, command, .. } = call {
            let expected = if command.contains("PermitRootLogin") { "ec2-user" } else { "root" };
            assert_eq!(user, expected, "{command}");
        }
    }

    let uploads: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Remote::Upload { host, remote } => Some((host.clone(), remote.clone())),
            _ => None,
        })
        .collect();
    let master = nodes.control_plane().unwrap().public_dns.clone();
    let aux = nodes.auxiliary().unwrap().public_dns.clone();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.contains(&(master, "~/.ssh/id_rsa".to_string())));
    assert!(uploads.contains(&(aux.clone(), "~/.ssh/id_rsa".to_string())));

    let last = calls.last().unwrap();
    assert_eq!(
        last,
        &Remote::Exec {
            host: aux,
            user: "root".into(),
            command: "ambari-server start; ambari-server status;".into()
        }
    );
}

#[tokio::test]
async fn spot_launch_waits_for_grants_then_configures() {
    let provider = MockProvider::new(&["zone-a"]);
    let mut config = test_config("bench");
    config.slaves = 2;
    config.spot_price = Some(0.15);
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let nodes = controller.launch().await.unwrap();
    assert!(nodes.all().iter().all(|n| n.is_spot()));
    assert_eq!(nodes.workers().len(), 2);
    let calls = provider.calls();
    assert!(!calls.iter().any(|c| matches!(c, ProviderCall::RunInstances { .. })));
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, ProviderCall::RequestSpot { launch_group, .. } if launch_group == "launch-group-bench"))
            .count(),
        3
    );
    assert!(!calls.iter().any(|c| matches!(c, ProviderCall::CancelSpot(_))));
}

#[tokio::test]
async fn launch_refuses_to_double_provision() {
    let provider = MockProvider::new(&["zone-a"]);
    provider.seed_instance(running_node("i-old", "clusterA-slaves", None));
    let config = test_config("clusterA");
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let err = controller.launch().await.unwrap_err();
    match err {
        FlotillaError::CapacityConflict { cluster, groups } => {
            assert_eq!(cluster, "clusterA");
            assert_eq!(groups, "clusterA-slaves");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(run_calls(&provider).is_empty());
    assert!(controller.executor().transport().calls().is_empty());
}

#[tokio::test]
async fn resume_configures_existing_nodes_without_new_capacity() {
    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "bench", false);
    let mut config = test_config("bench");
    config.resume = true;
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let nodes = controller.launch().await.unwrap();
    assert_eq!(nodes.len(), 5);
    assert!(run_calls(&provider).is_empty());
    let enabled = controller
        .executor()
        .transport()
        .calls()
        .iter()
        .filter(|c| c.command().is_some_and(|cmd| cmd.contains("PermitRootLogin")))
        .count();
    assert_eq!(enabled, 5);
}

#[tokio::test]
async fn unknown_image_stops_launch_before_any_capacity_request() {
    let provider = MockProvider::new(&["zone-a"]).with_images(&["ami-other"]);
    let config = test_config("bench");
    let confirm = ScriptedConfirm::default();
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let err = controller.launch().await.unwrap_err();
    assert!(matches!(err, FlotillaError::ImageNotFound(_)));
    assert!(run_calls(&provider).is_empty());
}

#[tokio::test]
async fn unreachable_node_fails_the_step_after_three_attempts() {
    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "bench", false);
    let mut config = test_config("bench");
    config.resume = true;
    let confirm = ScriptedConfirm::default();
    let mut transport = RecordingTransport::default();
    transport.unreachable.insert("i-w2.compute.example.com".into());
    let mut controller = Controller::new(&provider, transport, &config, &confirm);

    let err = controller.launch().await.unwrap_err();
    assert!(matches!(err, FlotillaError::StepFailed { ref step, failed: 1, total: 5, .. } if step == "enable root"));
    assert_eq!(controller.state(), ClusterState::Configuring);

    let calls = controller.executor().transport().calls();
    let to_bad_host = calls
        .iter()
        .filter(|c| matches!(c, Remote::Exec { host, .. } if host == "i-w2.compute.example.com"))
        .count();
    assert_eq!(to_bad_host, 3);
    assert!(!calls.iter().any(|c| c.command().is_some_and(|cmd| cmd.contains("yum"))));
}

#[tokio::test]
async fn stop_terminates_spot_workers_and_stops_the_rest() {
    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "clusterA", true);
    let config = test_config("clusterA");
    let confirm = ScriptedConfirm::new(["y"]);
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let report = controller.stop().await.unwrap();
    assert_eq!(report.stopped, vec!["i-m".to_string(), "i-a".to_string()]);
    assert_eq!(report.terminated, vec!["i-w1".to_string(), "i-w2".to_string(), "i-w3".to_string()]);

    let calls = provider.calls();
    assert!(calls.contains(&ProviderCall::StopInstances(vec!["i-m".into()])));
    assert!(calls.contains(&ProviderCall::StopInstances(vec!["i-a".into()])));
    assert!(calls.contains(&ProviderCall::TerminateInstances(vec![
        "i-w1".into(),
        "i-w2".into(),
        "i-w3".into()
    ])));
    for call in &calls {
        if let ProviderCall::StopInstances(ids) = call {
            assert!(ids.iter().all(|id| !id.starts_with("i-w")));
        }
        if let ProviderCall::TerminateInstances(ids) = call {
            assert!(ids.iter().all(|id| id.starts_with("i-w")));
        }
    }

    let states: Vec<_> = provider.instances().into_iter().map(|n| (n.id, n.state)).collect();
    assert!(states.contains(&("i-w1".to_string(), InstanceState::Terminated)));
    assert!(states.contains(&("i-m".to_string(), InstanceState::Stopped)));
}

#[tokio::test]
async fn stop_without_confirmation_changes_nothing() {
    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "clusterA", true);
    let config = test_config("clusterA");
    let confirm = ScriptedConfirm::new(["N"]);
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    assert!(controller.stop().await.unwrap().is_empty());
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn destroy_declined_makes_no_provider_calls() {
    for answer in ["n", "", "yes", "Y"] {
        let provider = MockProvider::new(&["zone-a"]);
        seed_cluster(&provider, "clusterA", false);
        let config = test_config("clusterA");
        let confirm = ScriptedConfirm::new([answer]);
        let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

        let terminated = controller.destroy().await.unwrap();
        assert!(terminated.is_empty());
        assert!(provider.calls().is_empty(), "answer {answer:?} reached the provider");
        assert_eq!(controller.state(), ClusterState::None);
        assert!(confirm.asked()[0].ends_with("Destroy cluster clusterA (y/N): "));
    }
}

#[tokio::test]
async fn destroy_terminates_every_role() {
    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "clusterA", true);
    provider.seed_instance(running_node("i-x", "other-master", None));
    let config = test_config("clusterA");
    let confirm = ScriptedConfirm::new(["y"]);
    let mut controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    let terminated = controller.destroy().await.unwrap();
    assert_eq!(terminated, vec!["i-a", "i-m", "i-w1", "i-w2", "i-w3"]);
    assert_eq!(controller.state(), ClusterState::Destroyed);
    let survivors: Vec<_> = provider
        .instances()
        .into_iter()
        .filter(|n| n.state != InstanceState::Terminated)
        .map(|n| n.id)
        .collect();
    assert_eq!(survivors, vec!["i-x"]);
}

#[tokio::test]
async fn info_and_get_master_need_a_control_plane() {
    let provider = MockProvider::new(&["zone-a"]);
    provider.seed_instance(running_node("i-w1", "headless-slaves", None));
    let config = test_config("headless");
    let confirm = ScriptedConfirm::default();
    let controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);

    assert!(matches!(controller.info().await, Err(FlotillaError::ClusterNotFound(_))));
    assert!(matches!(controller.get_master().await, Err(FlotillaError::ClusterNotFound(_))));

    let provider = MockProvider::new(&["zone-a"]);
    seed_cluster(&provider, "bench", false);
    let config = test_config("bench");
    let controller = Controller::new(&provider, RecordingTransport::default(), &config, &confirm);
    let nodes = controller.info().await.unwrap();
    assert_eq!(nodes.nodes(Role::Worker).len(), 3);
    assert_eq!(controller.get_master().await.unwrap(), "i-m.compute.example.com");
}
