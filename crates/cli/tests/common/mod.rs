#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use flotilla::config::{ClusterConfig, Timing, ZoneChoice};
use flotilla::remote::{CommandFailure, Target, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    Exec { host: String, user: String, command: String },
    Upload { host: String, remote: String },
    Download { host: String, remote: String },
}

impl Remote {
    pub fn command(&self) -> Option<&str> {
        match self {
            Remote::Exec { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Succeeds for every host except the unreachable ones, recording each call.
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Mutex<Vec<Remote>>,
    pub unreachable: HashSet<String>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<Remote> {
        self.calls.lock().unwrap().clone()
    }

    fn outcome(&self, host: &str) -> Result<(), CommandFailure> {
        if self.unreachable.contains(host) {
            Err(CommandFailure {
                exit_code: Some(255),
                message: format!("ssh: connect to host {} port 22: Connection refused", host),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn exec(&self, target: &Target, command: &str) -> Result<(), CommandFailure> {
        self.calls.lock().unwrap().push(Remote::Exec {
            host: target.host.clone(),
            user: target.user.clone(),
            command: command.to_string(),
        });
        self.outcome(&target.host)
    }

    async fn upload(&self, target: &Target, _local: &Path, remote: &str) -> Result<(), CommandFailure> {
        self.calls.lock().unwrap().push(Remote::Upload {
            host: target.host.clone(),
            remote: remote.to_string(),
        });
        self.outcome(&target.host)
    }

    async fn download(&self, target: &Target, remote: &str, _local: &Path) -> Result<(), CommandFailure> {
        self.calls.lock().unwrap().push(Remote::Download {
            host: target.host.clone(),
            remote: remote.to_string(),
        });
        self.outcome(&target.host)
    }
}

/// A launchable config with every wait set to zero.
pub fn test_config(name: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(name);
    config.ami = "ami-test".into();
    config.key_pair = Some("ops".into());
    config.identity_file = Some("/keys/ops.pem".into());
    config.zone = ZoneChoice::Named("zone-a".into());
    config.timing = Timing::immediate();
    config
}
