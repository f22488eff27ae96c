use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flotilla_core::error::{FlotillaError, Result};
use tokio::process::Command;
use tracing::debug;

use crate::remote::{CommandFailure, Target, Transport};

/// Host keys are not verified: cluster nodes are fresh instances whose keys
/// cannot be known in advance, and the nodes live on a trusted network.
/// Anyone able to intercept traffic to them could impersonate a node.
const HOST_KEY_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// `ssh`/`scp` subprocesses authenticated by one private key file.
/// A new session is opened for every call.
pub struct SshTransport {
    identity_file: PathBuf,
}

impl SshTransport {
    pub fn new(identity_file: impl Into<PathBuf>) -> Self {
        SshTransport {
            identity_file: identity_file.into(),
        }
    }

    fn ssh_args(&self, target: &Target, command: &str) -> Vec<String> {
        let mut args = vec!["-t".to_string(), "-t".to_string()];
        args.extend(HOST_KEY_OPTIONS.iter().map(|s| s.to_string()));
        args.push("-i".to_string());
        args.push(self.identity_file.display().to_string());
        args.push(target.to_string());
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(HOST_KEY_OPTIONS.iter().map(|s| s.to_string()));
        args.push("-i".to_string());
        args.push(self.identity_file.display().to_string());
        args.push(from);
        args.push(to);
        args
    }

    async fn status(program: &str, args: Vec<String>) -> std::result::Result<(), CommandFailure> {
        debug!(program, ?args, "spawning");
        let status = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| CommandFailure {
                exit_code: None,
                message: format!("failed to execute {}: {}", program, e),
            })?;

        if !status.success() {
            return Err(CommandFailure {
                exit_code: status.code(),
                message: format!("{} exited unsuccessfully", program),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, target: &Target, command: &str) -> std::result::Result<(), CommandFailure> {
        SshTransport::status("ssh", self.ssh_args(target, command)).await
    }

    async fn upload(&self, target: &Target, local: &Path, remote: &str) -> std::result::Result<(), CommandFailure> {
        let to = format!("{}:{}", target, remote);
        SshTransport::status("scp", self.scp_args(local.display().to_string(), to)).await
    }

    async fn download(&self, target: &Target, remote: &str, local: &Path) -> std::result::Result<(), CommandFailure> {
        let from = format!("{}:{}", target, remote);
        SshTransport::status("scp", self.scp_args(from, local.display().to_string())).await
    }
}

/// Hand the terminal to an interactive ssh session on `target`, optionally
/// opening a SOCKS proxy at `proxy` (`[ADDRESS:]PORT`).
pub fn login(identity_file: &Path, target: &Target, proxy: Option<&str>) -> Result<()> {
    let mut cmd = std::process::Command::new("ssh");
    cmd.args(HOST_KEY_OPTIONS).arg("-i").arg(identity_file);
    if let Some(proxy) = proxy {
        cmd.arg("-D").arg(proxy);
    }
    cmd.arg(target.to_string());

    let status = cmd
        .status()
        .map_err(|e| FlotillaError::Other(format!("Failed to execute ssh: {}", e)))?;
    if !status.success() {
        return Err(FlotillaError::RemoteCommandFailed {
            host: target.host.clone(),
            attempts: 1,
            reason: format!("ssh exited with {}", status),
        });
    }
    Ok(())
}
