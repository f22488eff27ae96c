use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::RetryPolicy;
use tracing::{info, warn};

/// Login on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub user: String,
}

impl Target {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Target {
            host: host.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Why a single remote invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// `None` when the process could not be started or was killed.
    pub exit_code: Option<i32>,
    pub message: String,
}

impl CommandFailure {
    /// ssh reserves 255 for its own errors (refused, unreachable, auth).
    pub fn is_connection_error(&self) -> bool {
        matches!(self.exit_code, None | Some(255))
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit status {}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// One attempt at running or copying something on a node.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec(&self, target: &Target, command: &str) -> std::result::Result<(), CommandFailure>;
    async fn upload(&self, target: &Target, local: &Path, remote: &str) -> std::result::Result<(), CommandFailure>;
    async fn download(&self, target: &Target, remote: &str, local: &Path) -> std::result::Result<(), CommandFailure>;
}

/// Runs commands on nodes, retrying each whole command under `policy`.
/// File copies are attempted once.
pub struct RemoteExecutor<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RemoteExecutor<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        RemoteExecutor { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run(&self, target: &Target, command: &str) -> Result<()> {
        let mut attempts = 0;
        let result = self
            .policy
            .retry(
                |attempt| {
                    attempts = attempt;
                    self.transport.exec(target, command)
                },
                |attempt, failure| {
                    warn!(
                        host = %target.host,
                        attempt,
                        error = %failure,
                        "couldn't run command on host, waiting {}s",
                        self.policy.interval.as_secs()
                    );
                },
            )
            .await;
        result.map_err(|failure| FlotillaError::RemoteCommandFailed {
            host: target.host.clone(),
            attempts,
            reason: failure.to_string(),
        })
    }

    /// Run a test command, `Ok(false)` when it ran and exited non-zero.
    /// Connection failures are retried under the same policy as `run`.
    pub async fn check(&self, target: &Target, command: &str) -> Result<bool> {
        let mut attempts = 0;
        let result = self
            .policy
            .retry(
                |attempt| {
                    attempts = attempt;
                    async move {
                        match self.transport.exec(target, command).await {
                            Ok(()) => Ok(true),
                            Err(failure) if !failure.is_connection_error() => Ok(false),
                            Err(failure) => Err(failure),
                        }
                    }
                },
                |attempt, failure| {
                    warn!(host = %target.host, attempt, error = %failure, "couldn't reach host, retrying check");
                },
            )
            .await;
        result.map_err(|failure| FlotillaError::RemoteCommandFailed {
            host: target.host.clone(),
            attempts,
            reason: failure.to_string(),
        })
    }

    pub async fn put(&self, target: &Target, local: &Path, remote: &str) -> Result<()> {
        info!(host = %target.host, local = %local.display(), remote, "copying file to node");
        self.transport
            .upload(target, local, remote)
            .await
            .map_err(|failure| FlotillaError::CopyFailed {
                host: target.host.clone(),
                reason: failure.to_string(),
            })
    }

    pub async fn get(&self, target: &Target, remote: &str, local: &Path) -> Result<()> {
        info!(host = %target.host, remote, local = %local.display(), "copying file from node");
        self.transport
            .download(target, remote, local)
            .await
            .map_err(|failure| FlotillaError::CopyFailed {
                host: target.host.clone(),
                reason: failure.to_string(),
            })
    }
}
