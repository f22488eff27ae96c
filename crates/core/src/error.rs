use thiserror::Error;

pub type Result<T, E = FlotillaError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FlotillaError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no provider credentials found (checked {checked})")]
    CredentialsMissing { checked: String },

    #[error("could not find image {0}")]
    ImageNotFound(String),

    #[error("could not find any existing cluster named '{0}'")]
    ClusterNotFound(String),

    #[error("there are already active instances in the groups of cluster '{cluster}': {groups}")]
    CapacityConflict { cluster: String, groups: String },

    #[error("provisioning aborted: {reason}; {leaked} instance(s) still present after cleanup")]
    ProvisioningAborted { reason: String, leaked: usize },

    #[error("command failed on {host} after {attempts} attempt(s): {reason}")]
    RemoteCommandFailed {
        host: String,
        attempts: u32,
        reason: String,
    },

    #[error("file copy with {host} failed: {reason}")]
    CopyFailed { host: String, reason: String },

    #[error("step '{step}' failed on {failed} of {total} node(s): {first}")]
    StepFailed {
        step: String,
        failed: usize,
        total: usize,
        first: Box<FlotillaError>,
    },

    #[error("provider call {call} failed: {reason}")]
    Provider { call: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlotillaError {
    pub fn provider(call: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FlotillaError::Provider {
            call: call.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<String> for FlotillaError {
    fn from(message: String) -> Self {
        FlotillaError::Other(message)
    }
}

impl From<&str> for FlotillaError {
    fn from(message: &str) -> Self {
        FlotillaError::Other(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_reports_first_cause() {
        let err = FlotillaError::StepFailed {
            step: "configure".into(),
            failed: 1,
            total: 3,
            first: Box::new(FlotillaError::RemoteCommandFailed {
                host: "ec2-1".into(),
                attempts: 3,
                reason: "exit status 255".into(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("'configure'"));
        assert!(msg.contains("1 of 3"));
        assert!(msg.contains("ec2-1 after 3 attempt(s)"));
    }
}
