//! Error type for provisioning operations.
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Missing prerequisite {tool}: {cause}")]
    PrerequisiteMissing { tool: String, cause: String },

    /// One persisted tuning file or kernel parameter could not be written.
    /// Best-effort: collected as a warning, never halts the run.
    #[error("Tuning write failed for {target}: {cause}")]
    TuningWrite { target: String, cause: String },

    #[error("Failed to fetch relay artifact {image}: {cause}")]
    ArtifactFetch { image: String, cause: String },

    #[error("Failed to start relay service: {0}")]
    ServiceStart(String),

    #[error("healthcheck-timeout: admin endpoint unreachable after {}s", waited.as_secs())]
    HealthcheckTimeout { waited: Duration },

    #[error("Relay configuration error at {path:?}: {cause}")]
    Config { path: PathBuf, cause: String },
}

impl ProvisionError {
    /// Fatal errors halt the orchestrator; the rest are reported as warnings.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProvisionError::TuningWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_tuning_writes_are_non_fatal() {
        let tuning = ProvisionError::TuningWrite {
            target: "net.core.somaxconn".to_string(),
            cause: "Permission denied".to_string(),
        };
        assert!(!tuning.is_fatal());
        assert!(ProvisionError::Privilege("uid 1000".to_string()).is_fatal());
        assert!(ProvisionError::HealthcheckTimeout {
            waited: Duration::from_secs(30)
        }
        .is_fatal());
    }

    #[test]
    fn test_healthcheck_timeout_message() {
        let err = ProvisionError::HealthcheckTimeout {
            waited: Duration::from_secs(30),
        };
        assert!(err.to_string().starts_with("healthcheck-timeout"));
    }
}
