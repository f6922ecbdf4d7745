//! Progress reporting for provisioning runs.

use serde::{Deserialize, Serialize};

/// One progress step of a provisioning run.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ProvisionProgress {
    pub percentage: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ProvisionProgress {
    pub fn new(percentage: u32, message: String) -> Self {
        Self {
            percentage,
            message,
            stage: None,
        }
    }
}

/// Progress reporter for provisioning operations.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);

    /// Emit progress tagged with the stage it belongs to.
    fn emit_stage(&self, percentage: u32, message: String, _stage: &str) {
        self.emit(percentage, message);
    }
}

/// Writes progress to the log.
#[derive(Debug, Default)]
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[{:>3}%] {}", percentage, message);
    }

    fn emit_stage(&self, percentage: u32, message: String, stage: &str) {
        tracing::info!("[{:>3}%] {} ({})", percentage, message, stage);
    }
}

/// Channel-based progress reporter.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::Sender<ProvisionProgress>,
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::Sender<ProvisionProgress>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        let _ = self.sender.try_send(ProvisionProgress::new(percentage, message));
    }

    fn emit_stage(&self, percentage: u32, message: String, stage: &str) {
        let mut progress = ProvisionProgress::new(percentage, message);
        progress.stage = Some(stage.to_string());
        let _ = self.sender.try_send(progress);
    }
}
