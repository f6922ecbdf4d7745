//! Top-level provisioning state machine.
//!
//! Stages run strictly in order and each one's side effects are on disk or
//! registered with the service manager before the next begins. A fatal
//! error stops the run and is reported with the stage it interrupted;
//! best-effort tuning failures are collected as warnings.
//!
//! Concurrent runs against the same host are not safe. Serialising them
//! (one provisioning run per host at a time) is the caller's job; there is
//! no internal lock.
use crate::constants::*;
use crate::error::ProvisionError;
use crate::health::{wait_until_healthy, HealthCheckConfig, HealthProbe};
use crate::host::Host;
use crate::preflight::{self, Prerequisite, DEFAULT_PREREQUISITES};
use crate::progress::{LogProgressReporter, ProgressReporter};
use crate::relay_config::ConfigGenerator;
use crate::service::{self, ServiceUnit};
use crate::settings::ProvisionSettings;
use crate::supervisor::ServiceSupervisor;
use crate::tuning::{TuningApplier, TuningPaths, TuningState};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Where a provisioning run is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    Unstarted,
    PreconditionsChecked,
    Tuned,
    ConfigWritten,
    ServiceRunning,
    Healthy,
    /// `stage` is the state the run was in when the failing transition began.
    Failed {
        stage: Box<ProvisionState>,
        cause: String,
    },
}

impl ProvisionState {
    pub fn failed(stage: ProvisionState, cause: impl Into<String>) -> Self {
        ProvisionState::Failed {
            stage: Box::new(stage),
            cause: cause.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProvisionState::Healthy)
    }

    pub fn failed_stage(&self) -> Option<&ProvisionState> {
        match self {
            ProvisionState::Failed { stage, .. } => Some(stage.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::Unstarted => write!(f, "Unstarted"),
            ProvisionState::PreconditionsChecked => write!(f, "PreconditionsChecked"),
            ProvisionState::Tuned => write!(f, "Tuned"),
            ProvisionState::ConfigWritten => write!(f, "ConfigWritten"),
            ProvisionState::ServiceRunning => write!(f, "ServiceRunning"),
            ProvisionState::Healthy => write!(f, "Healthy"),
            ProvisionState::Failed { stage, cause } => write!(f, "Failed({}, {})", stage, cause),
        }
    }
}

/// Outcome of one provisioning run.
#[derive(Debug)]
pub struct ProvisionReport {
    pub settings: ProvisionSettings,
    pub state: ProvisionState,
    /// Every state entered, in order, starting with `Unstarted`.
    pub transitions: Vec<ProvisionState>,
    /// The fatal error behind a `Failed` state.
    pub error: Option<ProvisionError>,
    /// Non-fatal `TuningWrite` errors collected along the way.
    pub warnings: Vec<ProvisionError>,
    pub tuning: Option<TuningState>,
    pub config_path: PathBuf,
    pub config_changed: bool,
    pub stopped_conflicts: Vec<String>,
    pub image_id: Option<String>,
    /// Listening sockets on the public port, as reported by `ss`.
    pub bind_status: Option<String>,
    pub admin_url: String,
}

impl ProvisionReport {
    fn new(settings: &ProvisionSettings, config_path: &Path) -> Self {
        Self {
            settings: settings.clone(),
            state: ProvisionState::Unstarted,
            transitions: vec![ProvisionState::Unstarted],
            error: None,
            warnings: Vec::new(),
            tuning: None,
            config_path: config_path.to_path_buf(),
            config_changed: false,
            stopped_conflicts: Vec::new(),
            image_id: None,
            bind_status: None,
            admin_url: format!("http://{}:{}", ADMIN_BIND_ADDRESS, ADMIN_PORT),
        }
    }

    fn advance(&mut self, state: ProvisionState) {
        tracing::info!("[Orchestrator] {} -> {}", self.state, state);
        self.transitions.push(state.clone());
        self.state = state;
    }

    fn fail(&mut self, error: ProvisionError) {
        let failed = ProvisionState::failed(self.state.clone(), error.to_string());
        tracing::error!("[Orchestrator] {}", failed);
        self.transitions.push(failed.clone());
        self.state = failed;
        self.error = Some(error);
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.settings;
        match &self.state {
            ProvisionState::Failed { stage, cause } => {
                writeln!(f, "Provisioning FAILED at stage {}", stage)?;
                writeln!(f, "  Cause:       {}", cause)?;
            }
            state => writeln!(f, "Provisioning finished: {}", state)?,
        }
        writeln!(
            f,
            "  Listen:      0.0.0.0:{} -> {}:{}",
            s.listen_port(),
            s.target_host(),
            s.target_port()
        )?;
        writeln!(f, "  Workers:     {}", s.worker_concurrency())?;
        match &self.image_id {
            Some(id) => writeln!(f, "  Image:       {} ({})", s.relay_image_ref(), id)?,
            None => writeln!(f, "  Image:       {}", s.relay_image_ref())?,
        }
        writeln!(f, "  Config:      {}", self.config_path.display())?;

        if let Some(tuning) = &self.tuning {
            writeln!(f, "  Tuning:")?;
            for (key, value) in tuning.parameters() {
                writeln!(f, "    {} = {}", key, value)?;
            }
        }

        if !self.stopped_conflicts.is_empty() {
            writeln!(f, "  Stopped:     {}", self.stopped_conflicts.join(", "))?;
        }

        if let Some(bind) = &self.bind_status {
            writeln!(f, "  Bind status (:{}):", s.listen_port())?;
            for line in bind.lines() {
                writeln!(f, "    {}", line)?;
            }
        }
        writeln!(f, "  Admin:       {} (loopback only)", self.admin_url)?;

        if !self.warnings.is_empty() {
            writeln!(f, "  Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "    - {}", warning)?;
            }
        }
        Ok(())
    }
}

/// Sequences preflight, tuning, config, supervision and health.
pub struct ProvisionOrchestrator {
    host: Host,
    settings: ProvisionSettings,
    supervisor: Arc<dyn ServiceSupervisor>,
    probe: Arc<dyn HealthProbe>,
    prerequisites: Vec<Prerequisite>,
    tuning_paths: TuningPaths,
    generator: ConfigGenerator,
    health: HealthCheckConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl ProvisionOrchestrator {
    pub fn new(
        host: Host,
        settings: ProvisionSettings,
        supervisor: Arc<dyn ServiceSupervisor>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let health = HealthCheckConfig::with_timeout(settings.health_timeout());
        Self {
            host,
            settings,
            supervisor,
            probe,
            prerequisites: DEFAULT_PREREQUISITES.to_vec(),
            tuning_paths: TuningPaths::default(),
            generator: ConfigGenerator::default(),
            health,
            progress: Arc::new(LogProgressReporter),
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<Prerequisite>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_tuning_paths(mut self, paths: TuningPaths) -> Self {
        self.tuning_paths = paths;
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.generator = ConfigGenerator::new(path);
        self
    }

    pub fn with_health_check(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run every stage from `Unstarted`. Re-running against an already
    /// provisioned host converges to the same end state.
    pub async fn run(&self) -> ProvisionReport {
        let mut report = ProvisionReport::new(&self.settings, self.generator.path());
        let started = Instant::now();

        if let Err(e) = self.execute(&mut report).await {
            report.fail(e);
            self.progress.emit_stage(100, "Provisioning failed".to_string(), "failed");
        }

        tracing::info!(
            "[TIMING] Provisioning finished in {}ms: {}",
            started.elapsed().as_millis(),
            report.state
        );
        report
    }

    async fn execute(&self, report: &mut ProvisionReport) -> Result<(), ProvisionError> {
        let settings = &self.settings;
        service::check_unit_path(self.generator.path())?;

        // 1. Preconditions
        self.stage_started(5, "Checking preconditions", "preflight");
        preflight::check_preconditions(&self.host, &self.prerequisites).await?;
        report.advance(ProvisionState::PreconditionsChecked);

        // 2. Kernel and limits tuning
        self.stage_started(20, "Applying host tuning", "tuning");
        let tuning = TuningApplier::with_paths(self.host.clone(), self.tuning_paths.clone())
            .apply(settings)
            .await?;
        report
            .warnings
            .extend(tuning.warnings.into_iter().map(ProvisionError::from));
        report.tuning = Some(tuning.state);
        report.advance(ProvisionState::Tuned);

        // 3. Relay document
        self.stage_started(40, "Writing relay configuration", "config");
        let written = self.generator.write(self.host.fs.as_ref(), settings)?;
        report.config_changed = written.changed;
        report.advance(ProvisionState::ConfigWritten);

        // 4. Supervised relay
        self.stage_started(55, "Starting relay service", "service");
        report.stopped_conflicts = self
            .supervisor
            .stop_conflicting(settings.listen_port())
            .await;
        let image = self.supervisor.prepare(settings.relay_image_ref()).await?;
        report.image_id = image.id;
        let unit = ServiceUnit::for_relay(settings, self.generator.path());
        self.supervisor.start(&unit).await?;
        report.advance(ProvisionState::ServiceRunning);

        // 5. Health
        self.stage_started(80, "Waiting for relay admin endpoint", "health");
        let health = wait_until_healthy(self.probe.as_ref(), self.health).await;
        report.bind_status = self.bind_status(settings.listen_port()).await;
        health?;
        report.advance(ProvisionState::Healthy);
        self.progress
            .emit_stage(100, "Relay healthy".to_string(), "healthy");

        Ok(())
    }

    fn stage_started(&self, percentage: u32, message: &str, stage: &str) {
        self.progress.emit_stage(percentage, message.to_string(), stage);
    }

    /// Listening sockets on `port`. Informational only.
    async fn bind_status(&self, port: u16) -> Option<String> {
        let filter = format!(":{}", port);
        match self
            .host
            .runner
            .run("ss", &["-ltnH", "sport", "=", &filter])
            .await
        {
            Ok(output) if output.success() => {
                let listing = output.stdout.trim();
                Some(if listing.is_empty() {
                    "(nothing listening)".to_string()
                } else {
                    listing.to_string()
                })
            }
            Ok(output) => {
                tracing::debug!("[Orchestrator] ss: {}", output.last_error_line());
                None
            }
            Err(e) => {
                tracing::debug!("[Orchestrator] ss unavailable: {}", e);
                None
            }
        }
    }

    /// Stop and unregister the relay, then remove its configuration.
    /// Host tuning stays in place.
    pub async fn teardown(&self) -> Result<(), ProvisionError> {
        tracing::info!("[Orchestrator] Tearing down {}", SERVICE_NAME);
        self.supervisor.remove(SERVICE_NAME).await?;

        let path = self.generator.path();
        match self.host.fs.remove_file(path) {
            Ok(()) => tracing::info!("[Orchestrator] Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ProvisionError::Config {
                    path: path.to_path_buf(),
                    cause: format!("cannot remove: {}", e),
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_state_display() {
        let state = ProvisionState::failed(
            ProvisionState::ServiceRunning,
            "healthcheck-timeout: admin endpoint unreachable after 30s",
        );
        assert_eq!(
            state.to_string(),
            "Failed(ServiceRunning, healthcheck-timeout: admin endpoint unreachable after 30s)"
        );
        assert_eq!(state.failed_stage(), Some(&ProvisionState::ServiceRunning));
        assert!(!state.is_healthy());
    }

    #[test]
    fn test_report_records_transitions() {
        let settings = ProvisionSettings::builder().build().unwrap();
        let mut report = ProvisionReport::new(&settings, Path::new(RELAY_CONFIG_PATH));
        report.advance(ProvisionState::PreconditionsChecked);
        report.fail(ProvisionError::Privilege("uid 1000".to_string()));

        assert_eq!(report.transitions.len(), 3);
        assert_eq!(
            report.state.failed_stage(),
            Some(&ProvisionState::PreconditionsChecked)
        );
        assert!(report.to_string().contains("FAILED at stage PreconditionsChecked"));
    }

    #[test]
    fn test_summary_lists_mapping_and_tuning() {
        let mut builder = ProvisionSettings::builder();
        builder.target_host = "relay.example.com".to_string();
        builder.worker_concurrency = Some(4);
        let settings = builder.build().unwrap();

        let mut report = ProvisionReport::new(&settings, Path::new(RELAY_CONFIG_PATH));
        report.tuning = Some(TuningState::for_settings(&settings));
        report.bind_status = Some("LISTEN 0 4096 0.0.0.0:80 0.0.0.0:*".to_string());
        report.warnings.push(ProvisionError::TuningWrite {
            target: "net.ipv4.tcp_tw_reuse".to_string(),
            cause: "unknown key".to_string(),
        });
        report.state = ProvisionState::Healthy;

        let summary = report.to_string();
        assert!(summary.contains("Provisioning finished: Healthy"));
        assert!(summary.contains("0.0.0.0:80 -> relay.example.com:1155"));
        assert!(summary.contains("Workers:     4"));
        assert!(summary.contains("nofile = 200000"));
        assert!(summary.contains("net.netfilter.nf_conntrack_max = 524288"));
        assert!(summary.contains("LISTEN 0 4096 0.0.0.0:80"));
        assert!(summary.contains("http://127.0.0.1:9901"));
        assert!(summary.contains("- Tuning write failed for net.ipv4.tcp_tw_reuse: unknown key"));
    }
}
