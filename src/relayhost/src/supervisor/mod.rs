//! Relay process supervision.
//!
//! [`ServiceSupervisor`] is the narrow capability the orchestrator depends
//! on. [`SystemdSupervisor`] implements it with systemd driving a docker
//! container; [`memory::MemorySupervisor`] is an in-memory stand-in.
use crate::constants::*;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::service::ServiceUnit;
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub mod memory;

/// State of the supervised unit as reported by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Running,
    Starting,
    Stopped,
    Failed,
    NotFound,
}

impl UnitStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, UnitStatus::Running | UnitStatus::Starting)
    }
}

/// A relay image that is present locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub reference: String,
    /// Content-addressed image id, when the runtime reports one.
    pub id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to fetch {image}: {cause}")]
    Pull { image: String, cause: String },

    #[error("Failed to start {name}: {cause}")]
    Start { name: String, cause: String },

    #[error("Failed to stop {name}: {cause}")]
    Stop { name: String, cause: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<SupervisorError> for ProvisionError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Pull { image, cause } => {
                ProvisionError::ArtifactFetch { image, cause }
            }
            other => ProvisionError::ServiceStart(other.to_string()),
        }
    }
}

/// Lifecycle operations on the single named relay unit.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    /// Best-effort stop/disable of generic web servers that may hold `port`.
    /// Returns the services that were stopped.
    async fn stop_conflicting(&self, port: u16) -> Vec<String>;

    /// Fetch and verify the relay image.
    async fn prepare(&self, image_ref: &str) -> Result<PreparedImage, SupervisorError>;

    /// Replace any existing instance of `unit.name` and start a new one
    /// under the unit's restart policy.
    async fn start(&self, unit: &ServiceUnit) -> Result<(), SupervisorError>;

    /// Graceful stop, then forced removal once `grace` expires. An installed
    /// unit with a longer stop timeout of its own gets that instead. A
    /// missing instance is not an error.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), SupervisorError>;

    /// Stop and unregister the unit so it no longer starts at boot.
    async fn remove(&self, name: &str) -> Result<(), SupervisorError>;

    async fn status(&self, name: &str) -> Result<UnitStatus, SupervisorError>;
}

/// Supervises the relay as a systemd unit wrapping `docker run`.
pub struct SystemdSupervisor {
    host: Host,
    unit_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ImageInspect {
    #[serde(rename = "Id")]
    id: String,
}

impl SystemdSupervisor {
    pub fn new(host: Host) -> Self {
        Self::with_unit_dir(host, SYSTEMD_UNIT_DIR)
    }

    pub fn with_unit_dir(host: Host, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            host,
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<crate::host::ExecOutput, SupervisorError> {
        Ok(self.host.runner.run("systemctl", args).await?)
    }

    /// Run a systemctl step that must succeed for the unit to start.
    async fn systemctl_required(&self, name: &str, args: &[&str]) -> Result<(), SupervisorError> {
        let output = self.systemctl(args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SupervisorError::Start {
                name: name.to_string(),
                cause: format!("systemctl {}: {}", args.join(" "), output.last_error_line()),
            })
        }
    }

    /// Remove the relay container if present. "No such container" is fine.
    async fn force_remove_container(&self, name: &str) {
        match self.host.runner.run("docker", &["rm", "-f", name]).await {
            Ok(output) if output.success() => {
                tracing::debug!("[SystemdSupervisor] Removed container {}", name);
            }
            Ok(output) => tracing::debug!(
                "[SystemdSupervisor] docker rm -f {}: {}",
                name,
                output.last_error_line()
            ),
            Err(e) => tracing::debug!("[SystemdSupervisor] docker rm -f {}: {}", name, e),
        }
    }

    /// `TimeoutStopSec` of the installed unit file, if there is one.
    fn installed_stop_timeout(&self, name: &str) -> Option<Duration> {
        let content = self.host.fs.read_to_string(&self.unit_path(name)).ok()?;
        content
            .lines()
            .find_map(|line| line.trim().strip_prefix("TimeoutStopSec="))
            .and_then(|secs| secs.trim().parse().ok())
            .map(Duration::from_secs)
    }

    /// How long `systemctl stop` may run before the unit is killed. Never
    /// shorter than the stop timeout the installed unit grants its ExecStop.
    fn stop_deadline(&self, name: &str, grace: Duration) -> Duration {
        let requested = grace + STOP_KILL_MARGIN;
        match self.installed_stop_timeout(name) {
            Some(installed) => requested.max(installed + STOP_KILL_MARGIN),
            None => requested,
        }
    }

    async fn journal_tail(&self, name: &str) -> String {
        match self
            .host
            .runner
            .run("journalctl", &["-u", name, "-n", "20", "--no-pager"])
            .await
        {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn stop_conflicting(&self, port: u16) -> Vec<String> {
        let mut stopped = Vec::new();
        for &service in CONFLICTING_SERVICES {
            let active = matches!(
                self.systemctl(&["is-active", "--quiet", service]).await,
                Ok(output) if output.success()
            );
            if !active {
                continue;
            }
            tracing::info!(
                "[SystemdSupervisor] Stopping {} to free port {}",
                service,
                port
            );
            for action in ["stop", "disable"] {
                match self.systemctl(&[action, service]).await {
                    Ok(output) if output.success() => {}
                    Ok(output) => tracing::warn!(
                        "[SystemdSupervisor] systemctl {} {}: {}",
                        action,
                        service,
                        output.last_error_line()
                    ),
                    Err(e) => tracing::warn!(
                        "[SystemdSupervisor] systemctl {} {}: {}",
                        action,
                        service,
                        e
                    ),
                }
            }
            stopped.push(service.to_string());
        }
        stopped
    }

    async fn prepare(&self, image_ref: &str) -> Result<PreparedImage, SupervisorError> {
        tracing::info!("[SystemdSupervisor] Pulling relay image {}", image_ref);
        let pull_error = |cause: String| SupervisorError::Pull {
            image: image_ref.to_string(),
            cause,
        };

        let pull = self
            .host
            .runner
            .run("docker", &["pull", image_ref])
            .await
            .map_err(|e| pull_error(e.to_string()))?;
        if !pull.success() {
            return Err(pull_error(pull.last_error_line().to_string()));
        }

        let inspect = self
            .host
            .runner
            .run("docker", &["image", "inspect", image_ref])
            .await
            .map_err(|e| pull_error(e.to_string()))?;
        if !inspect.success() {
            return Err(pull_error(format!(
                "image not present after pull: {}",
                inspect.last_error_line()
            )));
        }

        let id = serde_json::from_str::<Vec<ImageInspect>>(&inspect.stdout)
            .ok()
            .and_then(|images| images.into_iter().next())
            .map(|image| image.id);
        tracing::info!(
            "[SystemdSupervisor] Image {} ready ({})",
            image_ref,
            id.as_deref().unwrap_or("id unknown")
        );

        Ok(PreparedImage {
            reference: image_ref.to_string(),
            id,
        })
    }

    async fn start(&self, unit: &ServiceUnit) -> Result<(), SupervisorError> {
        let name = unit.name.as_str();

        // Old instance first, so only the new one ever binds the port.
        self.stop(name, unit.stop_grace).await?;
        self.force_remove_container(name).await;

        let rendered = unit.render().map_err(|e| SupervisorError::Start {
            name: name.to_string(),
            cause: e.to_string(),
        })?;
        let unit_path = self.unit_path(name);
        self.host
            .fs
            .write_atomic(&unit_path, rendered.as_bytes())
            .map_err(|e| SupervisorError::Start {
                name: name.to_string(),
                cause: format!("cannot write {}: {}", unit_path.display(), e),
            })?;
        tracing::info!("[SystemdSupervisor] Wrote unit {}", unit_path.display());

        self.systemctl_required(name, &["daemon-reload"]).await?;
        self.systemctl_required(name, &["enable", name]).await?;
        self.systemctl_required(name, &["start", name]).await?;

        let status = self.status(name).await?;
        if !status.is_up() {
            let journal = self.journal_tail(name).await;
            return Err(SupervisorError::Start {
                name: name.to_string(),
                cause: format!("unit is {:?} after start\n{}", status, journal),
            });
        }

        tracing::info!("[SystemdSupervisor] Unit {} started", name);
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let deadline = self.stop_deadline(name, grace);
        match tokio::time::timeout(deadline, self.systemctl(&["stop", name])).await {
            Ok(Ok(output)) if output.success() => {
                tracing::debug!("[SystemdSupervisor] Stopped {}", name);
            }
            Ok(Ok(output)) => {
                // Unit not loaded yet: nothing to stop.
                tracing::debug!(
                    "[SystemdSupervisor] systemctl stop {}: {}",
                    name,
                    output.last_error_line()
                );
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(
                    "[SystemdSupervisor] {} did not stop within {}s, killing",
                    name,
                    deadline.as_secs()
                );
                match self.systemctl(&["kill", "--signal=SIGKILL", name]).await {
                    Ok(output) if output.success() => {}
                    Ok(output) => tracing::warn!(
                        "[SystemdSupervisor] systemctl kill {}: {}",
                        name,
                        output.last_error_line()
                    ),
                    Err(e) => tracing::warn!("[SystemdSupervisor] systemctl kill {}: {}", name, e),
                }
            }
        }
        self.force_remove_container(name).await;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop(name, STOP_GRACE_PERIOD).await?;

        let _ = self.systemctl(&["disable", name]).await;
        let unit_path = self.unit_path(name);
        match self.host.fs.remove_file(&unit_path) {
            Ok(()) => tracing::info!("[SystemdSupervisor] Removed unit {}", unit_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SupervisorError::Stop {
                    name: name.to_string(),
                    cause: format!("cannot remove {}: {}", unit_path.display(), e),
                })
            }
        }
        let _ = self.systemctl(&["daemon-reload"]).await;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, SupervisorError> {
        if !self.host.fs.exists(&self.unit_path(name)) {
            return Ok(UnitStatus::NotFound);
        }
        let output = self.systemctl(&["is-active", name]).await?;
        Ok(parse_is_active(output.stdout.trim()))
    }
}

fn parse_is_active(state: &str) -> UnitStatus {
    match state {
        "active" | "reloading" => UnitStatus::Running,
        "activating" => UnitStatus::Starting,
        "failed" => UnitStatus::Failed,
        "inactive" | "deactivating" => UnitStatus::Stopped,
        _ => UnitStatus::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_active() {
        assert_eq!(parse_is_active("active"), UnitStatus::Running);
        assert_eq!(parse_is_active("activating"), UnitStatus::Starting);
        assert_eq!(parse_is_active("failed"), UnitStatus::Failed);
        assert_eq!(parse_is_active("inactive"), UnitStatus::Stopped);
        assert_eq!(parse_is_active("unknown"), UnitStatus::NotFound);
    }

    #[test]
    fn test_pull_maps_to_artifact_fetch() {
        let err: ProvisionError = SupervisorError::Pull {
            image: "envoy".to_string(),
            cause: "manifest unknown".to_string(),
        }
        .into();
        assert!(matches!(err, ProvisionError::ArtifactFetch { .. }));

        let err: ProvisionError = SupervisorError::Start {
            name: "relay".to_string(),
            cause: "exit 1".to_string(),
        }
        .into();
        assert!(matches!(err, ProvisionError::ServiceStart(_)));
    }
}
