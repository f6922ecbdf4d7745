//! Precondition checks run before any host mutation.
//!
//! Verifies:
//! - privilege to modify system files and manage services
//! - required binaries (container runtime, service manager, sysctl, modprobe, ss)
//! - that the container runtime service is active
//!
//! A missing binary gets exactly one install attempt through the detected
//! package manager. Missing privilege is never remediated.
use crate::error::ProvisionError;
use crate::host::{CommandRunner, Host};

/// A binary the provisioning run shells out to, and the package that
/// provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub binary: &'static str,
    pub package: &'static str,
}

pub const DEFAULT_PREREQUISITES: &[Prerequisite] = &[
    Prerequisite {
        binary: "docker",
        package: "docker.io",
    },
    Prerequisite {
        binary: "systemctl",
        package: "systemd",
    },
    Prerequisite {
        binary: "sysctl",
        package: "procps",
    },
    Prerequisite {
        binary: "modprobe",
        package: "kmod",
    },
    Prerequisite {
        binary: "ss",
        package: "iproute2",
    },
];

/// Runtime unit the relay container needs.
const RUNTIME_SERVICE: &str = "docker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
        }
    }

    /// First supported package manager found on `PATH`.
    pub async fn detect(runner: &dyn CommandRunner) -> Option<Self> {
        for manager in [PackageManager::Apt, PackageManager::Dnf] {
            if runner.which(manager.program()).await.is_some() {
                return Some(manager);
            }
        }
        None
    }

    fn install_command(&self, package: &str) -> String {
        format!("{} install -y {}", self.program(), package)
    }
}

/// Individual check item
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub fix_command: Option<String>,
}

impl CheckItem {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            fix_command: None,
        }
    }

    fn fail(name: &str, message: impl Into<String>, fix_command: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            fix_command,
        }
    }
}

/// Result of the precondition checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckItem>,
    /// Packages installed to satisfy missing prerequisites.
    pub installed: Vec<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Returns a formatted error message if checks failed
    pub fn error_message(&self) -> Option<String> {
        if self.passed() {
            return None;
        }

        let mut msg = String::from(
            "\n╔════════════════════════════════════════════════════════════════╗\n\
             ║  Relay Host - Preconditions Not Met                            ║\n\
             ╚════════════════════════════════════════════════════════════════╝\n\n",
        );
        msg.push_str("The following requirements are not satisfied:\n\n");

        for (i, check) in self.checks.iter().filter(|c| !c.passed).enumerate() {
            msg.push_str(&format!("  {}. {} - {}\n", i + 1, check.name, check.message));
            if let Some(fix) = &check.fix_command {
                msg.push_str(&format!("     Fix: {}\n", fix));
            }
            msg.push('\n');
        }

        msg.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        msg.push_str("Fix the items above, then re-run: sudo relayhost provision\n");
        msg.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

        Some(msg)
    }
}

/// Check privilege and prerequisites, installing missing ones once.
///
/// Returns the first fatal error after every prerequisite has been looked
/// at, so the report lists everything that is wrong.
pub async fn check_preconditions(
    host: &Host,
    prerequisites: &[Prerequisite],
) -> Result<PreflightReport, ProvisionError> {
    if !host.privileged {
        tracing::error!("[Preflight] Not running as root");
        return Err(ProvisionError::Privilege(
            "root is required to write system tuning files and manage services".to_string(),
        ));
    }

    let runner = host.runner.as_ref();
    let mut report = PreflightReport::default();
    report
        .checks
        .push(CheckItem::pass("Running as root", "Privileged mode"));

    let manager = PackageManager::detect(runner).await;
    let mut index_refreshed = false;
    let mut first_error = None;

    for prerequisite in prerequisites {
        let (item, error) =
            check_prerequisite(runner, prerequisite, manager, &mut index_refreshed, &mut report)
                .await;
        report.checks.push(item);
        if first_error.is_none() {
            first_error = error;
        }
    }

    if first_error.is_none() && prerequisites.iter().any(|p| p.binary == "docker") {
        let (item, error) = ensure_runtime_active(runner).await;
        report.checks.push(item);
        first_error = error;
    }

    match first_error {
        Some(error) => {
            if let Some(msg) = report.error_message() {
                tracing::error!("{}", msg);
            }
            Err(error)
        }
        None => {
            tracing::info!(
                "[Preflight] All {} checks passed ({} package(s) installed)",
                report.checks.len(),
                report.installed.len()
            );
            Ok(report)
        }
    }
}

async fn check_prerequisite(
    runner: &dyn CommandRunner,
    prerequisite: &Prerequisite,
    manager: Option<PackageManager>,
    index_refreshed: &mut bool,
    report: &mut PreflightReport,
) -> (CheckItem, Option<ProvisionError>) {
    let binary = prerequisite.binary;
    if let Some(path) = runner.which(binary).await {
        return (CheckItem::pass(binary, format!("Found at {}", path.display())), None);
    }

    let Some(manager) = manager else {
        let cause = "not found and no supported package manager (apt-get, dnf)".to_string();
        return (
            CheckItem::fail(binary, cause.clone(), None),
            Some(ProvisionError::PrerequisiteMissing {
                tool: binary.to_string(),
                cause,
            }),
        );
    };

    tracing::info!(
        "[Preflight] {} missing, installing {} with {}",
        binary,
        prerequisite.package,
        manager.program()
    );

    if manager == PackageManager::Apt && !*index_refreshed {
        *index_refreshed = true;
        if let Ok(output) = runner.run("apt-get", &["update"]).await {
            if !output.success() {
                tracing::warn!("[Preflight] apt-get update: {}", output.last_error_line());
            }
        }
    }

    let install_error = match runner
        .run(manager.program(), &["install", "-y", prerequisite.package])
        .await
    {
        Ok(output) if output.success() => None,
        Ok(output) => Some(output.last_error_line().to_string()),
        Err(e) => Some(e.to_string()),
    };

    if let Some(path) = runner.which(binary).await {
        report.installed.push(prerequisite.package.to_string());
        return (
            CheckItem::pass(
                binary,
                format!("Installed {} ({})", prerequisite.package, path.display()),
            ),
            None,
        );
    }

    let cause = match install_error {
        Some(e) => format!("install of {} failed: {}", prerequisite.package, e),
        None => format!("still missing after installing {}", prerequisite.package),
    };
    (
        CheckItem::fail(
            binary,
            cause.clone(),
            Some(manager.install_command(prerequisite.package)),
        ),
        Some(ProvisionError::PrerequisiteMissing {
            tool: binary.to_string(),
            cause,
        }),
    )
}

/// The container runtime daemon must be running before the relay unit can
/// start. One `enable --now` attempt.
async fn ensure_runtime_active(runner: &dyn CommandRunner) -> (CheckItem, Option<ProvisionError>) {
    let name = "Container runtime";
    let is_active = |output: std::io::Result<crate::host::ExecOutput>| {
        matches!(output, Ok(o) if o.success())
    };

    if is_active(runner.run("systemctl", &["is-active", "--quiet", RUNTIME_SERVICE]).await) {
        return (CheckItem::pass(name, format!("{} active", RUNTIME_SERVICE)), None);
    }

    tracing::info!("[Preflight] Starting {}", RUNTIME_SERVICE);
    let _ = runner
        .run("systemctl", &["enable", "--now", RUNTIME_SERVICE])
        .await;

    if is_active(runner.run("systemctl", &["is-active", "--quiet", RUNTIME_SERVICE]).await) {
        return (CheckItem::pass(name, format!("{} started", RUNTIME_SERVICE)), None);
    }

    let cause = format!("{} service is not active", RUNTIME_SERVICE);
    (
        CheckItem::fail(
            name,
            cause.clone(),
            Some(format!("systemctl enable --now {}", RUNTIME_SERVICE)),
        ),
        Some(ProvisionError::PrerequisiteMissing {
            tool: format!("{}.service", RUNTIME_SERVICE),
            cause,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryFs, RecordingRunner};
    use crate::host::ExecOutput;
    use std::sync::Arc;

    fn host(runner: Arc<RecordingRunner>, privileged: bool) -> Host {
        Host::new(Arc::new(MemoryFs::new()), runner, privileged)
    }

    #[tokio::test]
    async fn test_unprivileged_is_fatal_without_remediation() {
        let runner = Arc::new(RecordingRunner::new());
        let err = check_preconditions(&host(runner.clone(), false), DEFAULT_PREREQUISITES)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Privilege(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_present() {
        let runner = Arc::new(RecordingRunner::new());
        let report = check_preconditions(&host(runner.clone(), true), DEFAULT_PREREQUISITES)
            .await
            .unwrap();

        assert!(report.passed());
        assert!(report.installed.is_empty());
        assert!(report.error_message().is_none());
        assert!(runner.calls_starting_with("apt-get").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_installed_once() {
        let runner = Arc::new(RecordingRunner::new());
        runner.set_missing("docker");
        runner.provides("docker.io", "docker");

        let report = check_preconditions(&host(runner.clone(), true), DEFAULT_PREREQUISITES)
            .await
            .unwrap();

        assert_eq!(report.installed, vec!["docker.io"]);
        assert_eq!(
            runner.calls_starting_with("apt-get install"),
            vec!["apt-get install -y docker.io"]
        );
    }

    #[tokio::test]
    async fn test_failed_remediation_is_fatal() {
        let runner = Arc::new(RecordingRunner::new());
        runner.set_missing("ss");
        runner.respond(
            &["apt-get", "install"],
            ExecOutput::failed(100, "E: Unable to locate package iproute2"),
        );

        let err = check_preconditions(&host(runner.clone(), true), DEFAULT_PREREQUISITES)
            .await
            .unwrap_err();

        match err {
            ProvisionError::PrerequisiteMissing { tool, cause } => {
                assert_eq!(tool, "ss");
                assert!(cause.contains("Unable to locate package"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.calls_starting_with("apt-get install").len(), 1);
    }

    #[tokio::test]
    async fn test_no_package_manager() {
        let runner = Arc::new(RecordingRunner::new());
        runner.set_missing("apt-get");
        runner.set_missing("dnf");
        runner.set_missing("modprobe");

        let err = check_preconditions(&host(runner, true), DEFAULT_PREREQUISITES)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PrerequisiteMissing { ref tool, .. } if tool == "modprobe"));
    }

    #[tokio::test]
    async fn test_inactive_runtime_is_started() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            &["systemctl", "is-active", "--quiet", "docker"],
            ExecOutput::failed(3, "inactive"),
        );

        let err = check_preconditions(&host(runner.clone(), true), DEFAULT_PREREQUISITES)
            .await
            .unwrap_err();

        // The scripted runner keeps answering "inactive", so one start attempt
        // is made and the run fails.
        assert!(matches!(err, ProvisionError::PrerequisiteMissing { ref tool, .. } if tool == "docker.service"));
        assert_eq!(
            runner.calls_starting_with("systemctl enable --now"),
            vec!["systemctl enable --now docker"]
        );
    }
}
