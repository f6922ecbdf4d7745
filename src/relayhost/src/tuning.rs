//! OS-level tuning: nofile limits, conntrack table size, kernel network
//! parameters.
//!
//! Every step is idempotent. Persisted files are only written when their
//! content differs, the limits block is guarded by a sentinel marker, and
//! kernel parameters are applied one key at a time so an unsupported key
//! on an unusual kernel only costs a warning.
use crate::constants::*;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::settings::ProvisionSettings;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

pub const LIMITS_MARKER_BEGIN: &str = "# >>> relayhost nofile >>>";
pub const LIMITS_MARKER_END: &str = "# <<< relayhost nofile <<<";

/// Key under which the nofile limit is recorded in [`TuningState`].
pub const NOFILE_KEY: &str = "nofile";

/// Persisted tuning file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningPaths {
    pub limits_file: PathBuf,
    pub conntrack_file: PathBuf,
    pub network_file: PathBuf,
}

impl Default for TuningPaths {
    fn default() -> Self {
        Self {
            limits_file: PathBuf::from(LIMITS_FILE_PATH),
            conntrack_file: PathBuf::from(CONNTRACK_SYSCTL_PATH),
            network_file: PathBuf::from(NETWORK_SYSCTL_PATH),
        }
    }
}

/// Desired OS-level parameters: name -> value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningState {
    pub fd_limit: u64,
    pub conntrack: BTreeMap<String, String>,
    pub network: BTreeMap<String, String>,
}

impl TuningState {
    pub fn for_settings(settings: &ProvisionSettings) -> Self {
        let mut conntrack = BTreeMap::new();
        conntrack.insert(
            CONNTRACK_MAX_KEY.to_string(),
            settings.conntrack_max().to_string(),
        );

        Self {
            fd_limit: settings.fd_limit(),
            conntrack,
            network: network_parameters(),
        }
    }

    /// Flat view of every parameter, including the nofile limit.
    pub fn parameters(&self) -> BTreeMap<String, String> {
        let mut all = BTreeMap::new();
        all.insert(NOFILE_KEY.to_string(), self.fd_limit.to_string());
        all.extend(self.conntrack.clone());
        all.extend(self.network.clone());
        all
    }
}

/// The fixed kernel network parameter set for a high-connection relay.
pub fn network_parameters() -> BTreeMap<String, String> {
    [
        // Accept queues
        ("net.core.somaxconn", "65535"),
        ("net.core.netdev_max_backlog", "250000"),
        ("net.ipv4.tcp_max_syn_backlog", "65535"),
        // Connection churn
        ("net.ipv4.tcp_fin_timeout", "15"),
        ("net.ipv4.tcp_tw_reuse", "1"),
        ("net.ipv4.ip_local_port_range", "1024 65535"),
        // Dead peer detection on long-lived sessions
        ("net.ipv4.tcp_keepalive_time", "300"),
        ("net.ipv4.tcp_keepalive_intvl", "30"),
        ("net.ipv4.tcp_keepalive_probes", "5"),
        // Socket buffer ceilings
        ("net.core.rmem_max", "16777216"),
        ("net.core.wmem_max", "16777216"),
        ("net.ipv4.tcp_rmem", "4096 87380 16777216"),
        ("net.ipv4.tcp_wmem", "4096 65536 16777216"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// A best-effort tuning step that did not take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningWarning {
    pub target: String,
    pub cause: String,
}

impl From<TuningWarning> for ProvisionError {
    fn from(w: TuningWarning) -> Self {
        ProvisionError::TuningWrite {
            target: w.target,
            cause: w.cause,
        }
    }
}

impl std::fmt::Display for TuningWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.target, self.cause)
    }
}

#[derive(Debug, Clone)]
pub struct TuningResult {
    pub state: TuningState,
    pub warnings: Vec<TuningWarning>,
    /// Persisted files whose content changed during this application.
    pub files_written: Vec<PathBuf>,
}

/// Outcome of one persisted-file write.
enum FileWrite {
    Unchanged,
    Written,
    Failed(io::Error),
}

pub struct TuningApplier {
    host: Host,
    paths: TuningPaths,
}

impl TuningApplier {
    pub fn new(host: Host) -> Self {
        Self::with_paths(host, TuningPaths::default())
    }

    pub fn with_paths(host: Host, paths: TuningPaths) -> Self {
        Self { host, paths }
    }

    /// Apply limits, conntrack and network tuning for `settings`.
    ///
    /// Individual failures become warnings. Fails only when none of the
    /// persisted files could be written for lack of permission.
    pub async fn apply(
        &self,
        settings: &ProvisionSettings,
    ) -> Result<TuningResult, ProvisionError> {
        let state = TuningState::for_settings(settings);
        let mut warnings = Vec::new();
        let mut files_written = Vec::new();
        let mut denied = 0;

        tracing::info!(
            "[TuningApplier] Applying nofile={} conntrack_max={} ({} network parameters)",
            state.fd_limit,
            settings.conntrack_max(),
            state.network.len()
        );

        // 1. File-descriptor limits
        let limits = self.ensure_limits_block(state.fd_limit);
        self.record(
            &self.paths.limits_file,
            limits,
            &mut files_written,
            &mut warnings,
            &mut denied,
        );

        // 2. Conntrack table
        self.load_conntrack_module().await;
        let conntrack = self.write_sysctl_file(
            &self.paths.conntrack_file,
            "connection tracking",
            &state.conntrack,
        );
        self.record(
            &self.paths.conntrack_file,
            conntrack,
            &mut files_written,
            &mut warnings,
            &mut denied,
        );
        self.apply_parameters(&state.conntrack, &mut warnings).await;

        // 3. Network parameters
        let network =
            self.write_sysctl_file(&self.paths.network_file, "network", &state.network);
        self.record(
            &self.paths.network_file,
            network,
            &mut files_written,
            &mut warnings,
            &mut denied,
        );
        self.apply_parameters(&state.network, &mut warnings).await;

        if denied == 3 {
            return Err(ProvisionError::Privilege(format!(
                "cannot write {}, {} or {}",
                self.paths.limits_file.display(),
                self.paths.conntrack_file.display(),
                self.paths.network_file.display()
            )));
        }

        for warning in &warnings {
            tracing::warn!("[TuningApplier] {}", warning);
        }
        tracing::info!(
            "[TuningApplier] Done: {} file(s) written, {} warning(s)",
            files_written.len(),
            warnings.len()
        );

        Ok(TuningResult {
            state,
            warnings,
            files_written,
        })
    }

    fn record(
        &self,
        path: &Path,
        outcome: FileWrite,
        files_written: &mut Vec<PathBuf>,
        warnings: &mut Vec<TuningWarning>,
        denied: &mut usize,
    ) {
        match outcome {
            FileWrite::Unchanged => {
                tracing::debug!("[TuningApplier] {} already up to date", path.display());
            }
            FileWrite::Written => files_written.push(path.to_path_buf()),
            FileWrite::Failed(e) => {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    *denied += 1;
                }
                warnings.push(TuningWarning {
                    target: path.display().to_string(),
                    cause: e.to_string(),
                });
            }
        }
    }

    /// Ensure the marker-guarded nofile block grants `fd_limit` to all users
    /// and to root.
    fn ensure_limits_block(&self, fd_limit: u64) -> FileWrite {
        let path = &self.paths.limits_file;
        let block = limits_block(fd_limit);

        let existing = match self.host.fs.read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return FileWrite::Failed(e),
        };

        match replace_limits_block(&existing, &block) {
            None => {
                let mut addition = String::new();
                if !existing.is_empty() && !existing.ends_with('\n') {
                    addition.push('\n');
                }
                addition.push_str(&block);
                match self.host.fs.append(path, &addition) {
                    Ok(()) => FileWrite::Written,
                    Err(e) => FileWrite::Failed(e),
                }
            }
            Some(updated) if updated == existing => FileWrite::Unchanged,
            Some(updated) => match self.host.fs.write_atomic(path, updated.as_bytes()) {
                Ok(()) => {
                    tracing::info!("[TuningApplier] Updated nofile block in {}", path.display());
                    FileWrite::Written
                }
                Err(e) => FileWrite::Failed(e),
            },
        }
    }

    /// Load the conntrack module. Failure is fine when it is built in.
    async fn load_conntrack_module(&self) {
        match self.host.runner.run("modprobe", &[CONNTRACK_MODULE]).await {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::debug!(
                "[TuningApplier] modprobe {} failed (may be built in): {}",
                CONNTRACK_MODULE,
                output.last_error_line()
            ),
            Err(e) => tracing::debug!(
                "[TuningApplier] modprobe {} unavailable: {}",
                CONNTRACK_MODULE,
                e
            ),
        }
    }

    fn write_sysctl_file(
        &self,
        path: &Path,
        purpose: &str,
        parameters: &BTreeMap<String, String>,
    ) -> FileWrite {
        let content = render_sysctl_file(purpose, parameters);
        match self.host.fs.read_to_string(path) {
            Ok(existing) if existing == content => return FileWrite::Unchanged,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return FileWrite::Failed(e),
        }
        match self.host.fs.write_atomic(path, content.as_bytes()) {
            Ok(()) => FileWrite::Written,
            Err(e) => FileWrite::Failed(e),
        }
    }

    /// Apply each parameter immediately; failures do not stop the rest.
    async fn apply_parameters(
        &self,
        parameters: &BTreeMap<String, String>,
        warnings: &mut Vec<TuningWarning>,
    ) {
        for (key, value) in parameters {
            let assignment = format!("{}={}", key, value);
            match self.host.runner.run("sysctl", &["-w", &assignment]).await {
                Ok(output) if output.success() => {
                    tracing::debug!("[TuningApplier] sysctl {}", assignment);
                }
                Ok(output) => warnings.push(TuningWarning {
                    target: key.clone(),
                    cause: output.last_error_line().to_string(),
                }),
                Err(e) => warnings.push(TuningWarning {
                    target: key.clone(),
                    cause: e.to_string(),
                }),
            }
        }
    }
}

/// The limits block, markers included, newline-terminated.
pub fn limits_block(fd_limit: u64) -> String {
    let mut block = String::new();
    block.push_str(LIMITS_MARKER_BEGIN);
    block.push('\n');
    for domain in ["*", "root"] {
        for kind in ["soft", "hard"] {
            block.push_str(&format!("{:<8}{:<6}nofile  {}\n", domain, kind, fd_limit));
        }
    }
    block.push_str(LIMITS_MARKER_END);
    block.push('\n');
    block
}

/// Replace an existing marker block in `content`. `None` when no block is
/// present.
fn replace_limits_block(content: &str, block: &str) -> Option<String> {
    let start = content.find(LIMITS_MARKER_BEGIN)?;
    let end = match content[start..].find(LIMITS_MARKER_END) {
        Some(offset) => {
            let after_marker = start + offset + LIMITS_MARKER_END.len();
            if content[after_marker..].starts_with('\n') {
                after_marker + 1
            } else {
                after_marker
            }
        }
        // Truncated block: replace through end of file.
        None => content.len(),
    };
    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..start]);
    updated.push_str(block);
    updated.push_str(&content[end..]);
    Some(updated)
}

/// Deterministic sysctl.d file content.
pub fn render_sysctl_file(purpose: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut content = format!(
        "# Managed by relayhost ({}). Local edits are overwritten.\n",
        purpose
    );
    for (key, value) in parameters {
        content.push_str(&format!("{} = {}\n", key, value));
    }
    content
}
