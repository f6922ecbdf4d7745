//! Host collaborators: filesystem and command execution.
//!
//! Every mutation of host state goes through these traits so the stages can
//! run against the real machine ([`LocalFs`], [`SystemRunner`]) or against
//! the in-memory fakes in [`memory`].
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod memory;

/// Result of running a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to stdout.
    pub fn last_error_line(&self) -> &str {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .last()
            .unwrap_or("No output available")
    }
}

/// Filesystem operations used by provisioning stages.
pub trait HostFs: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Append to a file, creating it if missing.
    fn append(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Replace a file atomically: write a sibling temp file, then rename.
    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Runs host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<ExecOutput>;

    /// Resolve a binary on `PATH`.
    async fn which(&self, program: &str) -> Option<PathBuf> {
        match self.run("which", &[program]).await {
            Ok(output) if output.success() => {
                let path = output.stdout.trim();
                if path.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(path))
                }
            }
            _ => None,
        }
    }
}

/// The machine being provisioned.
#[derive(Clone)]
pub struct Host {
    pub fs: Arc<dyn HostFs>,
    pub runner: Arc<dyn CommandRunner>,
    /// Whether we may modify system files and manage services.
    pub privileged: bool,
}

impl Host {
    pub fn new(fs: Arc<dyn HostFs>, runner: Arc<dyn CommandRunner>, privileged: bool) -> Self {
        Self {
            fs,
            runner,
            privileged,
        }
    }

    /// The local machine, privileged when running with effective UID 0.
    pub fn local() -> Self {
        Self {
            fs: Arc::new(LocalFs),
            runner: Arc::new(SystemRunner),
            privileged: nix::unistd::Uid::effective().is_root(),
        }
    }
}

/// [`HostFs`] on the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl HostFs for LocalFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn append(&self, path: &Path, content: &str) -> io::Result<()> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let temp_path = parent.join(format!(".{}.tmp", file_name));

        let result = (|| {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        result
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// [`CommandRunner`] spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<ExecOutput> {
        tracing::debug!("[SystemRunner] {} {}", program, args.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
