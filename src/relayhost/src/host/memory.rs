//! In-memory host collaborators. Test doubles only: locks are unwrapped and
//! a poisoned lock panics.
use super::{CommandRunner, ExecOutput, HostFs};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Filesystem kept in memory. Writes to chosen paths can be denied to
/// simulate `PermissionDenied`.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: Mutex<BTreeMap<PathBuf, String>>,
    denied: Mutex<HashSet<PathBuf>>,
    writes: Mutex<usize>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), content.to_string());
        self
    }

    /// Make every later write to `path` fail with `PermissionDenied`.
    pub fn deny_writes(&self, path: impl Into<PathBuf>) {
        self.denied.lock().unwrap().insert(path.into());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    /// Snapshot of every file.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, String> {
        self.files.lock().unwrap().clone()
    }

    /// Number of successful writes (appends and replacements).
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.denied.lock().unwrap().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("Permission denied: {}", path.display()),
            ));
        }
        Ok(())
    }
}

impl HostFs for MemoryFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.file(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No such file: {}", path.display()),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn append(&self, path: &Path, content: &str) -> io::Result<()> {
        self.check_writable(path)?;
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .push_str(content);
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        self.check_writable(path)?;
        let content = String::from_utf8(content.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content);
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check_writable(path)?;
        match self.files.lock().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No such file: {}", path.display()),
            )),
        }
    }
}

/// Command runner that records invocations and answers from a script.
///
/// Responses are matched by command-line prefix; the longest matching
/// prefix wins. Unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(Vec<String>, ExecOutput)>>,
    missing: Mutex<HashSet<String>>,
    provides: Mutex<HashMap<String, String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` (program first) with `output`.
    pub fn respond(&self, prefix: &[&str], output: ExecOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.iter().map(|s| s.to_string()).collect(), output));
    }

    /// Make `which program` fail until a package providing it is installed.
    pub fn set_missing(&self, program: &str) {
        self.missing.lock().unwrap().insert(program.to_string());
    }

    /// Installing `package` through a package manager makes `program` appear.
    pub fn provides(&self, package: &str, program: &str) {
        self.provides
            .lock()
            .unwrap()
            .insert(package.to_string(), program.to_string());
    }

    /// Every command run so far, one line each.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn scripted(&self, command: &[String]) -> ExecOutput {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<ExecOutput> {
        let mut command = vec![program.to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        self.calls.lock().unwrap().push(command.join(" "));

        let output = self.scripted(&command);

        let is_install = matches!(program, "apt-get" | "dnf") && args.contains(&"install");
        if is_install && output.success() {
            let provides = self.provides.lock().unwrap();
            let mut missing = self.missing.lock().unwrap();
            for package in args {
                if let Some(binary) = provides.get(*package) {
                    missing.remove(binary);
                }
            }
        }

        Ok(output)
    }

    async fn which(&self, program: &str) -> Option<PathBuf> {
        if self.missing.lock().unwrap().contains(program) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }
}
