//! The supervised relay unit descriptor.
use crate::constants::*;
use crate::error::ProvisionError;
use crate::settings::ProvisionSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tera::Context;

pub mod template;

pub use template::TemplateRenderer;

pub const ENV_UNIT_CONCURRENCY: &str = "RELAY_CONCURRENCY";
pub const ENV_UNIT_FD_LIMIT: &str = "RELAY_FD_LIMIT";
pub const ENV_UNIT_IMAGE: &str = "RELAY_IMAGE";

/// What the init system does when the relay exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart after any exit, forever, with a fixed delay.
    Always { delay: Duration },
    Never,
}

/// Descriptor of the supervised relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    /// Unit that must be up before the relay starts.
    pub requires: String,
    pub image_ref: String,
    /// Public port the relay binds.
    pub listen_port: u16,
    pub config_path: PathBuf,
    pub environment: BTreeMap<String, String>,
    /// Cleanup commands run before start; their failure is ignored.
    pub pre_start: Vec<Vec<String>>,
    /// Start command. May reference `environment` as `${NAME}`.
    pub command: Vec<String>,
    pub stop_command: Vec<String>,
    pub stop_grace: Duration,
    pub restart: RestartPolicy,
    pub fd_limit: u64,
}

impl ServiceUnit {
    /// The relay container unit for `settings`, mounting `config_path`
    /// read-only.
    pub fn for_relay(settings: &ProvisionSettings, config_path: &Path) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert(
            ENV_UNIT_CONCURRENCY.to_string(),
            settings.worker_concurrency().to_string(),
        );
        environment.insert(ENV_UNIT_FD_LIMIT.to_string(), settings.fd_limit().to_string());
        environment.insert(
            ENV_UNIT_IMAGE.to_string(),
            settings.relay_image_ref().to_string(),
        );

        let mount = format!("{}:{}:ro", config_path.display(), RELAY_CONFIG_MOUNT);
        let command = [
            DOCKER_BIN,
            "run",
            "--rm",
            "--name",
            SERVICE_NAME,
            "--network",
            "host",
            "--ulimit",
            "nofile=${RELAY_FD_LIMIT}:${RELAY_FD_LIMIT}",
            "-v",
            mount.as_str(),
            "${RELAY_IMAGE}",
            "-c",
            RELAY_CONFIG_MOUNT,
            "--concurrency",
            "${RELAY_CONCURRENCY}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            name: SERVICE_NAME.to_string(),
            description: format!(
                "TCP relay :{} -> {}:{}",
                settings.listen_port(),
                settings.target_host(),
                settings.target_port()
            ),
            requires: RUNTIME_UNIT.to_string(),
            image_ref: settings.relay_image_ref().to_string(),
            listen_port: settings.listen_port(),
            config_path: config_path.to_path_buf(),
            environment,
            pre_start: vec![vec![
                DOCKER_BIN.to_string(),
                "rm".to_string(),
                "-f".to_string(),
                SERVICE_NAME.to_string(),
            ]],
            command,
            stop_command: vec![
                DOCKER_BIN.to_string(),
                "stop".to_string(),
                "-t".to_string(),
                STOP_GRACE_PERIOD.as_secs().to_string(),
                SERVICE_NAME.to_string(),
            ],
            stop_grace: STOP_GRACE_PERIOD,
            restart: RestartPolicy::Always {
                delay: RESTART_DELAY,
            },
            fd_limit: settings.fd_limit(),
        }
    }

    /// Start command with `${NAME}` references resolved from `environment`.
    pub fn expanded_command(&self) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                self.environment
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| {
                        acc.replace(&format!("${{{}}}", key), value)
                    })
            })
            .collect()
    }

    /// Render as a systemd unit file.
    pub fn render(&self) -> Result<String, ProvisionError> {
        check_unit_path(&self.config_path)?;
        let renderer = TemplateRenderer::from_embedded()?;
        let mut context = Context::new();
        context.insert("description", &self.description);
        context.insert("requires", &self.requires);
        context.insert(
            "environment",
            &self
                .environment
                .iter()
                .map(|(k, v)| format!("\"{}={}\"", k, v))
                .collect::<Vec<_>>(),
        );
        context.insert(
            "pre_start",
            &self.pre_start.iter().map(|c| exec_line(c)).collect::<Vec<_>>(),
        );
        context.insert("exec_start", &exec_line(&self.command));
        context.insert("exec_stop", &exec_line(&self.stop_command));
        context.insert(
            "timeout_stop_secs",
            &(self.stop_grace + STOP_KILL_MARGIN).as_secs(),
        );
        match self.restart {
            RestartPolicy::Always { delay } => {
                context.insert("restart_always", &true);
                context.insert("restart", "always");
                context.insert("restart_sec", &delay.as_secs());
            }
            RestartPolicy::Never => {
                context.insert("restart_always", &false);
                context.insert("restart", "no");
                context.insert("restart_sec", &0);
            }
        }
        context.insert("fd_limit", &self.fd_limit);

        renderer.render_with_context(template::RELAY_UNIT_TEMPLATE, &context)
    }
}

/// Reject config paths that cannot be carried through a `docker -v` bind
/// mount inside a unit file.
///
/// Spaces and `%` are fine, [`exec_line`] quotes and escapes them. A `:`
/// would split the mount spec and a `$` would be expanded by systemd.
pub fn check_unit_path(path: &Path) -> Result<(), ProvisionError> {
    let reject = |cause: &str| {
        Err(ProvisionError::Config {
            path: path.to_path_buf(),
            cause: cause.to_string(),
        })
    };
    let Some(text) = path.to_str() else {
        return reject("path is not valid UTF-8");
    };
    if !path.is_absolute() {
        return reject("path must be absolute");
    }
    if text.chars().any(|c| c.is_control()) {
        return reject("path contains control characters");
    }
    if text.contains(':') || text.contains('$') {
        return reject("path must not contain ':' or '$'");
    }
    Ok(())
}

/// Join a command into one systemd `Exec*=` line.
///
/// `%` is doubled so specifiers are not expanded. Words holding whitespace,
/// quotes, backslashes or `;` are double-quoted with `"` and `\` escaped.
/// `${NAME}` references are left for systemd to expand.
pub fn exec_line(command: &[String]) -> String {
    command
        .iter()
        .map(|word| {
            let word = word.replace('%', "%%");
            let plain = !word.is_empty()
                && !word
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
            if plain {
                return word;
            }
            let mut quoted = String::with_capacity(word.len() + 2);
            quoted.push('"');
            for c in word.chars() {
                if c == '"' || c == '\\' {
                    quoted.push('\\');
                }
                quoted.push(c);
            }
            quoted.push('"');
            quoted
        })
        .collect::<Vec<_>>()
        .join(" ")
}
