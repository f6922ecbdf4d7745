//! Single-host TCP relay provisioning.
//!
//! Tunes the host for many long-lived connections, renders the relay's
//! configuration, and supervises the relay as a restart-always service.
//! Host access goes through the collaborators in [`host`] and
//! [`supervisor`] so every stage can run against in-memory fakes.
//!
//! [`host::memory`] and [`supervisor::memory`] are those fakes. They are
//! test doubles for this crate's tests and for embedders exercising their
//! own wiring; a poisoned lock inside them panics. Nothing on the
//! `relayhost` binary's path uses them.

pub mod constants;
pub mod error;
pub mod progress;
pub mod settings;

pub use error::ProvisionError;
pub use progress::{
    ChannelProgressReporter, LogProgressReporter, ProgressReporter, ProvisionProgress,
};
pub use settings::{ProvisionSettings, SettingsBuilder, SettingsError};

// Host collaborators
pub mod host;
pub use host::{CommandRunner, ExecOutput, Host, HostFs, LocalFs, SystemRunner};

// Stages
pub mod health;
pub mod preflight;
pub mod relay_config;
pub mod service;
pub mod supervisor;
pub mod tuning;

pub use health::{wait_until_healthy, AdminEndpointProbe, HealthCheckConfig, HealthProbe};
pub use preflight::{check_preconditions, CheckItem, PreflightReport, Prerequisite};
pub use relay_config::{ConfigGenerator, ConfigWrite, RelayConfig};
pub use service::{RestartPolicy, ServiceUnit};
pub use supervisor::{ServiceSupervisor, SupervisorError, SystemdSupervisor, UnitStatus};
pub use tuning::{TuningApplier, TuningPaths, TuningResult, TuningState, TuningWarning};

pub mod orchestrator;
pub use orchestrator::{ProvisionOrchestrator, ProvisionReport, ProvisionState};
