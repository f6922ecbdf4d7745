//! End-to-end provisioning runs against in-memory host collaborators.
//!
//! The filesystem, command runner and service manager are fakes; the
//! orchestrator, tuning, config generation and unit rendering are real.

use async_trait::async_trait;
use relayhost::constants::*;
use relayhost::host::memory::{MemoryFs, RecordingRunner};
use relayhost::orchestrator::{ProvisionOrchestrator, ProvisionState};
use relayhost::supervisor::memory::{MemorySupervisor, PortOwner, SupervisorEvent};
use relayhost::{
    ChannelProgressReporter, ExecOutput, HealthCheckConfig, HealthProbe, Host, ProvisionError,
    ProvisionSettings, SettingsError,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Health probe whose answer the test controls.
struct StubProbe {
    healthy: AtomicBool,
}

impl StubProbe {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
        })
    }
}

#[async_trait]
impl HealthProbe for StubProbe {
    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "stub".to_string()
    }
}

struct Fixture {
    fs: Arc<MemoryFs>,
    runner: Arc<RecordingRunner>,
    supervisor: Arc<MemorySupervisor>,
    probe: Arc<StubProbe>,
    privileged: bool,
}

impl Fixture {
    fn new() -> Self {
        Self {
            fs: Arc::new(MemoryFs::new()),
            runner: Arc::new(RecordingRunner::new()),
            supervisor: Arc::new(MemorySupervisor::new()),
            probe: StubProbe::new(true),
            privileged: true,
        }
    }

    fn orchestrator(&self, settings: ProvisionSettings) -> ProvisionOrchestrator {
        let host = Host::new(self.fs.clone(), self.runner.clone(), self.privileged);
        ProvisionOrchestrator::new(host, settings, self.supervisor.clone(), self.probe.clone())
            .with_health_check(HealthCheckConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_millis(150),
            })
    }
}

fn settings() -> ProvisionSettings {
    let mut builder = ProvisionSettings::builder();
    builder.target_host = "relay.example.com".to_string();
    builder.worker_concurrency = Some(4);
    builder.build().expect("valid settings")
}

#[tokio::test]
async fn test_clean_host_reaches_healthy() {
    let fixture = Fixture::new();
    let report = fixture.orchestrator(settings()).run().await;

    assert_eq!(report.state, ProvisionState::Healthy, "{}", report);
    assert_eq!(
        report.transitions,
        vec![
            ProvisionState::Unstarted,
            ProvisionState::PreconditionsChecked,
            ProvisionState::Tuned,
            ProvisionState::ConfigWritten,
            ProvisionState::ServiceRunning,
            ProvisionState::Healthy,
        ]
    );
    assert!(report.warnings.is_empty());
    assert!(report.config_changed);
    assert!(report.image_id.is_some());

    let config = fixture.fs.file(RELAY_CONFIG_PATH).expect("relay config written");
    assert!(config.contains("relay.example.com"));
    assert!(fixture.fs.file(LIMITS_FILE_PATH).is_some());
    assert!(fixture.fs.file(CONNTRACK_SYSCTL_PATH).is_some());
    assert!(fixture.fs.file(NETWORK_SYSCTL_PATH).is_some());

    let units = fixture.supervisor.registered_units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name, SERVICE_NAME);
    assert!(units[0].expanded_command().join(" ").contains("--concurrency 4"));

    assert!(!fixture.runner.calls_starting_with("ss -ltnH").is_empty());
}

#[tokio::test]
async fn test_second_run_converges_to_same_state() {
    let fixture = Fixture::new();

    let first = fixture.orchestrator(settings()).run().await;
    let files_after_first = fixture.fs.snapshot();
    let writes_after_first = fixture.fs.write_count();

    let second = fixture.orchestrator(settings()).run().await;

    assert!(first.is_healthy());
    assert!(second.is_healthy(), "{}", second);
    assert_eq!(first.tuning, second.tuning);
    assert_eq!(fixture.fs.snapshot(), files_after_first);
    assert_eq!(fixture.fs.write_count(), writes_after_first);
    assert!(!second.config_changed);

    // One limits block, not two.
    let limits = fixture.fs.file(LIMITS_FILE_PATH).unwrap();
    assert_eq!(limits.matches("# >>> relayhost nofile >>>").count(), 1);

    assert_eq!(fixture.supervisor.instances().len(), 1);
    assert_eq!(fixture.supervisor.registered_units().len(), 1);
}

#[tokio::test]
async fn test_rerun_replaces_running_instance() {
    let fixture = Fixture::new();
    fixture.orchestrator(settings()).run().await;
    fixture.orchestrator(settings()).run().await;

    let lifecycle: Vec<_> = fixture
        .supervisor
        .events()
        .into_iter()
        .filter(|e| !matches!(e, SupervisorEvent::Pulled { .. }))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            SupervisorEvent::Started {
                name: SERVICE_NAME.to_string(),
                instance: 1
            },
            SupervisorEvent::Stopped {
                name: SERVICE_NAME.to_string(),
                instance: 1,
                forced: false
            },
            SupervisorEvent::Started {
                name: SERVICE_NAME.to_string(),
                instance: 2
            },
        ]
    );
    assert_eq!(
        fixture.supervisor.port_owner(80),
        Some(PortOwner::Instance {
            name: SERVICE_NAME.to_string(),
            instance: 2
        })
    );
}

#[tokio::test]
async fn test_conflicting_web_server_is_stopped() {
    let mut fixture = Fixture::new();
    fixture.supervisor = Arc::new(MemorySupervisor::new().with_conflicting_service("nginx", 80));

    let report = fixture.orchestrator(settings()).run().await;

    assert!(report.is_healthy(), "{}", report);
    assert_eq!(report.stopped_conflicts, vec!["nginx".to_string()]);
    assert!(matches!(
        fixture.supervisor.port_owner(80),
        Some(PortOwner::Instance { .. })
    ));
}

#[test]
fn test_invalid_settings_never_reach_the_host() {
    let mut builder = ProvisionSettings::builder();
    builder.listen_port = 0;
    assert!(matches!(
        builder.build(),
        Err(SettingsError::Invalid {
            field: "listen_port",
            ..
        })
    ));

    // The public listener cannot share the loopback admin port.
    let mut builder = ProvisionSettings::builder();
    builder.listen_port = ADMIN_PORT;
    assert!(matches!(
        builder.build(),
        Err(SettingsError::Invalid {
            field: "listen_port",
            ..
        })
    ));

    let mut builder = ProvisionSettings::builder();
    builder.target_host = String::new();
    assert!(matches!(
        builder.build(),
        Err(SettingsError::Invalid {
            field: "target_host",
            ..
        })
    ));

    // Without settings there is no orchestrator, so nothing was touched.
    let fixture = Fixture::new();
    assert!(fixture.fs.snapshot().is_empty());
    assert!(fixture.runner.calls().is_empty());
}

#[tokio::test]
async fn test_one_denied_tuning_file_is_a_warning() {
    let fixture = Fixture::new();
    fixture.fs.deny_writes(CONNTRACK_SYSCTL_PATH);

    let report = fixture.orchestrator(settings()).run().await;

    assert!(report.is_healthy(), "{}", report);
    assert_eq!(report.warnings.len(), 1);
    match &report.warnings[0] {
        ProvisionError::TuningWrite { target, cause } => {
            assert_eq!(target, CONNTRACK_SYSCTL_PATH);
            assert!(cause.contains("Permission denied"));
        }
        other => panic!("unexpected warning: {other}"),
    }
    assert!(!report.warnings[0].is_fatal());
    assert!(fixture.fs.file(CONNTRACK_SYSCTL_PATH).is_none());
    assert!(fixture.fs.file(NETWORK_SYSCTL_PATH).is_some());
    assert!(report.to_string().contains("Warnings:"));
}

#[tokio::test]
async fn test_unsupported_sysctl_does_not_stop_the_rest() {
    let fixture = Fixture::new();
    fixture.runner.respond(
        &["sysctl", "-w", "net.ipv4.tcp_tw_reuse=1"],
        ExecOutput::failed(255, "sysctl: cannot stat /proc/sys/net/ipv4/tcp_tw_reuse"),
    );

    let report = fixture.orchestrator(settings()).run().await;

    assert!(report.is_healthy());
    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(
        &report.warnings[0],
        ProvisionError::TuningWrite { target, .. } if target == "net.ipv4.tcp_tw_reuse"
    ));

    let applied = fixture.runner.calls_starting_with("sysctl -w");
    let tuning = report.tuning.unwrap();
    assert_eq!(applied.len(), tuning.conntrack.len() + tuning.network.len());
}

#[tokio::test]
async fn test_no_writable_tuning_file_is_fatal() {
    let fixture = Fixture::new();
    for path in [LIMITS_FILE_PATH, CONNTRACK_SYSCTL_PATH, NETWORK_SYSCTL_PATH] {
        fixture.fs.deny_writes(path);
    }

    let report = fixture.orchestrator(settings()).run().await;

    assert_eq!(
        report.state.failed_stage(),
        Some(&ProvisionState::PreconditionsChecked)
    );
    assert!(matches!(report.error, Some(ProvisionError::Privilege(_))));
    assert!(fixture.supervisor.events().is_empty());
}

#[tokio::test]
async fn test_unprivileged_run_fails_before_any_change() {
    let mut fixture = Fixture::new();
    fixture.privileged = false;

    let report = fixture.orchestrator(settings()).run().await;

    assert_eq!(report.state.failed_stage(), Some(&ProvisionState::Unstarted));
    assert!(matches!(report.error, Some(ProvisionError::Privilege(_))));
    assert!(fixture.fs.snapshot().is_empty());
    assert!(fixture.runner.calls().is_empty());
    assert!(fixture.supervisor.events().is_empty());
}

#[tokio::test]
async fn test_missing_prerequisite_is_installed() {
    let fixture = Fixture::new();
    fixture.runner.set_missing("docker");
    fixture.runner.provides("docker.io", "docker");

    let report = fixture.orchestrator(settings()).run().await;

    assert!(report.is_healthy(), "{}", report);
    assert_eq!(
        fixture.runner.calls_starting_with("apt-get install"),
        vec!["apt-get install -y docker.io"]
    );
}

#[tokio::test]
async fn test_pull_failure_is_fatal() {
    let fixture = Fixture::new();
    fixture.supervisor.fail_pull("manifest unknown");

    let report = fixture.orchestrator(settings()).run().await;

    assert_eq!(report.state.failed_stage(), Some(&ProvisionState::ConfigWritten));
    assert!(matches!(
        report.error,
        Some(ProvisionError::ArtifactFetch { .. })
    ));
    assert!(fixture.supervisor.instances().is_empty());
    assert!(report.to_string().contains("FAILED at stage ConfigWritten"));
}

#[tokio::test]
async fn test_start_failure_is_fatal() {
    let fixture = Fixture::new();
    fixture.supervisor.fail_start("exit status 125");

    let report = fixture.orchestrator(settings()).run().await;

    assert_eq!(report.state.failed_stage(), Some(&ProvisionState::ConfigWritten));
    assert!(matches!(report.error, Some(ProvisionError::ServiceStart(_))));
}

#[tokio::test]
async fn test_unresponsive_relay_times_out_but_keeps_running() {
    let mut fixture = Fixture::new();
    fixture.probe = StubProbe::new(false);

    let started = std::time::Instant::now();
    let report = fixture.orchestrator(settings()).run().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    match &report.state {
        ProvisionState::Failed { stage, cause } => {
            assert_eq!(**stage, ProvisionState::ServiceRunning);
            assert!(cause.starts_with("healthcheck-timeout"));
        }
        other => panic!("expected failure, got {other}"),
    }
    assert_eq!(fixture.supervisor.instances().len(), 1);
}

#[tokio::test]
async fn test_rerun_force_removes_relay_that_ignores_stop() {
    let fixture = Fixture::new();
    fixture.orchestrator(settings()).run().await;
    fixture.supervisor.ignore_graceful_stop();

    let report = fixture.orchestrator(settings()).run().await;

    assert!(report.is_healthy(), "{}", report);
    assert!(fixture.supervisor.events().contains(&SupervisorEvent::Stopped {
        name: SERVICE_NAME.to_string(),
        instance: 1,
        forced: true
    }));
    assert_eq!(
        fixture.supervisor.instances(),
        vec![(SERVICE_NAME.to_string(), 2)]
    );
    assert_eq!(
        fixture.supervisor.port_owner(80),
        Some(PortOwner::Instance {
            name: SERVICE_NAME.to_string(),
            instance: 2
        })
    );
}

#[tokio::test]
async fn test_crashed_relay_is_restarted() {
    let fixture = Fixture::new();
    fixture.orchestrator(settings()).run().await;
    let before = fixture.supervisor.instances();

    fixture.supervisor.simulate_crash(SERVICE_NAME);
    fixture.supervisor.simulate_crash(SERVICE_NAME);

    assert_eq!(fixture.supervisor.restart_count(SERVICE_NAME), Some(2));
    assert_eq!(fixture.supervisor.instances(), before);
}

#[tokio::test]
async fn test_teardown_removes_service_and_config_only() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(settings());
    orchestrator.run().await;

    orchestrator.teardown().await.unwrap();

    assert!(fixture.supervisor.instances().is_empty());
    assert!(fixture.supervisor.registered_units().is_empty());
    assert!(fixture.fs.file(RELAY_CONFIG_PATH).is_none());
    assert!(fixture.fs.file(LIMITS_FILE_PATH).is_some());
    assert!(fixture.fs.file(NETWORK_SYSCTL_PATH).is_some());

    // Nothing left to remove.
    orchestrator.teardown().await.unwrap();
}

#[tokio::test]
async fn test_progress_is_reported_per_stage() {
    let fixture = Fixture::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
    let report = fixture
        .orchestrator(settings())
        .with_progress(Arc::new(ChannelProgressReporter::new(tx)))
        .run()
        .await;
    assert!(report.is_healthy());

    let mut stages = Vec::new();
    let mut last = 0;
    while let Ok(progress) = rx.try_recv() {
        assert!(progress.percentage >= last);
        last = progress.percentage;
        stages.extend(progress.stage);
    }
    assert_eq!(
        stages,
        vec!["preflight", "tuning", "config", "service", "health", "healthy"]
    );
    assert_eq!(last, 100);
}

#[tokio::test]
async fn test_custom_config_path() {
    let fixture = Fixture::new();
    let report = fixture
        .orchestrator(settings())
        .with_config_path("/srv/relay/envoy.yaml")
        .run()
        .await;

    assert!(report.is_healthy());
    assert!(fixture.fs.file("/srv/relay/envoy.yaml").is_some());
    let unit = &fixture.supervisor.registered_units()[0];
    assert_eq!(unit.config_path, Path::new("/srv/relay/envoy.yaml"));
}

#[tokio::test]
async fn test_unmountable_config_path_fails_before_any_change() {
    let fixture = Fixture::new();
    let report = fixture
        .orchestrator(settings())
        .with_config_path("/srv/relay:v2/envoy.yaml")
        .run()
        .await;

    assert_eq!(report.state.failed_stage(), Some(&ProvisionState::Unstarted));
    assert!(matches!(report.error, Some(ProvisionError::Config { .. })));
    assert!(fixture.fs.snapshot().is_empty());
    assert!(fixture.runner.calls().is_empty());
    assert!(fixture.supervisor.events().is_empty());
}
