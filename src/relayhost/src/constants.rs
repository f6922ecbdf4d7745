//! Well-known paths, ports and defaults for a relay host.

use std::time::Duration;

/// Default public port the relay listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 80;

/// Default upstream host when none is configured.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Default upstream port.
pub const DEFAULT_TARGET_PORT: u16 = 1155;

/// Default relay image. Pinned to a minor release line so re-provisioning
/// does not silently jump major versions.
pub const DEFAULT_RELAY_IMAGE: &str = "envoyproxy/envoy:v1.31-latest";

/// Default soft/hard nofile limit for the relay and for login sessions.
pub const DEFAULT_FD_LIMIT: u64 = 200_000;

/// Default connection-tracking table size.
pub const DEFAULT_CONNTRACK_MAX: u64 = 524_288;

/// Default circuit-breaker ceiling on simultaneous upstream connections.
pub const DEFAULT_MAX_UPSTREAM_CONNECTIONS: u64 = 100_000;

/// Default upstream connect timeout. Short so an unreachable upstream fails fast.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Accepted connect timeout range.
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the relay re-resolves the upstream hostname.
pub const DNS_REFRESH_RATE: Duration = Duration::from_secs(30);

/// Loopback-only admin/stats endpoint of the relay.
pub const ADMIN_BIND_ADDRESS: &str = "127.0.0.1";
pub const ADMIN_PORT: u16 = 9901;

/// Health polling defaults.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);
pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Stable name of the supervised relay unit and its container.
pub const SERVICE_NAME: &str = "relayhost-envoy";

/// Fixed delay between automatic restarts of the relay unit.
pub const RESTART_DELAY: Duration = Duration::from_secs(3);

/// Grace period given to in-flight connections on stop.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Time past the stop grace period before the relay is killed outright.
pub const STOP_KILL_MARGIN: Duration = Duration::from_secs(5);

/// Container runtime unit the relay depends on.
pub const RUNTIME_UNIT: &str = "docker.service";

/// Generated relay configuration on the host, and where it is mounted
/// (read-only) inside the relay container.
pub const RELAY_CONFIG_PATH: &str = "/etc/relayhost/envoy.yaml";
pub const RELAY_CONFIG_MOUNT: &str = "/etc/envoy/envoy.yaml";

/// Optional provisioning settings file.
pub const SETTINGS_FILE_PATH: &str = "/etc/relayhost/relayhost.toml";

/// Directory holding systemd unit files.
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Persisted tuning files.
pub const LIMITS_FILE_PATH: &str = "/etc/security/limits.conf";
pub const CONNTRACK_SYSCTL_PATH: &str = "/etc/sysctl.d/99-relayhost-conntrack.conf";
pub const NETWORK_SYSCTL_PATH: &str = "/etc/sysctl.d/99-relayhost-network.conf";

/// Kernel module providing the conntrack table.
pub const CONNTRACK_MODULE: &str = "nf_conntrack";
pub const CONNTRACK_MAX_KEY: &str = "net.netfilter.nf_conntrack_max";

/// Generic web servers that commonly hold the public port.
pub const CONFLICTING_SERVICES: &[&str] = &["nginx", "apache2", "httpd", "caddy", "lighttpd"];

/// Container runtime CLI as invoked from the unit file.
pub const DOCKER_BIN: &str = "/usr/bin/docker";
