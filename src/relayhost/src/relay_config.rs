//! Relay configuration document.
//!
//! The relay is Envoy, so the document is an Envoy v3 bootstrap: a loopback
//! admin endpoint plus static `listeners` and `clusters`. It is built as
//! typed values from validated settings and serialised with `serde_yaml`;
//! nothing is spliced into text. Rendering is pure: the same settings
//! always produce the same bytes.
use crate::constants::*;
use crate::error::ProvisionError;
use crate::host::HostFs;
use crate::settings::ProvisionSettings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LISTENER_NAME: &str = "relay_listener";
pub const CLUSTER_NAME: &str = "relay_upstream";
pub const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
pub const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";

const DOCUMENT_HEADER: &str = "# Managed by relayhost. Regenerated on every provisioning run.\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayConfig {
    pub admin: Admin,
    pub static_resources: StaticResources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admin {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

impl Address {
    fn new(address: &str, port: u16) -> Self {
        Self {
            socket_address: SocketAddress {
                address: address.to_string(),
                port_value: port,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticResources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    /// SO_REUSEPORT: each worker gets its own accept socket.
    pub enable_reuse_port: bool,
    pub connection_balance_config: ConnectionBalanceConfig,
    pub filter_chains: Vec<FilterChain>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionBalanceConfig {
    pub exact_balance: ExactBalance,
}

/// Every worker gets an equal share of new connections regardless of load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExactBalance {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterChain {
    pub filters: Vec<NetworkFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkFilter {
    pub name: String,
    pub typed_config: TcpProxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpProxy {
    #[serde(rename = "@type")]
    pub type_url: String,
    pub stat_prefix: String,
    pub cluster: String,
    /// `0s` disables the idle timeout: quiet sessions are never dropped.
    pub idle_timeout: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryType {
    /// Re-resolve via DNS periodically; every resolved address is an endpoint.
    StrictDns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbPolicy {
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    #[serde(rename = "type")]
    pub discovery_type: DiscoveryType,
    pub dns_refresh_rate: String,
    pub lb_policy: LbPolicy,
    pub connect_timeout: String,
    pub circuit_breakers: CircuitBreakers,
    pub upstream_connection_options: UpstreamConnectionOptions,
    pub load_assignment: LoadAssignment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakers {
    pub thresholds: Vec<Thresholds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub max_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamConnectionOptions {
    pub tcp_keepalive: TcpKeepalive,
}

/// Empty message enables keep-alive with kernel defaults (tuned via sysctl).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpKeepalive {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalityEndpoints {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: Address,
}

impl RelayConfig {
    /// Build the document for `settings`.
    pub fn from_settings(settings: &ProvisionSettings) -> Self {
        let listener = Listener {
            name: LISTENER_NAME.to_string(),
            address: Address::new("0.0.0.0", settings.listen_port()),
            enable_reuse_port: true,
            connection_balance_config: ConnectionBalanceConfig {
                exact_balance: ExactBalance {},
            },
            filter_chains: vec![FilterChain {
                filters: vec![NetworkFilter {
                    name: TCP_PROXY_FILTER.to_string(),
                    typed_config: TcpProxy {
                        type_url: TCP_PROXY_TYPE_URL.to_string(),
                        stat_prefix: "relay_tcp".to_string(),
                        cluster: CLUSTER_NAME.to_string(),
                        idle_timeout: format_duration(Duration::ZERO),
                    },
                }],
            }],
        };

        let cluster = Cluster {
            name: CLUSTER_NAME.to_string(),
            discovery_type: DiscoveryType::StrictDns,
            dns_refresh_rate: format_duration(DNS_REFRESH_RATE),
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout: format_duration(settings.connect_timeout()),
            circuit_breakers: CircuitBreakers {
                thresholds: vec![Thresholds {
                    max_connections: settings.max_upstream_connections(),
                }],
            },
            upstream_connection_options: UpstreamConnectionOptions {
                tcp_keepalive: TcpKeepalive {},
            },
            load_assignment: LoadAssignment {
                cluster_name: CLUSTER_NAME.to_string(),
                endpoints: vec![LocalityEndpoints {
                    lb_endpoints: vec![LbEndpoint {
                        endpoint: Endpoint {
                            address: Address::new(settings.target_host(), settings.target_port()),
                        },
                    }],
                }],
            },
        };

        Self {
            admin: Admin {
                address: Address::new(ADMIN_BIND_ADDRESS, ADMIN_PORT),
            },
            static_resources: StaticResources {
                listeners: vec![listener],
                clusters: vec![cluster],
            },
        }
    }

    /// Serialise to the YAML document written on disk.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!("{}{}", DOCUMENT_HEADER, body))
    }
}

/// Outcome of writing the relay document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWrite {
    pub path: PathBuf,
    pub document: String,
    /// False when the file already held identical content.
    pub changed: bool,
}

/// Renders the relay document and places it at a well-known path.
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    path: PathBuf,
}

impl Default for ConfigGenerator {
    fn default() -> Self {
        Self::new(RELAY_CONFIG_PATH)
    }
}

impl ConfigGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the document text for `settings`.
    pub fn render(&self, settings: &ProvisionSettings) -> Result<String, ProvisionError> {
        RelayConfig::from_settings(settings)
            .to_yaml()
            .map_err(|e| ProvisionError::Config {
                path: self.path.clone(),
                cause: e.to_string(),
            })
    }

    /// Render and atomically replace the previous document. Never merges.
    pub fn write(
        &self,
        fs: &dyn HostFs,
        settings: &ProvisionSettings,
    ) -> Result<ConfigWrite, ProvisionError> {
        let document = self.render(settings)?;
        let changed = match fs.read_to_string(&self.path) {
            Ok(existing) => existing != document,
            Err(_) => true,
        };

        if changed {
            fs.write_atomic(&self.path, document.as_bytes())
                .map_err(|e| ProvisionError::Config {
                    path: self.path.clone(),
                    cause: e.to_string(),
                })?;
            tracing::info!(
                "[ConfigGenerator] Wrote relay config {} ({} bytes)",
                self.path.display(),
                document.len()
            );
        } else {
            tracing::info!(
                "[ConfigGenerator] Relay config {} unchanged",
                self.path.display()
            );
        }

        Ok(ConfigWrite {
            path: self.path.clone(),
            document,
            changed,
        })
    }
}

/// Envoy duration string: whole seconds as `30s`, otherwise `0.500s`.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}.{:03}s", millis / 1000, millis % 1000)
    }
}
