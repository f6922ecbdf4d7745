//! Relay health: the admin endpoint probe and the bounded polling loop.
use crate::constants::*;
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Something that can tell whether the relay is serving.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;

    /// Where the probe looks, for the summary.
    fn describe(&self) -> String;
}

/// Polls the relay's loopback admin endpoint. Envoy answers `GET /ready`
/// with 200 once its listeners are initialised.
pub struct AdminEndpointProbe {
    client: reqwest::Client,
    url: String,
}

impl AdminEndpointProbe {
    pub fn new(port: u16) -> Result<Self, reqwest::Error> {
        Self::with_url(format!("http://{}:{}/ready", ADMIN_BIND_ADDRESS, port))
    }

    pub fn with_url(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .connect_timeout(HEALTH_REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for AdminEndpointProbe {
    async fn is_healthy(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!("[Health] {} returned {}", self.url, response.status());
                false
            }
            Err(e) => {
                tracing::debug!("[Health] {} unreachable: {}", self.url, e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Polling window for [`wait_until_healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Delay between probes.
    pub interval: Duration,
    /// Total time allowed before giving up.
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

impl HealthCheckConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Probe until healthy or the window closes. Returns how long it took.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    config: HealthCheckConfig,
) -> Result<Duration, ProvisionError> {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe.is_healthy().await {
            let elapsed = started.elapsed();
            tracing::info!(
                "[Health] {} healthy after {} attempt(s), {:.1}s",
                probe.describe(),
                attempts,
                elapsed.as_secs_f64()
            );
            return Ok(elapsed);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                "[Health] {} not healthy after {} attempt(s)",
                probe.describe(),
                attempts
            );
            return Err(ProvisionError::HealthcheckTimeout {
                waited: config.timeout,
            });
        }
        tokio::time::sleep(config.interval.min(deadline - now)).await;
    }
}
