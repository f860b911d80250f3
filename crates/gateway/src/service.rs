//! Service wiring: bus connection + resource cache lifecycle.

use nats_client::{BusError, NatsClient, DEFAULT_REQUEST_TIMEOUT};
use res_cache::{Cache, CacheConfig};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Service configuration, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// NATS server URL.
    pub nats_url: String,
    /// Reply timeout for bus get requests.
    pub request_timeout: Duration,
    /// Grace period before idle resources release their bus
    /// subscription.
    pub unsubscribe_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            unsubscribe_grace: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            nats_url: env::var("NATS_URL").unwrap_or(defaults.nats_url),
            request_timeout: env_millis("REQUEST_TIMEOUT_MS", defaults.request_timeout),
            unsubscribe_grace: env_millis("UNSUBSCRIBE_GRACE_MS", defaults.unsubscribe_grace),
        }
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => Duration::from_millis(
            raw.parse()
                .unwrap_or_else(|_| panic!("{key} must be a number of milliseconds")),
        ),
        Err(_) => default,
    }
}

/// The running gateway core: a connected bus client and the resource
/// cache coordinating subscriptions over it.
///
/// Client-facing frontends embed this and subscribe their sessions
/// through [`Service::cache`].
pub struct Service {
    nats: Arc<NatsClient>,
    cache: Cache,
}

impl Service {
    /// Connect to the bus and start the cache.
    pub async fn connect(config: ServiceConfig) -> Result<Self, BusError> {
        let nats = Arc::new(NatsClient::connect(&config.nats_url, config.request_timeout).await?);
        let cache = Cache::new(
            nats.clone(),
            CacheConfig {
                unsubscribe_grace: config.unsubscribe_grace,
            },
        );
        cache.start();
        info!("Gateway service started");
        Ok(Self { nats, cache })
    }

    /// The resource cache, for frontends to subscribe through.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The underlying bus client.
    pub fn nats(&self) -> &Arc<NatsClient> {
        &self.nats
    }

    /// Drain in-flight work and release bus subscriptions.
    pub fn stop(&self) {
        info!("Stopping gateway service");
        self.cache.stop();
    }
}
