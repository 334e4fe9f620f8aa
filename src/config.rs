// =============================================================================
// Process Configuration — environment-driven settings for every subsystem
// =============================================================================
//
// All knobs are read once at startup from the environment (with .env support
// via dotenv in main). Unparsable values fall back to the default with a
// warning rather than aborting; only genuinely required values (broker
// credentials in real mode) are validated at the point of use.
// =============================================================================

use std::time::Duration;

use tracing::warn;

/// Read an env var, falling back to `default` when unset or unparsable.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparsable env value — using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_or_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// =============================================================================
// Broker settings
// =============================================================================

/// Connection and order constants for the broker adapter.
///
/// The order constants (variety, product, order type) are configuration, not
/// hardcoded call-site literals, so a deployment can switch e.g. product
/// without a rebuild.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Daily request token obtained out-of-band; consumed by session renewal.
    pub request_token: String,
    pub variety: String,
    pub product: String,
    pub order_type: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// How long `place_order` waits for the order to reach a terminal state.
    pub order_timeout: Duration,
    /// Delay between order-status polls while waiting for completion.
    pub order_poll_interval: Duration,
}

impl BrokerSettings {
    fn from_env() -> Self {
        Self {
            base_url: env_or_string("BROKER_URL", "https://api.kite.trade"),
            api_key: env_or_string("BROKER_API_KEY", ""),
            api_secret: env_or_string("BROKER_API_SECRET", ""),
            request_token: env_or_string("BROKER_REQUEST_TOKEN", ""),
            variety: env_or_string("BROKER_VARIETY", "regular"),
            product: env_or_string("BROKER_PRODUCT", "CNC"),
            order_type: env_or_string("BROKER_ORDER_TYPE", "MARKET"),
            request_timeout: Duration::from_secs(env_or("BROKER_REQUEST_TIMEOUT", 10)),
            order_timeout: Duration::from_secs(env_or("BROKER_ORDER_TIMEOUT", 30)),
            order_poll_interval: Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Ingester settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct IngesterSettings {
    pub base_url: String,
    /// Sync can trigger a long historical fetch upstream, so its timeout is
    /// much larger than the broker's.
    pub request_timeout: Duration,
}

impl IngesterSettings {
    fn from_env() -> Self {
        Self {
            base_url: env_or_string("INGESTER_URL", "http://localhost:8000"),
            request_timeout: Duration::from_secs(env_or("INGESTER_REQUEST_TIMEOUT", 120)),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,

    /// Strategy-run worker and execution orchestrator poll interval (seconds).
    pub run_poll_interval: u64,
    /// Task dispatcher poll interval (seconds).
    pub dispatch_poll_interval: u64,
    /// Watchdog sweep interval (seconds).
    pub watchdog_poll_interval: u64,

    /// How far into the past the dispatcher window reaches, to absorb
    /// scheduler jitter (seconds).
    pub dispatch_buffer_secs: i64,
    /// Grace period before the watchdog declares a scheduled task a zombie
    /// (seconds).
    pub watchdog_buffer_secs: i64,

    pub broker: BrokerSettings,
    pub ingester: IngesterSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or_string("DATABASE_URL", "sqlite:meridian.db?mode=rwc"),
            bind_addr: env_or_string("BIND_ADDR", "0.0.0.0:3001"),
            run_poll_interval: env_or("RUN_POLL_INTERVAL", 60),
            dispatch_poll_interval: env_or("DISPATCH_POLL_INTERVAL", 10),
            watchdog_poll_interval: env_or("WATCHDOG_POLL_INTERVAL", 1800),
            dispatch_buffer_secs: env_or("DISPATCH_BUFFER", 170),
            watchdog_buffer_secs: env_or("WATCHDOG_BUFFER", 600),
            broker: BrokerSettings::from_env(),
            ingester: IngesterSettings::from_env(),
        }
    }
}
