//! Node configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use bus::RetryPolicy;
use outbox::RelayConfig;
use payment::PaymentConfig;
use stock::StockConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Node configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (unset: in-memory stores)
/// - `METRICS_ADDR`: Prometheus exporter listen address (unset: no exporter)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `RELAY_POLL_INTERVAL_MS` (200), `RELAY_BATCH_SIZE` (100),
///   `RELAY_BACKOFF_MAX_MS` (10000)
/// - `MAX_DELIVERY_ATTEMPTS` (5), `RETRY_BACKOFF_MS` (100)
/// - `CHARGE_TIMEOUT_MS` (5000), `PAYMENT_LATENCY_MS` (1000)
/// - `STOCK_CHECK_TIMEOUT_MS` (5000)
/// - `SEED_PRODUCTS`: insert the demo catalogue into an empty store (default: `true`)
///
/// `RUST_LOG` is read by the tracing filter directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_format: LogFormat,
    pub relay: RelayConfig,
    pub retry: RetryPolicy,
    pub payment: PaymentConfig,
    /// Simulated gateway latency.
    pub payment_latency: Duration,
    pub stock: StockConfig,
    pub seed_products: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`. Unparseable values fall back to
    /// their defaults, as does zero for poll intervals and timeouts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let nonzero_millis = |key: &str, default: Duration| {
            Some(millis(key, default))
                .filter(|d| !d.is_zero())
                .unwrap_or(default)
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            metrics_addr: lookup("METRICS_ADDR").and_then(|addr| addr.trim().parse().ok()),
            log_format: match lookup("LOG_FORMAT").as_deref().map(str::trim) {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            relay: RelayConfig {
                poll_interval: nonzero_millis("RELAY_POLL_INTERVAL_MS", defaults.relay.poll_interval),
                batch_size: lookup("RELAY_BATCH_SIZE")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|size| *size > 0)
                    .unwrap_or(defaults.relay.batch_size),
                backoff_max: nonzero_millis("RELAY_BACKOFF_MAX_MS", defaults.relay.backoff_max),
                ..defaults.relay
            },
            retry: RetryPolicy {
                max_attempts: lookup("MAX_DELIVERY_ATTEMPTS")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|attempts| *attempts > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                base_backoff: millis("RETRY_BACKOFF_MS", defaults.retry.base_backoff),
                ..defaults.retry
            },
            payment: PaymentConfig {
                charge_timeout: nonzero_millis("CHARGE_TIMEOUT_MS", defaults.payment.charge_timeout),
            },
            payment_latency: millis("PAYMENT_LATENCY_MS", defaults.payment_latency),
            stock: StockConfig {
                check_timeout: nonzero_millis("STOCK_CHECK_TIMEOUT_MS", defaults.stock.check_timeout),
            },
            seed_products: lookup("SEED_PRODUCTS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.seed_products),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            metrics_addr: None,
            log_format: LogFormat::Text,
            relay: RelayConfig::default(),
            retry: RetryPolicy::default(),
            payment: PaymentConfig::default(),
            payment_latency: Duration::from_secs(1),
            stock: StockConfig::default(),
            seed_products: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]);
        assert!(config.database_url.is_none());
        assert!(config.metrics_addr.is_none());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(200));
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.payment.charge_timeout, Duration::from_secs(5));
        assert_eq!(config.payment_latency, Duration::from_secs(1));
        assert_eq!(config.stock.check_timeout, Duration::from_secs(5));
        assert!(config.seed_products);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/saga"),
            ("METRICS_ADDR", "127.0.0.1:9000"),
            ("LOG_FORMAT", "JSON"),
            ("RELAY_BATCH_SIZE", "10"),
            ("MAX_DELIVERY_ATTEMPTS", "3"),
            ("CHARGE_TIMEOUT_MS", "250"),
            ("SEED_PRODUCTS", "false"),
        ]);

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/saga"));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.relay.batch_size, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.payment.charge_timeout, Duration::from_millis(250));
        assert!(!config.seed_products);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = load(&[
            ("DATABASE_URL", "  "),
            ("METRICS_ADDR", "not an address"),
            ("RELAY_BATCH_SIZE", "0"),
            ("RELAY_POLL_INTERVAL_MS", "0"),
            ("RELAY_BACKOFF_MAX_MS", "0"),
            ("CHARGE_TIMEOUT_MS", "0"),
            ("STOCK_CHECK_TIMEOUT_MS", "0"),
            ("RETRY_BACKOFF_MS", "soon"),
            ("SEED_PRODUCTS", "maybe"),
        ]);

        assert!(config.database_url.is_none());
        assert!(config.metrics_addr.is_none());
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(200));
        assert_eq!(config.relay.backoff_max, Duration::from_secs(10));
        assert_eq!(config.payment.charge_timeout, Duration::from_secs(5));
        assert_eq!(config.stock.check_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.base_backoff, Duration::from_millis(100));
        assert!(config.seed_products);
    }

    #[test]
    fn test_zero_latency_is_allowed() {
        let config = load(&[("PAYMENT_LATENCY_MS", "0"), ("RETRY_BACKOFF_MS", "0")]);
        assert_eq!(config.payment_latency, Duration::ZERO);
        assert_eq!(config.retry.base_backoff, Duration::ZERO);
    }
}
