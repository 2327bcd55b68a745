//! Bridge configuration, read from environment variables.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use orderflow_infra::PipelineConfig;
use orderflow_infra::delivery::RetryPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where records come from and go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process log and queues, with the demo order producer.
    Memory,
    Redis,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err("expected memory or redis".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub backend: Backend,
    pub redis_url: String,
    pub source_stream: String,
    pub partitions: u32,
    pub consumer_group: String,
    pub consumer_name: String,
    pub destination_queue: String,
    pub dead_letter_queue: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub drain_timeout: Duration,
    pub schema_file: Option<PathBuf>,
    pub status_addr: SocketAddr,
    /// `None` disables the demo producer.
    pub demo_publish_interval: Option<Duration>,
    /// Upper bound on the demo fulfillment's warehouse processing time.
    pub fulfillment_delay: Duration,
    pub database_url: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            source_stream: "orders.created".to_string(),
            partitions: 1,
            consumer_group: "order-fulfillment-service".to_string(),
            consumer_name: "bridge-1".to_string(),
            destination_queue: "orders.fulfillment".to_string(),
            dead_letter_queue: "orders.fulfillment.dlq".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            schema_file: None,
            status_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            demo_publish_interval: Some(Duration::from_secs(1)),
            fulfillment_delay: Duration::from_secs(2),
            database_url: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let string = |var: &str, default: String| lookup(var).filter(|v| !v.is_empty()).unwrap_or(default);
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, var, default.as_millis() as u64).map(Duration::from_millis)
        };

        let demo_ms = parse(
            &lookup,
            "DEMO_PUBLISH_INTERVAL_MS",
            defaults.demo_publish_interval.map_or(0, |d| d.as_millis() as u64),
        )?;

        let config = Self {
            backend: parse(&lookup, "BACKEND", defaults.backend)?,
            redis_url: string("REDIS_URL", defaults.redis_url),
            source_stream: string("SOURCE_STREAM", defaults.source_stream),
            partitions: parse(&lookup, "PARTITIONS", defaults.partitions)?,
            consumer_group: string("CONSUMER_GROUP", defaults.consumer_group),
            consumer_name: string("CONSUMER_NAME", defaults.consumer_name),
            destination_queue: string("DESTINATION_QUEUE", defaults.destination_queue),
            dead_letter_queue: string("DEAD_LETTER_QUEUE", defaults.dead_letter_queue),
            batch_size: parse(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            poll_interval: millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            max_attempts: parse(&lookup, "MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: millis("BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis("BACKOFF_MAX_MS", defaults.backoff_max)?,
            drain_timeout: millis("DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            schema_file: lookup("SCHEMA_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            status_addr: parse(&lookup, "STATUS_ADDR", defaults.status_addr)?,
            demo_publish_interval: (demo_ms > 0).then(|| Duration::from_millis(demo_ms)),
            fulfillment_delay: millis("FULFILLMENT_DELAY_MS", defaults.fulfillment_delay)?,
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
        };
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let positive = |var: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                })
            } else {
                Ok(())
            }
        };
        positive("PARTITIONS", u64::from(self.partitions))?;
        positive("BATCH_SIZE", self.batch_size as u64)?;
        positive("MAX_ATTEMPTS", u64::from(self.max_attempts))?;
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid {
                var: "BACKOFF_MAX_MS",
                value: self.backoff_max.as_millis().to_string(),
                reason: "must not be below BACKOFF_BASE_MS".to_string(),
            });
        }
        Ok(self)
    }

    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy::doubling(self.max_attempts, self.backoff_base, self.backoff_max)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
            .with_publish_retry(self.publish_retry())
            .with_drain_timeout(self.drain_timeout)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        BridgeConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_match_the_order_pipeline() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.source_stream, "orders.created");
        assert_eq!(config.consumer_group, "order-fulfillment-service");
        assert_eq!(config.dead_letter_queue, "orders.fulfillment.dlq");
        assert_eq!(config.publish_retry().max_attempts, 5);
        assert_eq!(config.fulfillment_delay, Duration::from_secs(2));
    }

    #[test]
    fn variables_override_defaults() {
        let config = config_from(&[
            ("BACKEND", "Redis"),
            ("PARTITIONS", "4"),
            ("MAX_ATTEMPTS", "3"),
            ("POLL_INTERVAL_MS", "250"),
            ("STATUS_ADDR", "127.0.0.1:9000"),
            ("DEMO_PUBLISH_INTERVAL_MS", "0"),
            ("FULFILLMENT_DELAY_MS", "0"),
            ("SCHEMA_FILE", "/etc/orderflow/schemas.json"),
        ])
        .unwrap();

        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.partitions, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.status_addr.port(), 9000);
        assert_eq!(config.demo_publish_interval, None);
        assert_eq!(config.fulfillment_delay, Duration::ZERO);
        assert_eq!(config.schema_file, Some(PathBuf::from("/etc/orderflow/schemas.json")));
    }

    #[test]
    fn parse_errors_name_the_variable() {
        let err = config_from(&[("BATCH_SIZE", "ten")]).unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { var: "BATCH_SIZE", .. }));
        assert!(err.to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn zero_partitions_are_rejected() {
        assert!(matches!(
            config_from(&[("PARTITIONS", "0")]),
            Err(ConfigError::Invalid { var: "PARTITIONS", .. })
        ));
    }

    #[test]
    fn backoff_cap_must_cover_base() {
        assert!(config_from(&[("BACKOFF_BASE_MS", "5000"), ("BACKOFF_MAX_MS", "100")]).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(matches!(
            config_from(&[("BACKEND", "kafka")]),
            Err(ConfigError::Invalid { var: "BACKEND", .. })
        ));
    }
}
