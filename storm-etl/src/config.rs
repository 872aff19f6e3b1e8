use std::str::FromStr;
use std::time;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

use crate::backoff::BackoffPolicy;
use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::ConfigError;
use crate::pipeline::PipelineMode;

pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "transformed-weather-data")]
    pub kafka_sink_topic: String,

    // Unset keeps poison records on the source topic
    pub kafka_dead_letter_topic: Option<String>,

    #[envconfig(default = "info")]
    pub log_level: String,

    #[envconfig(default = "json")]
    pub log_format: LogFormat,

    #[envconfig(default = "10000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "50")]
    pub batch_size: usize,

    #[envconfig(default = "500")]
    pub batch_flush_interval_ms: EnvMsDuration,

    #[envconfig(default = "200")]
    pub backoff_initial_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub backoff_max_ms: EnvMsDuration,

    pub mapbox_token: Option<String>,

    // Defaults to whether a token is set
    pub mapbox_enabled: Option<bool>,

    #[envconfig(default = "5000")]
    pub mapbox_timeout_ms: EnvMsDuration,

    // Kept raw, invalid sizes fall back to the default instead of failing startup
    #[envconfig(default = "1000")]
    pub mapbox_cache_size: String,
}

impl Config {
    /// Read the environment and validate it, any failure is fatal.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::init_from_env()?;
        config.validate()?;
        config.kafka.kafka_hosts = config.brokers().join(",");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers().is_empty() {
            return Err(ConfigError::invalid(
                "KAFKA_HOSTS",
                "at least one broker is required",
            ));
        }
        if self.consumer.kafka_consumer_group.trim().is_empty() {
            return Err(ConfigError::invalid("KAFKA_CONSUMER_GROUP", "must not be empty"));
        }
        if self.consumer.kafka_consumer_topic.trim().is_empty() {
            return Err(ConfigError::invalid("KAFKA_CONSUMER_TOPIC", "must not be empty"));
        }
        if !matches!(
            self.consumer.kafka_consumer_offset_reset.as_str(),
            "earliest" | "latest"
        ) {
            return Err(ConfigError::invalid(
                "KAFKA_CONSUMER_OFFSET_RESET",
                "must be earliest or latest",
            ));
        }
        if self.kafka_sink_topic.trim().is_empty() {
            return Err(ConfigError::invalid("KAFKA_SINK_TOPIC", "must not be empty"));
        }
        if matches!(&self.kafka_dead_letter_topic, Some(topic) if topic.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "KAFKA_DEAD_LETTER_TOPIC",
                "must not be empty when set",
            ));
        }
        if self.shutdown_timeout_ms.0.is_zero() {
            return Err(ConfigError::invalid("SHUTDOWN_TIMEOUT_MS", "must be positive"));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::invalid("BATCH_SIZE", "must be 1-1000"));
        }
        if self.batch_flush_interval_ms.0.is_zero() {
            return Err(ConfigError::invalid(
                "BATCH_FLUSH_INTERVAL_MS",
                "must be positive",
            ));
        }
        if self.backoff_initial_ms.0.is_zero() {
            return Err(ConfigError::invalid("BACKOFF_INITIAL_MS", "must be positive"));
        }
        if self.backoff_max_ms.0 < self.backoff_initial_ms.0 {
            return Err(ConfigError::invalid(
                "BACKOFF_MAX_MS",
                "must not be below BACKOFF_INITIAL_MS",
            ));
        }
        if self.mapbox_timeout_ms.0.is_zero() {
            return Err(ConfigError::invalid("MAPBOX_TIMEOUT_MS", "must be positive"));
        }
        if self.geocoding_enabled() && self.token().is_none() {
            return Err(ConfigError::invalid(
                "MAPBOX_TOKEN",
                "required when MAPBOX_ENABLED is true",
            ));
        }
        Ok(())
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn brokers(&self) -> Vec<&str> {
        self.kafka
            .kafka_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .collect()
    }

    pub fn pipeline_mode(&self) -> PipelineMode {
        PipelineMode::from_batch_size(self.batch_size)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_initial_ms.0, self.backoff_max_ms.0)
    }

    pub fn token(&self) -> Option<&str> {
        self.mapbox_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn geocoding_enabled(&self) -> bool {
        self.mapbox_enabled.unwrap_or_else(|| self.token().is_some())
    }

    pub fn geocode_cache_capacity(&self) -> u64 {
        match self.mapbox_cache_size.trim().parse::<i64>() {
            Ok(size) if size > 0 => size as u64,
            _ => DEFAULT_CACHE_CAPACITY,
        }
    }

    /// `LOG_LEVEL` as a filter directive, unknown levels fall back to info.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.trim().to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError;

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            _ => Err(ParseLogFormatError),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
