use common_kafka::kafka_consumer::OffsetErr;
use common_kafka::kafka_producer::KafkaProduceError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors fetching records from the source topic.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Errors turning a raw record into an output record. A record failing here
/// is handed to the poison policy, it is never retried in place.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to parse raw event: {0}")]
    Parse(serde_json::Error),
    #[error("failed to serialize storm event: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Errors publishing records to the sink or dead-letter topic.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Produce(#[from] KafkaProduceError),
    #[error("{failed} of {total} records failed to publish, first error: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: KafkaProduceError,
    },
}

#[derive(Error, Debug)]
pub enum AckError {
    #[error("failed to store offset: {0}")]
    Store(#[from] OffsetErr),
}

/// Geocoding failures. Cheap to clone so cached lookups can share them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Request(String),
    #[error("geocoding service answered with status {0}")]
    Status(u16),
    #[error("failed to decode geocoding response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envconfig::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
