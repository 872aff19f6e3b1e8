use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{Offset, RecvErr, SingleTopicConsumer};
use common_kafka::kafka_producer::{send_records_to_kafka, KafkaContext, OwnedRecord};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, OwnedMessage};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ack::{AckHandle, Acknowledge};
use crate::error::{AckError, ExtractError, LoadError, TransformError};
use crate::event::{OutputEvent, RawEvent};
use crate::pipeline::{DeadLetterSink, Extractor, Loader};

/// Offset token of one consumed record.
struct KafkaAck(Offset);

impl Acknowledge for KafkaAck {
    fn ack(self: Box<Self>) -> Result<(), AckError> {
        self.0.store()?;
        Ok(())
    }

    fn nack(self: Box<Self>) {
        // Leaving the offset unstored is enough
        debug!(
            partition = self.0.partition(),
            offset = self.0.offset(),
            "record released without storing its offset"
        );
    }
}

/// Source topic reader. Each record carries an ack handle storing its offset.
pub struct KafkaSource {
    consumer: SingleTopicConsumer,
    flush_interval: Duration,
}

impl KafkaSource {
    pub fn new(consumer: SingleTopicConsumer, flush_interval: Duration) -> Self {
        Self {
            consumer,
            flush_interval,
        }
    }

    /// Commit the stored offsets, meant for shutdown.
    pub fn commit(&self) -> Result<(), KafkaError> {
        self.consumer.commit_stored()
    }
}

fn to_raw_event(message: OwnedMessage, offset: Offset) -> RawEvent {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h.value.map(String::from_utf8_lossy).unwrap_or_default();
                    (h.key.to_string(), value.into_owned())
                })
                .collect()
        })
        .unwrap_or_else(HashMap::new);

    RawEvent {
        key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        ack: Some(AckHandle::new(KafkaAck(offset))),
    }
}

#[async_trait]
impl Extractor for KafkaSource {
    async fn extract(&self, cancel: &CancellationToken) -> Result<RawEvent, ExtractError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExtractError::Cancelled),
            received = self.consumer.recv() => match received {
                Ok((message, offset)) => Ok(to_raw_event(message, offset)),
                Err(RecvErr::Kafka(e)) => Err(e.into()),
            },
        }
    }

    async fn extract_batch(
        &self,
        max_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawEvent>, ExtractError> {
        let mut batch = Vec::with_capacity(max_size);
        // One deadline for the whole batch, not per record
        let deadline = tokio::time::Instant::now() + self.flush_interval;

        while batch.len() < max_size {
            let received = tokio::select! {
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => None,
                received = self.consumer.recv() => Some(received),
            };
            let Some(received) = received else {
                break;
            };

            match received {
                Ok((message, offset)) => batch.push(to_raw_event(message, offset)),
                Err(RecvErr::Kafka(e)) if batch.is_empty() => return Err(e.into()),
                Err(RecvErr::Kafka(e)) => {
                    warn!(error = %e, gathered = batch.len(), "kafka recv error, flushing partial batch");
                    break;
                }
            }
        }

        Ok(batch)
    }
}

fn output_record(output: &OutputEvent) -> OwnedRecord {
    OwnedRecord {
        key: Some(output.key.clone()),
        payload: output.value.clone(),
        headers: output
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

async fn send_all(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    records: &[OwnedRecord],
) -> Result<(), LoadError> {
    let total = records.len();
    let mut errors = send_records_to_kafka(producer, topic, records)
        .await
        .into_iter()
        .filter_map(Result::err);

    let Some(first) = errors.next() else {
        return Ok(());
    };
    let failed = 1 + errors.count();
    if total == 1 {
        return Err(LoadError::Produce(first));
    }
    Err(LoadError::Partial {
        failed,
        total,
        first,
    })
}

/// Sink topic writer.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }

    /// Wait for in-flight deliveries, meant for shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(Timeout::After(timeout))
    }
}

#[async_trait]
impl Loader for KafkaSink {
    async fn load(&self, output: &OutputEvent) -> Result<(), LoadError> {
        send_all(&self.producer, &self.topic, &[output_record(output)]).await
    }

    async fn load_batch(&self, outputs: &[OutputEvent]) -> Result<(), LoadError> {
        if outputs.is_empty() {
            return Ok(());
        }
        let records: Vec<OwnedRecord> = outputs.iter().map(output_record).collect();
        send_all(&self.producer, &self.topic, &records).await
    }
}

/// Dead-letter topic writer. Records keep their key, value and headers, plus
/// the failure and their source coordinates.
#[derive(Clone)]
pub struct KafkaDeadLetter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetter {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

pub fn dead_letter_record(raw: &RawEvent, error: &TransformError) -> OwnedRecord {
    let mut headers: Vec<(String, String)> = raw
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();
    headers.extend([
        ("error".to_string(), error.to_string()),
        ("source_topic".to_string(), raw.topic.clone()),
        ("source_partition".to_string(), raw.partition.to_string()),
        ("source_offset".to_string(), raw.offset.to_string()),
    ]);

    OwnedRecord {
        key: (!raw.key.is_empty()).then(|| raw.key.clone()),
        payload: raw.value.clone(),
        headers,
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetter {
    async fn dead_letter(&self, raw: &RawEvent, error: &TransformError) -> Result<(), LoadError> {
        send_all(&self.producer, &self.topic, &[dead_letter_record(raw, error)]).await
    }
}
