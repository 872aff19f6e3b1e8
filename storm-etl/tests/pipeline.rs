use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use common_kafka::kafka_consumer::OffsetErr;
use common_kafka::kafka_producer::KafkaProduceError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use serde_json::{json, Value};
use storm_etl::ack::{AckHandle, Acknowledge};
use storm_etl::backoff::BackoffPolicy;
use storm_etl::error::{AckError, ExtractError, GeocodeError, LoadError, TransformError};
use storm_etl::event::{Geo, OutputEvent, RawEvent};
use storm_etl::geocode::{Geocoder, GeocodingResult};
use storm_etl::pipeline::{
    DeadLetterSink, Extractor, Loader, Pipeline, PipelineMode, PoisonPolicy,
};
use storm_etl::time::TimeSource;
use storm_etl::transform::StormTransformer;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const VALID: &str = r#"{"id":"evt-1","type":"wind","magnitude":60,"unit":"mph"}"#;
const POISON: &str = "{invalid json";

#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        self.time
    }
}

fn transformer() -> StormTransformer {
    StormTransformer::new(Arc::new(FixedTime {
        time: datetime!(2024-04-26 16:00:05 UTC),
    }))
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
}

/// Settlement log shared by every record of a test.
#[derive(Clone, Default)]
struct AckLog {
    acked: Arc<Mutex<Vec<i64>>>,
    nacked: Arc<Mutex<Vec<i64>>>,
}

impl AckLog {
    fn acked(&self) -> Vec<i64> {
        self.acked.lock().unwrap().clone()
    }

    fn nacked(&self) -> Vec<i64> {
        self.nacked.lock().unwrap().clone()
    }

    fn record(&self, offset: i64, value: &str) -> RawEvent {
        RawEvent {
            topic: "raw-weather-reports".to_string(),
            offset,
            ..RawEvent::new(value)
        }
        .with_ack(AckHandle::new(SpyAck {
            offset,
            log: self.clone(),
            fail: false,
        }))
    }
}

struct SpyAck {
    offset: i64,
    log: AckLog,
    fail: bool,
}

impl Acknowledge for SpyAck {
    fn ack(self: Box<Self>) -> Result<(), AckError> {
        if self.fail {
            return Err(AckError::Store(OffsetErr::Gone));
        }
        self.log.acked.lock().unwrap().push(self.offset);
        Ok(())
    }

    fn nack(self: Box<Self>) {
        self.log.nacked.lock().unwrap().push(self.offset);
    }
}

/// Hands out scripted results, then cancels the run once drained.
struct ScriptedExtractor {
    single: Mutex<VecDeque<Result<RawEvent, ExtractError>>>,
    batches: Mutex<VecDeque<Result<Vec<RawEvent>, ExtractError>>>,
}

impl ScriptedExtractor {
    fn single(items: Vec<Result<RawEvent, ExtractError>>) -> Self {
        Self {
            single: Mutex::new(items.into()),
            batches: Mutex::new(VecDeque::new()),
        }
    }

    fn batches(batches: Vec<Result<Vec<RawEvent>, ExtractError>>) -> Self {
        Self {
            single: Mutex::new(VecDeque::new()),
            batches: Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, cancel: &CancellationToken) -> Result<RawEvent, ExtractError> {
        let next = self.single.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            cancel.cancel();
            Err(ExtractError::Cancelled)
        })
    }

    async fn extract_batch(
        &self,
        _max_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawEvent>, ExtractError> {
        let next = self.batches.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            cancel.cancel();
            Err(ExtractError::Cancelled)
        })
    }
}

/// Never yields anything until cancelled.
struct IdleExtractor;

#[async_trait]
impl Extractor for IdleExtractor {
    async fn extract(&self, cancel: &CancellationToken) -> Result<RawEvent, ExtractError> {
        cancel.cancelled().await;
        Err(ExtractError::Cancelled)
    }

    async fn extract_batch(
        &self,
        _max_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawEvent>, ExtractError> {
        cancel.cancelled().await;
        Err(ExtractError::Cancelled)
    }
}

#[derive(Clone, Default)]
struct MemorySink {
    published: Arc<Mutex<Vec<OutputEvent>>>,
    batches: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl MemorySink {
    fn failing(times: usize) -> Self {
        let sink = Self::default();
        sink.failures_left.store(times, Ordering::SeqCst);
        sink
    }

    fn published(&self) -> Vec<OutputEvent> {
        self.published.lock().unwrap().clone()
    }

    fn attempt(&self) -> Result<(), LoadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LoadError::Produce(KafkaProduceError::KafkaProduceCanceled));
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for MemorySink {
    async fn load(&self, output: &OutputEvent) -> Result<(), LoadError> {
        self.attempt()?;
        self.published.lock().unwrap().push(output.clone());
        Ok(())
    }

    async fn load_batch(&self, outputs: &[OutputEvent]) -> Result<(), LoadError> {
        self.attempt()?;
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.published.lock().unwrap().extend_from_slice(outputs);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryDeadLetter {
    parked: Mutex<Vec<(i64, String)>>,
    fail: bool,
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn dead_letter(&self, raw: &RawEvent, error: &TransformError) -> Result<(), LoadError> {
        if self.fail {
            return Err(LoadError::Produce(KafkaProduceError::KafkaProduceCanceled));
        }
        self.parked
            .lock()
            .unwrap()
            .push((raw.offset, error.to_string()));
        Ok(())
    }
}

async fn run_to_completion<E, L>(pipeline: &Pipeline<E, StormTransformer, L>)
where
    E: Extractor,
    L: Loader,
{
    tokio::time::timeout(Duration::from_secs(5), pipeline.run(CancellationToken::new()))
        .await
        .expect("pipeline did not stop");
}

fn broker_down() -> ExtractError {
    ExtractError::Kafka(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    ))
}

#[tokio::test]
async fn publishes_then_acknowledges() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(7, VALID)), Ok(log.record(8, VALID))]),
        transformer(),
        sink.clone(),
    )
    .with_backoff(fast_backoff());

    assert!(!pipeline.is_ready());
    run_to_completion(&pipeline).await;

    assert_eq!(sink.published().len(), 2);
    assert_eq!(log.acked(), vec![7, 8]);
    assert!(log.nacked().is_empty());
    assert!(pipeline.is_ready());
}

#[tokio::test]
async fn transform_failure_is_never_acknowledged() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(1, POISON)), Ok(log.record(2, VALID))]),
        transformer(),
        sink.clone(),
    )
    .with_backoff(fast_backoff());

    run_to_completion(&pipeline).await;

    assert_eq!(sink.published().len(), 1);
    assert_eq!(log.acked(), vec![2]);
    assert_eq!(log.nacked(), vec![1]);
}

#[tokio::test]
async fn only_poison_never_marks_ready() {
    let log = AckLog::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(1, POISON))]),
        transformer(),
        MemorySink::default(),
    );

    run_to_completion(&pipeline).await;

    assert!(log.acked().is_empty());
    assert!(!pipeline.is_ready());
}

#[tokio::test]
async fn dead_letter_policy_parks_then_acknowledges() {
    let log = AckLog::default();
    let dead_letters = Arc::new(MemoryDeadLetter::default());
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(3, POISON))]),
        transformer(),
        MemorySink::default(),
    )
    .with_poison_policy(PoisonPolicy::DeadLetter(dead_letters.clone()));

    run_to_completion(&pipeline).await;

    let parked = dead_letters.parked.lock().unwrap().clone();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].0, 3);
    assert!(parked[0].1.starts_with("failed to parse raw event"));
    assert_eq!(log.acked(), vec![3]);
    assert!(log.nacked().is_empty());
}

#[tokio::test]
async fn failed_dead_letter_releases_the_record() {
    let log = AckLog::default();
    let dead_letters = Arc::new(MemoryDeadLetter {
        fail: true,
        ..Default::default()
    });
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(3, POISON))]),
        transformer(),
        MemorySink::default(),
    )
    .with_poison_policy(PoisonPolicy::DeadLetter(dead_letters));

    run_to_completion(&pipeline).await;

    assert!(log.acked().is_empty());
    assert_eq!(log.nacked(), vec![3]);
}

#[tokio::test]
async fn load_failure_retries_the_same_output() {
    let log = AckLog::default();
    let sink = MemorySink::failing(2);
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(5, VALID))]),
        transformer(),
        sink.clone(),
    )
    .with_backoff(fast_backoff());

    run_to_completion(&pipeline).await;

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sink.published().len(), 1);
    assert_eq!(sink.published()[0].key, b"evt-1");
    assert_eq!(log.acked(), vec![5]);
}

#[tokio::test]
async fn cancellation_during_load_retries_releases_the_record() {
    let log = AckLog::default();
    let sink = MemorySink::failing(usize::MAX);
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(9, VALID))]),
        transformer(),
        sink.clone(),
    )
    .with_backoff(fast_backoff());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), pipeline.run(cancel))
        .await
        .expect("pipeline did not stop");

    assert!(sink.attempts.load(Ordering::SeqCst) > 1);
    assert!(log.acked().is_empty());
    assert_eq!(log.nacked(), vec![9]);
    assert!(!pipeline.is_ready());
}

#[tokio::test]
async fn extract_errors_back_off_then_resume() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![
            Err(broker_down()),
            Err(broker_down()),
            Ok(log.record(11, VALID)),
        ]),
        transformer(),
        sink.clone(),
    )
    .with_backoff(fast_backoff());

    run_to_completion(&pipeline).await;

    assert_eq!(sink.published().len(), 1);
    assert_eq!(log.acked(), vec![11]);
}

#[tokio::test]
async fn failed_ack_does_not_stop_the_loop() {
    let log = AckLog::default();
    let failing = RawEvent {
        offset: 1,
        ..RawEvent::new(VALID)
    }
    .with_ack(AckHandle::new(SpyAck {
        offset: 1,
        log: log.clone(),
        fail: true,
    }));
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(failing), Ok(log.record(2, VALID))]),
        transformer(),
        sink.clone(),
    );

    run_to_completion(&pipeline).await;

    assert_eq!(sink.published().len(), 2);
    assert_eq!(log.acked(), vec![2]);
}

#[tokio::test]
async fn batch_mode_publishes_survivors_together() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::batches(vec![Ok(vec![
            log.record(0, VALID),
            log.record(1, POISON),
            log.record(2, VALID),
        ])]),
        transformer(),
        sink.clone(),
    )
    .with_mode(PipelineMode::Batch { size: 10 })
    .with_backoff(fast_backoff());

    run_to_completion(&pipeline).await;

    assert_eq!(sink.batches.load(Ordering::SeqCst), 1);
    assert_eq!(sink.published().len(), 2);
    assert_eq!(log.acked(), vec![0, 2]);
    assert_eq!(log.nacked(), vec![1]);
    assert!(pipeline.is_ready());
}

#[tokio::test]
async fn batch_mode_retries_the_whole_batch() {
    let log = AckLog::default();
    let sink = MemorySink::failing(1);
    let pipeline = Pipeline::new(
        ScriptedExtractor::batches(vec![Ok(vec![log.record(0, VALID), log.record(1, VALID)])]),
        transformer(),
        sink.clone(),
    )
    .with_mode(PipelineMode::Batch { size: 10 })
    .with_backoff(fast_backoff());

    run_to_completion(&pipeline).await;

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sink.published().len(), 2);
    assert_eq!(log.acked(), vec![0, 1]);
}

#[tokio::test]
async fn empty_batches_are_skipped() {
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::batches(vec![Ok(vec![]), Ok(vec![])]),
        transformer(),
        sink.clone(),
    )
    .with_mode(PipelineMode::Batch { size: 10 });

    run_to_completion(&pipeline).await;

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
    assert!(!pipeline.is_ready());
}

#[tokio::test]
async fn batch_of_only_poison_publishes_nothing() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::batches(vec![Ok(vec![log.record(0, POISON), log.record(1, POISON)])]),
        transformer(),
        sink.clone(),
    )
    .with_mode(PipelineMode::Batch { size: 10 });

    run_to_completion(&pipeline).await;

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(log.nacked(), vec![0, 1]);
    assert!(!pipeline.is_ready());
}

#[tokio::test]
async fn idle_pipeline_stops_on_cancel() {
    for mode in [PipelineMode::Single, PipelineMode::Batch { size: 50 }] {
        let pipeline =
            Pipeline::new(IdleExtractor, transformer(), MemorySink::default()).with_mode(mode);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), pipeline.run(cancel))
            .await
            .expect("pipeline did not stop");
        assert!(!pipeline.is_ready());
    }
}

#[tokio::test]
async fn hail_report_end_to_end() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let payload = json!({
        "id": "evt-001",
        "type": "hail",
        "geo": {"lat": 35.18, "lon": -97.44},
        "magnitude": 175,
        "unit": "in",
        "begin_time": "2024-04-26T15:45:00Z",
        "end_time": "2024-04-26T15:50:00Z",
        "source": "trained spotter",
        "location": {"raw": "8 ESE Chappel", "county": "San Saba", "state": "TX"},
        "comments": "Quarter to golf ball hail (OUN)"
    })
    .to_string();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(0, &payload))]),
        transformer(),
        sink.clone(),
    );

    run_to_completion(&pipeline).await;

    let published = sink.published();
    assert_eq!(published.len(), 1);
    let output = &published[0];
    assert_eq!(output.key, b"evt-001");
    assert_eq!(output.headers["type"], "hail");
    assert_eq!(output.headers["processed_at"], "2024-04-26T16:00:05Z");

    let value: Value = serde_json::from_slice(&output.value).unwrap();
    assert_json_eq!(
        value,
        json!({
            "id": "evt-001",
            "type": "hail",
            "geo": {"lat": 35.18, "lon": -97.44},
            "magnitude": 1.75,
            "unit": "in",
            "begin_time": "2024-04-26T15:45:00Z",
            "end_time": "2024-04-26T15:50:00Z",
            "source": "trained spotter",
            "location": {
                "raw": "8 ESE Chappel",
                "name": "Chappel",
                "distance": 8.0,
                "direction": "ESE",
                "county": "San Saba",
                "state": "TX"
            },
            "comments": "Quarter to golf ball hail (OUN)",
            "severity": "severe",
            "source_office": "OUN",
            "time_bucket": "2024-04-26T15:00:00Z",
            "processed_at": "2024-04-26T16:00:05Z"
        })
    );
    assert_eq!(log.acked(), vec![0]);
}

struct PinnedGeocoder;

#[async_trait]
impl Geocoder for PinnedGeocoder {
    async fn forward(&self, name: &str, state: &str) -> Result<GeocodingResult, GeocodeError> {
        Ok(GeocodingResult {
            formatted_address: format!("{name}, {state}, United States"),
            place_name: name.to_string(),
            confidence: 1.0,
            geo: Geo::new(30.27, -97.74),
        })
    }

    async fn reverse(&self, _lat: f64, _lon: f64) -> Result<GeocodingResult, GeocodeError> {
        Err(GeocodeError::Status(500))
    }
}

#[tokio::test]
async fn geocoding_fills_missing_coordinates() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let payload = json!({
        "id": "evt-geo",
        "type": "wind",
        "magnitude": 65,
        "location": {"raw": "5.2 NW AUSTIN", "state": "TX"}
    })
    .to_string();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(0, &payload))]),
        transformer().with_geocoder(Arc::new(PinnedGeocoder)),
        sink.clone(),
    );

    run_to_completion(&pipeline).await;

    let value: Value = serde_json::from_slice(&sink.published()[0].value).unwrap();
    assert_eq!(value["geo"], json!({"lat": 30.27, "lon": -97.74}));
    assert_eq!(value["geocoding"]["source"], "forward");
    assert_eq!(value["geocoding"]["place_name"], "AUSTIN");
    assert_eq!(value["severity"], "moderate");
    assert_eq!(log.acked(), vec![0]);
}

/// Publishes that never complete, like a broker that stopped answering.
struct StalledSink;

#[async_trait]
impl Loader for StalledSink {
    async fn load(&self, _output: &OutputEvent) -> Result<(), LoadError> {
        std::future::pending().await
    }

    async fn load_batch(&self, _outputs: &[OutputEvent]) -> Result<(), LoadError> {
        std::future::pending().await
    }
}

struct StalledGeocoder;

#[async_trait]
impl Geocoder for StalledGeocoder {
    async fn forward(&self, _name: &str, _state: &str) -> Result<GeocodingResult, GeocodeError> {
        std::future::pending().await
    }

    async fn reverse(&self, _lat: f64, _lon: f64) -> Result<GeocodingResult, GeocodeError> {
        std::future::pending().await
    }
}

struct StalledDeadLetter;

#[async_trait]
impl DeadLetterSink for StalledDeadLetter {
    async fn dead_letter(&self, _raw: &RawEvent, _error: &TransformError) -> Result<(), LoadError> {
        std::future::pending().await
    }
}

fn cancel_soon() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn cancel_abandons_a_stalled_publish() {
    for mode in [PipelineMode::Single, PipelineMode::Batch { size: 10 }] {
        let log = AckLog::default();
        let extractor = match mode {
            PipelineMode::Single => ScriptedExtractor::single(vec![Ok(log.record(4, VALID))]),
            PipelineMode::Batch { .. } => ScriptedExtractor::batches(vec![Ok(vec![
                log.record(4, VALID),
                log.record(5, VALID),
            ])]),
        };
        let pipeline = Pipeline::new(extractor, transformer(), StalledSink).with_mode(mode);

        tokio::time::timeout(Duration::from_secs(5), pipeline.run(cancel_soon()))
            .await
            .expect("pipeline did not stop");

        assert!(log.acked().is_empty());
        assert!(log.nacked().contains(&4));
        assert!(!pipeline.is_ready());
    }
}

#[tokio::test]
async fn cancel_abandons_a_stalled_geocode() {
    let log = AckLog::default();
    let payload = json!({
        "id": "evt-stuck",
        "type": "hail",
        "magnitude": 1.0,
        "location": {"raw": "AUSTIN", "state": "TX"}
    })
    .to_string();
    let batch = vec![log.record(0, &payload), log.record(1, VALID)];
    let pipeline = Pipeline::new(
        ScriptedExtractor::batches(vec![Ok(batch)]),
        transformer().with_geocoder(Arc::new(StalledGeocoder)),
        MemorySink::default(),
    )
    .with_mode(PipelineMode::Batch { size: 10 });

    tokio::time::timeout(Duration::from_secs(5), pipeline.run(cancel_soon()))
        .await
        .expect("pipeline did not stop");

    assert!(log.acked().is_empty());
    assert_eq!(log.nacked(), vec![0, 1]);
}

#[tokio::test]
async fn cancel_abandons_a_stalled_dead_letter() {
    let log = AckLog::default();
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(6, POISON))]),
        transformer(),
        MemorySink::default(),
    )
    .with_poison_policy(PoisonPolicy::DeadLetter(Arc::new(StalledDeadLetter)));

    tokio::time::timeout(Duration::from_secs(5), pipeline.run(cancel_soon()))
        .await
        .expect("pipeline did not stop");

    assert!(log.acked().is_empty());
    assert_eq!(log.nacked(), vec![6]);
}

#[tokio::test]
async fn null_fields_are_not_poison() {
    let log = AckLog::default();
    let sink = MemorySink::default();
    let payload =
        r#"{"id":"evt-null","type":"wind","magnitude":58,"comments":null,"geo":null,"location":{"raw":"AUSTIN","county":null}}"#;
    let pipeline = Pipeline::new(
        ScriptedExtractor::single(vec![Ok(log.record(0, payload))]),
        transformer(),
        sink.clone(),
    );

    run_to_completion(&pipeline).await;

    assert_eq!(sink.published().len(), 1);
    assert_eq!(log.acked(), vec![0]);
}
