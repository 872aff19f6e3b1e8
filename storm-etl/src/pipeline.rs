use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use health::{Readiness, ReadinessFlag};
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{sleep_with_cancel, BackoffPolicy};
use crate::error::{ExtractError, LoadError, TransformError};
use crate::event::{OutputEvent, RawEvent};
use crate::metrics_consts::{
    ACK_ERRORS, BATCH_SIZE, MESSAGES_CONSUMED, MESSAGES_DEAD_LETTERED, MESSAGES_PRODUCED,
    PIPELINE_RUNNING, PROCESSING_DURATION, TRANSFORM_ERRORS,
};
use crate::transform::Transform;

/// Source of raw records.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Wait for the next record. Fails with `ExtractError::Cancelled` once `cancel` fires.
    async fn extract(&self, cancel: &CancellationToken) -> Result<RawEvent, ExtractError>;

    /// Gather up to `max_size` records, returning early with a partial (possibly
    /// empty) batch when the flush interval elapses or `cancel` fires. An error
    /// is only returned when nothing was gathered.
    async fn extract_batch(
        &self,
        max_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawEvent>, ExtractError>;
}

/// Destination of transformed records.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, output: &OutputEvent) -> Result<(), LoadError>;

    /// Publish every record or fail as a whole. An empty batch is a no-op.
    async fn load_batch(&self, outputs: &[OutputEvent]) -> Result<(), LoadError>;
}

/// Parking place for records that cannot be transformed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, raw: &RawEvent, error: &TransformError) -> Result<(), LoadError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineMode {
    Single,
    Batch { size: usize },
}

impl PipelineMode {
    pub fn from_batch_size(size: usize) -> Self {
        if size <= 1 {
            PipelineMode::Single
        } else {
            PipelineMode::Batch { size }
        }
    }
}

/// What happens to a record whose transform failed.
#[derive(Clone, Default)]
pub enum PoisonPolicy {
    /// Release without acknowledging, the record comes back after a restart or rebalance.
    #[default]
    Redeliver,
    /// Park the original record, then acknowledge it. Released if parking fails.
    DeadLetter(Arc<dyn DeadLetterSink>),
}

#[derive(Clone, Copy)]
enum Outgoing<'a> {
    One(&'a OutputEvent),
    Batch(&'a [OutputEvent]),
}

impl Outgoing<'_> {
    fn len(&self) -> usize {
        match self {
            Outgoing::One(_) => 1,
            Outgoing::Batch(outputs) => outputs.len(),
        }
    }
}

/// Extract, transform, load then acknowledge, one record or batch at a time.
///
/// A record's acknowledgment is only invoked once its output was published,
/// which makes delivery at-least-once.
pub struct Pipeline<E, T, L> {
    extractor: E,
    transformer: T,
    loader: L,
    mode: PipelineMode,
    poison: PoisonPolicy,
    backoff: BackoffPolicy,
    readiness: ReadinessFlag,
}

impl<E, T, L> Pipeline<E, T, L>
where
    E: Extractor,
    T: Transform,
    L: Loader,
{
    pub fn new(extractor: E, transformer: T, loader: L) -> Self {
        Self {
            extractor,
            transformer,
            loader,
            mode: PipelineMode::Single,
            poison: PoisonPolicy::default(),
            backoff: BackoffPolicy::default(),
            readiness: ReadinessFlag::new(),
        }
    }

    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_poison_policy(mut self, poison: PoisonPolicy) -> Self {
        self.poison = poison;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Handle for the probes, latched after the first fully processed record or batch.
    pub fn readiness(&self) -> ReadinessFlag {
        self.readiness.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Loop until `cancel` fires. Cancellation is the only way out and is not an error.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(mode = ?self.mode, "pipeline started");
        gauge!(PIPELINE_RUNNING).set(1.0);

        match self.mode {
            PipelineMode::Single => self.run_single(&cancel).await,
            PipelineMode::Batch { size } => self.run_batch(size, &cancel).await,
        }

        gauge!(PIPELINE_RUNNING).set(0.0);
        info!(reason = "cancelled", "pipeline stopped");
    }

    async fn run_single(&self, cancel: &CancellationToken) {
        let mut backoff = self.backoff.initial();

        while !cancel.is_cancelled() {
            let raw = match self.extractor.extract(cancel).await {
                Ok(raw) => raw,
                Err(ExtractError::Cancelled) => break,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "extract failed");
                    if !self.back_off(&mut backoff, cancel).await {
                        break;
                    }
                    continue;
                }
            };
            counter!(MESSAGES_CONSUMED).increment(1);
            let start = Instant::now();

            let output = match self.transform(&raw, cancel).await {
                Some(Ok(output)) => output,
                Some(Err(e)) => {
                    self.reject(raw, e, cancel).await;
                    continue;
                }
                None => {
                    release(raw);
                    break;
                }
            };

            if !self
                .publish(Outgoing::One(&output), &mut backoff, cancel)
                .await
            {
                release(raw);
                break;
            }
            counter!(MESSAGES_PRODUCED).increment(1);
            acknowledge(raw);

            self.complete_cycle(start, &mut backoff);
        }
    }

    async fn run_batch(&self, size: usize, cancel: &CancellationToken) {
        let mut backoff = self.backoff.initial();

        while !cancel.is_cancelled() {
            let batch = match self.extractor.extract_batch(size, cancel).await {
                Ok(batch) => batch,
                Err(ExtractError::Cancelled) => break,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "batch extract failed");
                    if !self.back_off(&mut backoff, cancel).await {
                        break;
                    }
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }
            counter!(MESSAGES_CONSUMED).increment(batch.len() as u64);
            histogram!(BATCH_SIZE).record(batch.len() as f64);
            let start = Instant::now();

            let mut transformed = Vec::with_capacity(batch.len());
            let mut outputs = Vec::with_capacity(batch.len());
            let mut pending = batch.into_iter();
            let mut interrupted = false;
            for raw in pending.by_ref() {
                match self.transform(&raw, cancel).await {
                    Some(Ok(output)) => {
                        outputs.push(output);
                        transformed.push(raw);
                    }
                    Some(Err(e)) => self.reject(raw, e, cancel).await,
                    None => {
                        release(raw);
                        interrupted = true;
                        break;
                    }
                }
            }
            if interrupted {
                transformed.into_iter().chain(pending).for_each(release);
                break;
            }
            if outputs.is_empty() {
                continue;
            }

            if !self
                .publish(Outgoing::Batch(&outputs), &mut backoff, cancel)
                .await
            {
                transformed.into_iter().for_each(release);
                break;
            }
            counter!(MESSAGES_PRODUCED).increment(outputs.len() as u64);
            // Fetch order, so a partition's position only moves forward
            transformed.into_iter().for_each(acknowledge);

            self.complete_cycle(start, &mut backoff);
        }
    }

    /// Transform one record, or `None` if cancelled first.
    async fn transform(
        &self,
        raw: &RawEvent,
        cancel: &CancellationToken,
    ) -> Option<Result<OutputEvent, TransformError>> {
        tokio::select! {
            biased;
            result = self.transformer.transform(raw) => Some(result),
            _ = cancel.cancelled() => None,
        }
    }

    /// Publish until success. Returns `false` if cancelled before that.
    async fn publish(
        &self,
        outgoing: Outgoing<'_>,
        backoff: &mut Duration,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let load = async {
                match outgoing {
                    Outgoing::One(output) => self.loader.load(output).await,
                    Outgoing::Batch(outputs) => self.loader.load_batch(outputs).await,
                }
            };
            // An in-flight publish is abandoned on shutdown, its records are released
            let result = tokio::select! {
                biased;
                result = load => result,
                _ = cancel.cancelled() => return false,
            };

            match result {
                Ok(()) => return true,
                Err(_) if cancel.is_cancelled() => return false,
                Err(e) => {
                    error!(
                        error = %e,
                        records = outgoing.len(),
                        backoff_ms = backoff.as_millis() as u64,
                        "load failed"
                    );
                    if !self.back_off(backoff, cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn reject(&self, raw: RawEvent, error: TransformError, cancel: &CancellationToken) {
        warn!(
            error = %error,
            topic = %raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            "transform failed, skipping record"
        );
        counter!(TRANSFORM_ERRORS).increment(1);

        let PoisonPolicy::DeadLetter(sink) = &self.poison else {
            release(raw);
            return;
        };

        let parked = tokio::select! {
            biased;
            result = sink.dead_letter(&raw, &error) => Some(result),
            _ = cancel.cancelled() => None,
        };
        match parked {
            Some(Ok(())) => {
                counter!(MESSAGES_DEAD_LETTERED).increment(1);
                acknowledge(raw);
            }
            Some(Err(e)) => {
                error!(
                    error = %e,
                    topic = %raw.topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    "failed to dead-letter record"
                );
                release(raw);
            }
            None => release(raw),
        }
    }

    async fn back_off(&self, backoff: &mut Duration, cancel: &CancellationToken) -> bool {
        if !sleep_with_cancel(*backoff, cancel).await {
            return false;
        }
        *backoff = self.backoff.next(*backoff);
        true
    }

    fn complete_cycle(&self, start: Instant, backoff: &mut Duration) {
        histogram!(PROCESSING_DURATION).record(start.elapsed().as_secs_f64());
        *backoff = self.backoff.initial();
        self.readiness.mark_ready();
    }
}

fn acknowledge(raw: RawEvent) {
    let Some(ack) = raw.ack else {
        return;
    };
    if let Err(e) = ack.ack() {
        counter!(ACK_ERRORS).increment(1);
        warn!(
            error = %e,
            topic = %raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            "failed to acknowledge record"
        );
    }
}

fn release(raw: RawEvent) {
    if let Some(ack) = raw.ack {
        debug!(
            topic = %raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            "releasing unacknowledged record"
        );
        ack.nack();
    }
}
