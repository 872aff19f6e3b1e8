//! Consume raw storm reports, enrich them and publish them to the sink topic.
use std::sync::Arc;

use anyhow::Context;
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use common_metrics::{serve, setup_metrics_recorder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use storm_etl::cache::CachedGeocoder;
use storm_etl::config::{Config, LogFormat};
use storm_etl::kafka::{KafkaDeadLetter, KafkaSink, KafkaSource};
use storm_etl::mapbox::MapboxClient;
use storm_etl::metrics_consts::{
    BATCH_SIZE, BATCH_SIZE_BUCKETS, PROCESSING_DURATION, PROCESSING_DURATION_BUCKETS,
};
use storm_etl::pipeline::{Pipeline, PoisonPolicy};
use storm_etl::router::router;
use storm_etl::time::SystemTime;
use storm_etl::transform::StormTransformer;

fn setup_tracing(config: &Config) {
    // RUST_LOG wins over LOG_LEVEL, librdkafka chatter stays at warn
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},rdkafka=warn", config.log_directive()))
    });

    let log_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown(cancel: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!(signal = "SIGTERM", "shutting down gracefully"),
        _ = signal::ctrl_c() => info!(signal = "SIGINT", "shutting down gracefully"),
        _ = cancel.cancelled() => {},
    };

    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // No subscriber yet, a config error reaches stderr through main's result
    let config = Config::load().context("invalid configuration")?;
    setup_tracing(&config);

    info!(
        brokers = %config.kafka.kafka_hosts,
        source_topic = %config.consumer.kafka_consumer_topic,
        sink_topic = %config.kafka_sink_topic,
        consumer_group = %config.consumer.kafka_consumer_group,
        mode = ?config.pipeline_mode(),
        geocoding = config.geocoding_enabled(),
        "starting storm-etl"
    );

    let recorder = setup_metrics_recorder(&[
        (PROCESSING_DURATION, PROCESSING_DURATION_BUCKETS),
        (BATCH_SIZE, BATCH_SIZE_BUCKETS),
    ])
    .context("failed to install the metrics recorder")?;

    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())
        .context("failed to create the kafka consumer")?;
    let producer = create_kafka_producer(&config.kafka)
        .await
        .context("failed to create the kafka producer")?;

    let source = KafkaSource::new(consumer, config.batch_flush_interval_ms.0);
    let sink = KafkaSink::new(producer.clone(), config.kafka_sink_topic.clone());

    let mut transformer = StormTransformer::new(Arc::new(SystemTime {}));
    if let Some(token) = config.token().filter(|_| config.geocoding_enabled()) {
        let client = MapboxClient::new(token.to_string(), config.mapbox_timeout_ms.0)
            .context("failed to create the mapbox client")?;
        let capacity = config.geocode_cache_capacity();
        info!(cache_capacity = capacity, "mapbox geocoding enabled");
        transformer = transformer.with_geocoder(Arc::new(CachedGeocoder::new(client, capacity)));
    }

    let poison = match &config.kafka_dead_letter_topic {
        Some(topic) => {
            info!(topic = %topic, "dead-lettering records that fail to transform");
            PoisonPolicy::DeadLetter(Arc::new(KafkaDeadLetter::new(producer, topic.clone())))
        }
        None => PoisonPolicy::Redeliver,
    };

    let pipeline = Pipeline::new(source, transformer, sink.clone())
        .with_mode(config.pipeline_mode())
        .with_backoff(config.backoff())
        .with_poison_policy(poison);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown(cancel.clone()));

    let bind = config.bind();
    let app = router(pipeline.readiness(), Some(recorder));
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        info!(bind = %bind, "serving health and metrics");
        let stopped = server_cancel.clone();
        if let Err(e) = serve(app, &bind, async move { stopped.cancelled().await }).await {
            error!(error = %e, "http server failed");
            // The pipeline is useless without its probes
            server_cancel.cancel();
        }
    });

    pipeline.run(cancel.clone()).await;

    let timeout = config.shutdown_timeout_ms.0;
    if tokio::time::timeout(timeout, server).await.is_err() {
        warn!(timeout_ms = timeout.as_millis() as u64, "http server did not stop in time");
    }
    if let Err(e) = sink.flush(timeout) {
        warn!(error = %e, "failed to flush pending deliveries");
    }
    if let Err(e) = pipeline.extractor().commit() {
        warn!(error = %e, "failed to commit stored offsets");
    }

    info!("storm-etl stopped");
    Ok(())
}
