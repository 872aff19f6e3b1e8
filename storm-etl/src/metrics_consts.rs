pub const MESSAGES_CONSUMED: &str = "etl_messages_consumed_total";
pub const MESSAGES_PRODUCED: &str = "etl_messages_produced_total";
pub const TRANSFORM_ERRORS: &str = "etl_transform_errors_total";
pub const MESSAGES_DEAD_LETTERED: &str = "etl_messages_dead_lettered_total";
pub const ACK_ERRORS: &str = "etl_ack_errors_total";
pub const PROCESSING_DURATION: &str = "etl_processing_duration_seconds";
pub const BATCH_SIZE: &str = "etl_batch_size";
pub const PIPELINE_RUNNING: &str = "etl_pipeline_running";

pub const GEOCODE_REQUESTS: &str = "etl_geocode_requests_total";
pub const GEOCODE_API_DURATION: &str = "etl_geocode_api_duration_seconds";
pub const GEOCODE_CACHE_HITS: &str = "etl_geocode_cache_hits_total";
pub const GEOCODE_CACHE_MISSES: &str = "etl_geocode_cache_misses_total";

pub const PROCESSING_DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];
pub const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];
