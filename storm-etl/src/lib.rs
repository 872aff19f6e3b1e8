pub mod ack;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod geocode;
pub mod kafka;
pub mod mapbox;
pub mod metrics_consts;
pub mod pipeline;
pub mod router;
pub mod time;
pub mod transform;
