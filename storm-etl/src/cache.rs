use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::GeocodeError;
use crate::geocode::{Geocoder, GeocodingResult};
use crate::metrics_consts::{GEOCODE_CACHE_HITS, GEOCODE_CACHE_MISSES};

pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Lookup {
    Forward { name: String, state: String },
    // Rounded the way the lookup is sent, so nearby readings share an entry
    Reverse(String),
}

impl Lookup {
    fn source(&self) -> &'static str {
        match self {
            Lookup::Forward { .. } => "forward",
            Lookup::Reverse(_) => "reverse",
        }
    }
}

/// Bounded in-memory cache in front of any `Geocoder`.
///
/// Successful lookups are cached, no-match answers included. Errors are not,
/// the next event for the same place tries again.
#[derive(Clone)]
pub struct CachedGeocoder<G> {
    inner: Arc<G>,
    cache: Cache<Lookup, GeocodingResult>,
}

impl<G: Geocoder + 'static> CachedGeocoder<G> {
    pub fn new(inner: G, capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).build();

        Self {
            inner: Arc::new(inner),
            cache,
        }
    }

    async fn cached<F>(&self, key: Lookup, lookup: F) -> Result<GeocodingResult, GeocodeError>
    where
        F: Future<Output = Result<GeocodingResult, GeocodeError>> + Send,
    {
        let source = key.source();
        if let Some(cached) = self.cache.get(&key).await {
            metrics::counter!(GEOCODE_CACHE_HITS, "source" => source).increment(1);
            return Ok(cached);
        }
        metrics::counter!(GEOCODE_CACHE_MISSES, "source" => source).increment(1);

        // Concurrent misses on the same key share one upstream call
        self.cache
            .try_get_with(key, lookup)
            .await
            .map_err(|e| (*e).clone())
    }
}

#[async_trait]
impl<G: Geocoder + 'static> Geocoder for CachedGeocoder<G> {
    async fn forward(&self, name: &str, state: &str) -> Result<GeocodingResult, GeocodeError> {
        let key = Lookup::Forward {
            name: name.to_string(),
            state: state.to_string(),
        };
        let inner = self.inner.clone();
        let (name, state) = (name.to_string(), state.to_string());
        self.cached(key, async move { inner.forward(&name, &state).await })
            .await
    }

    async fn reverse(&self, lat: f64, lon: f64) -> Result<GeocodingResult, GeocodeError> {
        let key = Lookup::Reverse(format!("{lon:.6},{lat:.6}"));
        let inner = self.inner.clone();
        self.cached(key, async move { inner.reverse(lat, lon).await })
            .await
    }
}
