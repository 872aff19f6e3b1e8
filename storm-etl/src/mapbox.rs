use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::GeocodeError;
use crate::event::Geo;
use crate::geocode::{Geocoder, GeocodingResult};
use crate::metrics_consts::{GEOCODE_API_DURATION, GEOCODE_REQUESTS};

pub const MAPBOX_PLACES_URL: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places";

/// Geocoder backed by the Mapbox places API.
#[derive(Clone)]
pub struct MapboxClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl MapboxClient {
    pub fn new(token: String, timeout: Duration) -> Result<Self, GeocodeError> {
        let base_url = Url::parse(MAPBOX_PLACES_URL)
            .map_err(|e| GeocodeError::Request(e.to_string()))?;
        Self::with_base_url(token, timeout, base_url)
    }

    pub fn with_base_url(
        token: String,
        timeout: Duration,
        base_url: Url,
    ) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent("storm-etl")
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// `{base}/{query}.json`, the query being percent-encoded as a single path segment.
    fn endpoint(&self, query: &str, params: &[(&str, &str)]) -> Result<Url, GeocodeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GeocodeError::Request(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .push(&format!("{query}.json"));

        url.query_pairs_mut()
            .append_pair("access_token", &self.token)
            .append_pair("limit", "1")
            .extend_pairs(params);

        Ok(url)
    }

    async fn lookup(&self, url: Url, source: &'static str) -> Result<GeocodingResult, GeocodeError> {
        let result = self.request(url, source).await;
        let outcome = match &result {
            Ok(r) if r.is_no_match() => "empty",
            Ok(_) => "success",
            Err(_) => "error",
        };
        metrics::counter!(GEOCODE_REQUESTS, "source" => source, "outcome" => outcome).increment(1);
        result
    }

    async fn request(&self, url: Url, source: &'static str) -> Result<GeocodingResult, GeocodeError> {
        let start = Instant::now();
        let response = self.client.get(url).send().await;
        metrics::histogram!(GEOCODE_API_DURATION, "source" => source)
            .record(start.elapsed().as_secs_f64());

        let response = response.map_err(|e| GeocodeError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            debug!(source, status = status.as_u16(), "mapbox answered with an error");
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: PlacesResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::Decode(e.to_string()))?;

        Ok(body
            .features
            .into_iter()
            .next()
            .map(GeocodingResult::from)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Geocoder for MapboxClient {
    async fn forward(&self, name: &str, state: &str) -> Result<GeocodingResult, GeocodeError> {
        let query = if state.is_empty() {
            name.to_string()
        } else {
            format!("{name}, {state}")
        };
        // Populated places only, no roads or waterways
        let url = self.endpoint(&query, &[("types", "place,locality")])?;
        self.lookup(url, "forward").await
    }

    async fn reverse(&self, lat: f64, lon: f64) -> Result<GeocodingResult, GeocodeError> {
        // Mapbox expects lon,lat
        let url = self.endpoint(&format!("{lon:.6},{lat:.6}"), &[])?;
        self.lookup(url, "reverse").await
    }
}

#[derive(Deserialize)]
struct PlacesResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    /// `[lon, lat]`
    #[serde(default)]
    center: Vec<f64>,
    #[serde(default)]
    place_name: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    relevance: f64,
}

impl From<Feature> for GeocodingResult {
    fn from(feature: Feature) -> Self {
        let geo = match feature.center.as_slice() {
            [lon, lat] => Geo::new(*lat, *lon),
            _ => Geo::UNKNOWN,
        };
        GeocodingResult {
            formatted_address: feature.place_name,
            place_name: feature.text,
            confidence: feature.relevance,
            geo,
        }
    }
}
