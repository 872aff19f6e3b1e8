use async_trait::async_trait;
use tracing::warn;

use crate::error::GeocodeError;
use crate::event::{EnrichmentSource, Geo, Geocoding, StormEvent};

/// Best match returned by a geocoding service.
///
/// An empty formatted address with unknown coordinates is a "no match",
/// distinct from a `GeocodeError`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeocodingResult {
    pub formatted_address: String,
    pub place_name: String,
    pub confidence: f64,
    pub geo: Geo,
}

impl GeocodingResult {
    pub fn is_no_match(&self) -> bool {
        self.formatted_address.is_empty() && !self.geo.is_known()
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve a place name within a state to coordinates.
    async fn forward(&self, name: &str, state: &str) -> Result<GeocodingResult, GeocodeError>;

    /// Resolve coordinates to place details.
    async fn reverse(&self, lat: f64, lon: f64) -> Result<GeocodingResult, GeocodeError>;
}

/// Enrich an event's location from a geocoder, never failing: errors are
/// recorded as `EnrichmentSource::Failed` on the event.
///
/// Without a geocoder the event is returned unchanged.
pub async fn enrich_with_geocoding(
    mut event: StormEvent,
    geocoder: Option<&dyn Geocoder>,
) -> StormEvent {
    let Some(geocoder) = geocoder else {
        return event;
    };

    let has_coords = event.geo.is_known();
    let has_name = !event.location.name.is_empty() && !event.location.state.is_empty();

    if !has_coords && has_name {
        let result = geocoder
            .forward(&event.location.name, &event.location.state)
            .await;
        let geocoding = match result {
            Ok(result) if result.geo.is_known() => {
                event.geo = result.geo;
                adopt(result, EnrichmentSource::Forward)
            }
            Ok(_) => Geocoding::marked(EnrichmentSource::Original),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    location = %event.location.name,
                    state = %event.location.state,
                    error = %e,
                    "forward geocoding failed"
                );
                Geocoding::marked(EnrichmentSource::Failed)
            }
        };
        event.geocoding = Some(geocoding);
        return event;
    }

    if has_coords {
        let result = geocoder.reverse(event.geo.lat, event.geo.lon).await;
        let geocoding = match result {
            Ok(result) if !result.formatted_address.is_empty() => {
                adopt(result, EnrichmentSource::Reverse)
            }
            Ok(_) => Geocoding::marked(EnrichmentSource::Original),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    lat = event.geo.lat,
                    lon = event.geo.lon,
                    error = %e,
                    "reverse geocoding failed"
                );
                Geocoding::marked(EnrichmentSource::Failed)
            }
        };
        event.geocoding = Some(geocoding);
        return event;
    }

    event.geocoding = Some(Geocoding::marked(EnrichmentSource::Original));
    event
}

fn adopt(result: GeocodingResult, source: EnrichmentSource) -> Geocoding {
    Geocoding {
        source,
        formatted_address: result.formatted_address,
        place_name: result.place_name,
        confidence: result.confidence,
    }
}
