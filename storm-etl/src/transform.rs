use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::error::TransformError;
use crate::event::{EventType, OutputEvent, RawEvent, Severity, StormEvent};
use crate::geocode::{enrich_with_geocoding, Geocoder};
use crate::time::TimeSource;

/// Trailing parenthesized office code, e.g. `... (OUN)`.
static SOURCE_OFFICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Z]{3,5})\)\s*$").expect("invalid source office regex"));

/// `<distance> <compass> <place>`, e.g. `5.2 NW AUSTIN`.
static RELATIVE_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s+([NSEW]{1,3})\s+(.+)$").expect("invalid location regex")
});

const TIME_BUCKET_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:00:00Z");

/// RFC 3339 in UTC, whole seconds.
const HEADER_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Turns one source record into one sink record.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, raw: &RawEvent) -> Result<OutputEvent, TransformError>;
}

/// Parse, enrich then serialize storm reports.
pub struct StormTransformer {
    clock: Arc<dyn TimeSource>,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl StormTransformer {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            clock,
            geocoder: None,
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }
}

#[async_trait]
impl Transform for StormTransformer {
    async fn transform(&self, raw: &RawEvent) -> Result<OutputEvent, TransformError> {
        let event = parse_raw_event(raw)?;
        let event = enrich_storm_event(event, self.clock.now());
        let event = enrich_with_geocoding(event, self.geocoder.as_deref()).await;
        serialize_storm_event(&event)
    }
}

/// Decode a record's value, keeping the undecoded payload on the event.
pub fn parse_raw_event(raw: &RawEvent) -> Result<StormEvent, TransformError> {
    let mut event: StormEvent =
        serde_json::from_slice(&raw.value).map_err(TransformError::Parse)?;
    event.raw_payload = raw.value.clone();
    Ok(event)
}

/// Apply every deterministic enrichment step, in dependency order.
pub fn enrich_storm_event(mut event: StormEvent, now: OffsetDateTime) -> StormEvent {
    // The type is normalized while decoding, see `EventType::normalize`
    event.unit = normalize_unit(event.event_type, &event.unit);
    event.magnitude = normalize_magnitude(event.event_type, event.magnitude, &event.unit);
    event.severity = derive_severity(event.event_type, event.magnitude);
    event.source_office = extract_source_office(&event.comments);

    let (name, distance, direction) = parse_location(&event.location.raw);
    event.location.name = name;
    event.location.distance = distance;
    event.location.direction = direction;

    event.time_bucket = derive_time_bucket(event.begin_time);
    event.processed_at = Some(now);
    event
}

pub fn serialize_storm_event(event: &StormEvent) -> Result<OutputEvent, TransformError> {
    let value = serde_json::to_vec(event).map_err(TransformError::Serialize)?;

    let processed_at = match event.processed_at {
        Some(ts) => ts
            .to_offset(UtcOffset::UTC)
            .format(HEADER_TIMESTAMP_FORMAT)?,
        None => String::new(),
    };

    let headers = BTreeMap::from([
        ("type".to_string(), event.event_type.to_string()),
        ("processed_at".to_string(), processed_at),
    ]);

    Ok(OutputEvent {
        key: event.id.as_bytes().to_vec(),
        value,
        headers,
    })
}

/// An explicit unit wins, otherwise the type's customary unit.
pub fn normalize_unit(event_type: EventType, unit: &str) -> String {
    let unit = unit.trim().to_lowercase();
    if !unit.is_empty() {
        return unit;
    }

    match event_type {
        EventType::Hail => "in",
        EventType::Wind => "mph",
        EventType::Tornado => "f_scale",
        EventType::Unknown => "",
    }
    .to_string()
}

/// Hail sizes are sometimes reported in hundredths of an inch (`175` for 1.75in).
pub fn normalize_magnitude(event_type: EventType, magnitude: f64, unit: &str) -> f64 {
    if magnitude == 0.0 {
        return magnitude;
    }
    if event_type == EventType::Hail && unit == "in" && magnitude >= 10.0 {
        return magnitude / 100.0;
    }
    magnitude
}

pub fn derive_severity(event_type: EventType, magnitude: f64) -> Option<Severity> {
    if magnitude == 0.0 {
        return None;
    }

    let severity = match event_type {
        EventType::Hail => match magnitude {
            m if m < 0.75 => Severity::Minor,
            m if m < 1.5 => Severity::Moderate,
            m if m < 2.5 => Severity::Severe,
            _ => Severity::Extreme,
        },
        EventType::Wind => match magnitude {
            m if m < 50.0 => Severity::Minor,
            m if m < 74.0 => Severity::Moderate,
            m if m < 96.0 => Severity::Severe,
            _ => Severity::Extreme,
        },
        EventType::Tornado => match magnitude {
            m if m <= 1.0 => Severity::Minor,
            m if m == 2.0 => Severity::Moderate,
            m if m <= 4.0 => Severity::Severe,
            _ => Severity::Extreme,
        },
        EventType::Unknown => return None,
    };
    Some(severity)
}

pub fn extract_source_office(comments: &str) -> String {
    SOURCE_OFFICE
        .captures(comments.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Split `5.2 NW AUSTIN` into `("AUSTIN", 5.2, "NW")`. Unmatched input is kept
/// whole as the name.
pub fn parse_location(raw: &str) -> (String, f64, String) {
    let raw = raw.trim();

    let parsed = RELATIVE_LOCATION.captures(raw).and_then(|c| {
        let distance = c[1].parse::<f64>().ok()?;
        Some((c[3].trim().to_string(), distance, c[2].to_string()))
    });

    parsed.unwrap_or_else(|| (raw.to_string(), 0.0, String::new()))
}

/// Top of the hour in UTC, empty when unset.
pub fn derive_time_bucket(begin_time: Option<OffsetDateTime>) -> String {
    begin_time
        .and_then(|t| t.to_offset(UtcOffset::UTC).format(TIME_BUCKET_FORMAT).ok())
        .unwrap_or_default()
}
