use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::ack::AckHandle;

/// A record as fetched from the source topic.
pub struct RawEvent {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Settles the record's source position. Absent for sources without commit semantics.
    pub ack: Option<AckHandle>,
}

impl RawEvent {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Vec::new(),
            value: value.into(),
            headers: HashMap::new(),
            topic: String::new(),
            partition: 0,
            offset: 0,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: AckHandle) -> Self {
        self.ack = Some(ack);
        self
    }
}

impl fmt::Debug for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEvent")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("value_len", &self.value.len())
            .field("has_ack", &self.ack.is_some())
            .finish()
    }
}

/// Storm event types. Anything but the exact lowercase names is `Unknown`,
/// which serializes as an empty string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EventType {
    Hail,
    Wind,
    Tornado,
    #[default]
    Unknown,
}

impl EventType {
    /// Case-sensitive and untrimmed.
    pub fn normalize(value: &str) -> Self {
        match value {
            "hail" => EventType::Hail,
            "wind" => EventType::Wind,
            "tornado" => EventType::Tornado,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Hail => "hail",
            EventType::Wind => "wind",
            EventType::Tornado => "tornado",
            EventType::Unknown => "",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        Ok(value.map_or(EventType::Unknown, |v| EventType::normalize(&v)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
    Extreme,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub lat: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lon: f64,
}

impl Geo {
    /// Sentinel for "no coordinates". Storm reports never originate at (0°, 0°),
    /// so a genuine reading at that exact point is indistinguishable from a missing one.
    pub const UNKNOWN: Geo = Geo { lat: 0.0, lon: 0.0 };

    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub raw: String,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "is_zero")]
    pub distance: f64,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub direction: String,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub county: String,
}

/// Provenance of an event's location data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentSource {
    Original,
    Forward,
    Reverse,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geocoding {
    pub source: EnrichmentSource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub formatted_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub place_name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub confidence: f64,
}

impl Geocoding {
    pub fn marked(source: EnrichmentSource) -> Self {
        Self {
            source,
            formatted_address: String::new(),
            place_name: String::new(),
            confidence: 0.0,
        }
    }
}

/// Normalized storm report. Fields after `comments` are derived during enrichment
/// and ignored when decoding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StormEvent {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(deserialize_with = "null_as_default")]
    pub geo: Geo,
    #[serde(deserialize_with = "null_as_default")]
    pub magnitude: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub unit: String,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub begin_time: Option<OffsetDateTime>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<OffsetDateTime>,
    #[serde(deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(deserialize_with = "null_as_default")]
    pub location: Location,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub comments: String,

    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_deserializing, skip_serializing_if = "String::is_empty")]
    pub source_office: String,
    #[serde(skip_deserializing, skip_serializing_if = "String::is_empty")]
    pub time_bucket: String,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub geocoding: Option<Geocoding>,
    #[serde(
        skip_deserializing,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<OffsetDateTime>,

    /// Undecoded source payload, kept for traceability.
    #[serde(skip)]
    pub raw_payload: Vec<u8>,
}

/// Serialized record destined for the sink topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputEvent {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Explicit `null` decodes like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}
