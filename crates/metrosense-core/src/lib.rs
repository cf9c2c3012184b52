//! Core domain model for the mobility ingestion platform.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "metrosense-core";

/// Identifier assigned by an external source system, meaningful only within
/// that source's namespace.
///
/// Stored canonically as trimmed text so that a source sending `"123"` in one
/// payload and `123` in another resolves to the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self(raw.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExternalId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ExternalId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<i64> for ExternalId {
    fn from(raw: i64) -> Self {
        Self(raw.to_string())
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// GeoJSON-shaped geometry as delivered by source systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
    Polygon(Vec<Vec<[f64; 2]>>),
}

impl Geometry {
    /// Representative (longitude, latitude) for the shape.
    ///
    /// Polygons use the area centroid of the outer ring, line strings the
    /// length-weighted midpoint. Degenerate shapes (zero area, zero length)
    /// fall back to the vertex average; empty shapes yield `None`.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        match self {
            Geometry::Point([lon, lat]) => Some((*lon, *lat)),
            Geometry::LineString(points) => linestring_centroid(points),
            Geometry::Polygon(rings) => rings.first().and_then(|ring| polygon_centroid(ring)),
        }
    }
}

fn vertex_average(points: &[[f64; 2]]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    Some((sx / n, sy / n))
}

fn linestring_centroid(points: &[[f64; 2]]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return vertex_average(points);
    }
    let mut total_len = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let len = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt();
        total_len += len;
        cx += (a[0] + b[0]) / 2.0 * len;
        cy += (a[1] + b[1]) / 2.0 * len;
    }
    if total_len == 0.0 {
        return vertex_average(points);
    }
    Some((cx / total_len, cy / total_len))
}

fn polygon_centroid(ring: &[[f64; 2]]) -> Option<(f64, f64)> {
    if ring.len() < 3 {
        return vertex_average(ring);
    }
    // Shoelace centroid over the closed outer ring.
    let mut area2 = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        let cross = a[0] * b[1] - b[0] * a[1];
        area2 += cross;
        cx += (a[0] + b[0]) * cross;
        cy += (a[1] + b[1]) * cross;
    }
    if area2.abs() < f64::EPSILON {
        return vertex_average(ring);
    }
    Some((cx / (3.0 * area2), cy / (3.0 * area2)))
}

/// A measurement point observed in a source payload, before it is known
/// whether the store already tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedSensor {
    pub external_id: ExternalId,
    pub description: String,
    pub geometry: Option<Geometry>,
    pub confidential: bool,
}

/// A typed channel observed in a source payload, keyed to its owning sensor
/// by that sensor's external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDatastream {
    pub sensor_external_id: ExternalId,
    pub external_id: ExternalId,
    /// Free-text vendor category, resolved to (type, unit) via [`classify`].
    pub category: String,
    pub confidential: bool,
}

/// One time-stamped reading, still keyed by the datastream's external id and
/// carrying the raw source value before numeric coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub datastream_external_id: ExternalId,
    pub timestamp: DateTime<Utc>,
    pub value: JsonValue,
}

/// Entity metadata discovered during a source's structure crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEntities {
    pub sensors: Vec<ObservedSensor>,
    pub datastreams: Vec<ObservedDatastream>,
}

/// One reading after identity resolution, ready for the ingestor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObservation {
    pub datastream_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: JsonValue,
    pub confidential: bool,
}

/// Outcome counters of one ingestion batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub written: u64,
    pub skipped_non_numeric: u64,
    pub skipped_duplicate: u64,
}

impl IngestResult {
    pub fn merge(&mut self, other: IngestResult) {
        self.written += other.written;
        self.skipped_non_numeric += other.skipped_non_numeric;
        self.skipped_duplicate += other.skipped_duplicate;
    }
}

/// Coerce a raw source value to a finite measurement value.
///
/// Numbers pass through, numeric strings are parsed, booleans map to 1/0
/// (occupancy-style streams). Everything else, including NaN and infinities,
/// yields `None` and is dropped by the ingestor rather than stored.
pub fn coerce_numeric(raw: &JsonValue) -> Option<f64> {
    let value = match raw {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        JsonValue::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Parse a source timestamp into UTC.
///
/// Accepts RFC 3339 with any offset, naive `YYYY-MM-DDTHH:MM:SS` /
/// `YYYY-MM-DD HH:MM:SS` (assumed UTC, as the sources document), and FROST
/// phenomenon-time intervals (`start/end`), of which the start is taken.
pub fn parse_timestamp_utc(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let raw = raw.split('/').next().unwrap_or(raw);
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// A vendor category resolved to the internal datastream type and unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: String,
    /// Absent for mixed-unit categories (weather bundles several quantities).
    pub unit: Option<String>,
}

enum KindRule {
    /// Fixed internal type name.
    Literal(&'static str),
    /// The vendor label itself is the type (parking species and pollutants
    /// keep their source naming).
    SourceLabel,
}

struct CategoryEntry {
    labels: &'static [&'static str],
    kind: KindRule,
    unit: Option<&'static str>,
}

// Ordered priority tables, first match wins. The FROST order follows the
// Klasse fallback chain of the upstream Frost-Server deployment.
const FROST_CATEGORIES: &[CategoryEntry] = &[
    CategoryEntry {
        labels: &["E-Ladepunkt"],
        kind: KindRule::Literal("E-Ladepunkt"),
        unit: Some("Occupancy status"),
    },
    CategoryEntry {
        labels: &["Parkobjekt", "ParkingArea", "ParkingLocation"],
        kind: KindRule::SourceLabel,
        unit: Some("Vacant Spaces"),
    },
    CategoryEntry {
        labels: &["cC1", "cC2", "cC3", "vC1", "vC2", "vC3"],
        kind: KindRule::Literal("motor traffic measurement"),
        unit: Some("Vehicles Counted"),
    },
    CategoryEntry {
        labels: &["Bike"],
        kind: KindRule::Literal("bike traffic measurement"),
        unit: Some("Bikes counted"),
    },
    CategoryEntry {
        labels: &["Wetter"],
        kind: KindRule::Literal("Wetter"),
        unit: None,
    },
];

const SENSOR_COMMUNITY_CATEGORIES: &[CategoryEntry] = &[
    CategoryEntry {
        labels: &["P1"],
        kind: KindRule::Literal("PM10"),
        unit: Some("µg/m³"),
    },
    CategoryEntry {
        labels: &["P2"],
        kind: KindRule::Literal("PM2.5"),
        unit: Some("µg/m³"),
    },
    CategoryEntry {
        labels: &["pressure"],
        kind: KindRule::Literal("air pressure"),
        unit: Some("Pa"),
    },
    CategoryEntry {
        labels: &["temperature"],
        kind: KindRule::Literal("temperature"),
        unit: Some("°C"),
    },
    CategoryEntry {
        labels: &["humidity"],
        kind: KindRule::Literal("humidity"),
        unit: Some("%"),
    },
];

const LANUV_CATEGORIES: &[CategoryEntry] = &[CategoryEntry {
    labels: &["Ozon", "SO2", "NO2", "PM10"],
    kind: KindRule::SourceLabel,
    unit: Some("µg/m³"),
}];

/// Resolve a source's free-text category label to the internal datastream
/// type and unit.
///
/// Lookup is against a fixed, ordered table per source; the first matching
/// entry wins. `None` means the label is genuinely unmapped, which callers
/// treat as a skip-this-entity error, never as an "unknown" row.
pub fn classify(source: &str, label: &str) -> Option<Classified> {
    let table = match source {
        "FROST" => FROST_CATEGORIES,
        "LANUV" => LANUV_CATEGORIES,
        "Sensor.Community" => SENSOR_COMMUNITY_CATEGORIES,
        _ => return None,
    };
    table
        .iter()
        .find(|entry| entry.labels.contains(&label))
        .map(|entry| Classified {
            kind: match entry.kind {
                KindRule::Literal(kind) => kind.to_string(),
                KindRule::SourceLabel => label.to_string(),
            },
            unit: entry.unit.map(str::to_string),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn external_ids_normalize_numeric_and_text_forms() {
        assert_eq!(ExternalId::from(123), ExternalId::from("123"));
        assert_eq!(ExternalId::from(" 42 "), ExternalId::from("42"));
        assert_ne!(ExternalId::from("42"), ExternalId::from("042"));
    }

    #[test]
    fn coercion_accepts_numbers_strings_and_bools() {
        assert_eq!(coerce_numeric(&json!(12.5)), Some(12.5));
        assert_eq!(coerce_numeric(&json!("  99 ")), Some(99.0));
        assert_eq!(coerce_numeric(&json!(true)), Some(1.0));
        assert_eq!(coerce_numeric(&json!("charging")), None);
        assert_eq!(coerce_numeric(&json!("NaN")), None);
        assert_eq!(coerce_numeric(&json!(null)), None);
        assert_eq!(coerce_numeric(&json!({"v": 1})), None);
    }

    #[test]
    fn timestamps_parse_offsets_naive_and_intervals() {
        let utc = parse_timestamp_utc("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        let offset = parse_timestamp_utc("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(offset, utc);

        let naive = parse_timestamp_utc("2024-01-01 00:00:00").unwrap();
        assert_eq!(naive, utc);

        let interval =
            parse_timestamp_utc("2024-01-01T00:00:00Z/2024-01-01T00:15:00Z").unwrap();
        assert_eq!(interval, utc);

        assert!(parse_timestamp_utc("yesterdayish").is_none());
    }

    #[test]
    fn point_and_polygon_centroids() {
        let point = Geometry::Point([6.08, 50.77]);
        assert_eq!(point.centroid(), Some((6.08, 50.77)));

        let square = Geometry::Polygon(vec![vec![
            [0.0, 0.0],
            [2.0, 0.0],
            [2.0, 2.0],
            [0.0, 2.0],
        ]]);
        let (cx, cy) = square.centroid().unwrap();
        assert!((cx - 1.0).abs() < 1e-9 && (cy - 1.0).abs() < 1e-9);

        let empty = Geometry::Polygon(vec![]);
        assert_eq!(empty.centroid(), None);
    }

    #[test]
    fn linestring_centroid_is_length_weighted() {
        // Two segments of length 2 and 1; the long one dominates.
        let line = Geometry::LineString(vec![[0.0, 0.0], [2.0, 0.0], [2.0, 1.0]]);
        let (cx, cy) = line.centroid().unwrap();
        assert!((cx - (1.0 * 2.0 + 2.0) / 3.0).abs() < 1e-9);
        assert!((cy - 0.5 / 3.0).abs() < 1e-9);

        let degenerate = Geometry::LineString(vec![[1.0, 1.0], [1.0, 1.0]]);
        assert_eq!(degenerate.centroid(), Some((1.0, 1.0)));
    }

    #[test]
    fn classification_is_first_match_in_table_order() {
        let traffic = classify("FROST", "cC2").unwrap();
        assert_eq!(traffic.kind, "motor traffic measurement");
        assert_eq!(traffic.unit.as_deref(), Some("Vehicles Counted"));

        let parking = classify("FROST", "ParkingLocation").unwrap();
        assert_eq!(parking.kind, "ParkingLocation");
        assert_eq!(parking.unit.as_deref(), Some("Vacant Spaces"));

        let weather = classify("FROST", "Wetter").unwrap();
        assert_eq!(weather.kind, "Wetter");
        assert_eq!(weather.unit, None);

        let pm = classify("Sensor.Community", "P1").unwrap();
        assert_eq!(pm.kind, "PM10");

        let lanuv = classify("LANUV", "NO2").unwrap();
        assert_eq!(lanuv.kind, "NO2");
        assert_eq!(lanuv.unit.as_deref(), Some("µg/m³"));

        assert!(classify("FROST", "Selfie-Drone").is_none());
        assert!(classify("NOPE", "P1").is_none());
    }

    #[test]
    fn geojson_geometry_deserializes() {
        let geo: Geometry =
            serde_json::from_value(json!({"type": "Point", "coordinates": [6.1, 50.7]})).unwrap();
        assert_eq!(geo, Geometry::Point([6.1, 50.7]));
    }
}
