//! Source adapter contracts + concrete crawler implementations.
//!
//! Each adapter normalizes one upstream system into the shared handoff
//! shapes: [`ObservedSensor`] / [`ObservedDatastream`] during structure
//! discovery, [`Observation`] during collection. Everything downstream of
//! these shapes is source-agnostic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use metrosense_core::{
    classify, coerce_numeric, parse_timestamp_utc, DiscoveredEntities, ExternalId, Geometry,
    Observation, ObservedDatastream, ObservedSensor,
};
use metrosense_store::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metrosense-adapters";

const FROST_SOURCE: &str = "FROST";
const LANUV_SOURCE: &str = "LANUV";
const SENSOR_COMMUNITY_SOURCE: &str = "Sensor.Community";

const LANUV_VALUES_URL: &str =
    "https://www.lanuv.nrw.de/fileadmin/lanuv/luft/immissionen/aktluftqual/eu_luftqualitaet.csv";
const LANUV_COMPONENTS: &[&str] = &["Ozon", "SO2", "NO2", "PM10"];

/// Datastream descriptions the FROST deployment uses for its weather
/// channels; they carry no Klasse property.
const WEATHER_DESCRIPTIONS: &[&str] = &[
    "SIGNIFICANTWEATHER",
    "WINDDIRECTION",
    "HUMIDITY",
    "TEMPERATURE",
    "DEWPOINT",
    "WINDSPEED",
    "PROBABILITYOFPRECIPITATION",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transport failure that survived the fetcher's retries; the next
    /// scheduled tick re-attempts the same window.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Response did not have the documented shape.
    #[error("malformed payload from {source}: {detail}")]
    Malformed { source: &'static str, detail: String },
}

impl AdapterError {
    fn malformed(source: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            source,
            detail: detail.into(),
        }
    }
}

/// Per-datastream fetch window starts for one collection run, computed from
/// the stored watermarks before any network call is made.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    default_start: DateTime<Utc>,
    starts: HashMap<ExternalId, DateTime<Utc>>,
}

impl WindowPlan {
    pub fn new(default_start: DateTime<Utc>) -> Self {
        Self {
            default_start,
            starts: HashMap::new(),
        }
    }

    pub fn set_start(&mut self, datastream: ExternalId, start: DateTime<Utc>) {
        self.starts.insert(datastream, start);
    }

    /// Window start for one datastream; unknown streams begin at the
    /// source's configured epoch.
    pub fn start_for(&self, datastream: &ExternalId) -> DateTime<Utc> {
        self.starts
            .get(datastream)
            .copied()
            .unwrap_or(self.default_start)
    }

    pub fn datastreams(&self) -> impl Iterator<Item = &ExternalId> {
        self.starts.keys()
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// One upstream system, normalized.
///
/// `discover` fetches entity metadata, `collect` fetches readings for the
/// planned windows. Snapshot-style feeds (LANUV, Sensor.Community) ignore
/// the plan and re-deliver their current state; the idempotent ingest path
/// absorbs the overlap.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &'static str;

    async fn discover(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<DiscoveredEntities, AdapterError>;

    async fn collect(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        windows: &WindowPlan,
    ) -> Result<Vec<Observation>, AdapterError>;
}

/// Source-specific adapter configuration, deserialized from the registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Frost {
        base_url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Lanuv {
        #[serde(default = "default_lanuv_values_url")]
        values_url: String,
        stations: Vec<String>,
    },
    SensorCommunity {
        data_url: String,
    },
}

fn default_lanuv_values_url() -> String {
    LANUV_VALUES_URL.to_string()
}

pub fn build_adapter(spec: &SourceSpec) -> Box<dyn SourceAdapter> {
    match spec {
        SourceSpec::Frost {
            base_url,
            username,
            password,
        } => {
            let credentials = match (username, password) {
                (Some(user), Some(password)) => Some((user.clone(), password.clone())),
                _ => None,
            };
            Box::new(FrostAdapter::new(base_url.clone(), credentials))
        }
        SourceSpec::Lanuv {
            values_url,
            stations,
        } => Box::new(LanuvAdapter::new(values_url.clone(), stations.clone())),
        SourceSpec::SensorCommunity { data_url } => {
            Box::new(SensorCommunityAdapter::new(data_url.clone()))
        }
    }
}

/// OGC SensorThings deployment (FROST-Server): paged entity crawl with
/// expanded Things, per-datastream observation windows.
pub struct FrostAdapter {
    base_url: String,
    credentials: Option<(String, String)>,
}

impl FrostAdapter {
    pub fn new(base_url: String, credentials: Option<(String, String)>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn auth(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(user, password)| (user.as_str(), password.as_str()))
    }

    async fn get_json(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        url: &str,
    ) -> Result<JsonValue, AdapterError> {
        let resp = http.fetch_bytes(run_id, FROST_SOURCE, url, self.auth()).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|err| AdapterError::malformed(FROST_SOURCE, format!("{url}: {err}")))
    }
}

fn iot_id(value: &JsonValue) -> Option<ExternalId> {
    match value {
        JsonValue::Number(n) => n.as_i64().map(ExternalId::from),
        JsonValue::String(s) if !s.trim().is_empty() => Some(ExternalId::new(s.as_str())),
        _ => None,
    }
}

/// Klasse fallback chain: explicit Klasse property, then the generic type
/// property, then the weather descriptions.
fn frost_category(datastream: &JsonValue) -> Option<String> {
    let props = datastream.get("properties");
    if let Some(klasse) = props
        .and_then(|p| p.get("Klasse"))
        .and_then(JsonValue::as_str)
    {
        return Some(klasse.to_string());
    }
    if let Some(kind) = props.and_then(|p| p.get("type")).and_then(JsonValue::as_str) {
        return Some(kind.to_string());
    }
    let description = datastream.get("description").and_then(JsonValue::as_str)?;
    WEATHER_DESCRIPTIONS
        .contains(&description)
        .then(|| "Wetter".to_string())
}

fn frost_geometry(datastream: &JsonValue) -> Option<Geometry> {
    if let Some(area) = datastream.get("observedArea") {
        if let Ok(geometry) = serde_json::from_value::<Geometry>(area.clone()) {
            return Some(geometry);
        }
    }
    // Charge points publish their location outside observedArea.
    let coordinates = datastream.get("chargePointLocation")?.get("coordinates")?;
    let lon = coordinates.get("lon")?.as_f64()?;
    let lat = coordinates.get("lat")?.as_f64()?;
    Some(Geometry::Point([lon, lat]))
}

/// Sensor metadata from an expanded Thing; description and confidentiality
/// depend on the thing species.
fn frost_sensor_from_thing(thing: &JsonValue) -> Option<ObservedSensor> {
    let external_id = thing.get("@iot.id").and_then(iot_id)?;
    let props = thing.get("properties");
    let species = props
        .and_then(|p| p.get("species"))
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    let name = thing.get("name").and_then(JsonValue::as_str).unwrap_or("");
    let thing_description = thing
        .get("description")
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    let label = props
        .and_then(|p| p.get("props"))
        .and_then(|p| p.get("label"))
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    let is_parking_location = props
        .and_then(|p| p.get("type"))
        .and_then(JsonValue::as_str)
        == Some("ParkingLocation");

    let (description, confidential) = match species {
        "Ladestation" => (thing_description, true),
        "Zaehlstelle" => (label, false),
        "Parkhaus" => (name, true),
        "Parkplatz" | "Parkfläche" => (name, false),
        _ if is_parking_location => (name, false),
        other => {
            info!(species = other, "unknown thing species");
            ("", true)
        }
    };

    Some(ObservedSensor {
        external_id,
        description: description.to_string(),
        geometry: None,
        confidential,
    })
}

/// Parse one Datastreams page into the discovery accumulator; returns the
/// follow-up link when the server has more pages.
fn parse_frost_datastream_page(
    page: &JsonValue,
    out: &mut DiscoveredEntities,
) -> Result<Option<String>, AdapterError> {
    let values = page
        .get("value")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::malformed(FROST_SOURCE, "datastream page without value array"))?;

    for datastream in values {
        let Some(ds_id) = datastream.get("@iot.id").and_then(iot_id) else {
            warn!("datastream row without @iot.id, dropped");
            continue;
        };
        let Some(thing) = datastream.get("Thing") else {
            warn!(datastream = %ds_id, "datastream row without expanded Thing, dropped");
            continue;
        };
        let Some(mut sensor) = frost_sensor_from_thing(thing) else {
            warn!(datastream = %ds_id, "expanded Thing without @iot.id, dropped");
            continue;
        };
        sensor.geometry = frost_geometry(datastream);

        out.datastreams.push(ObservedDatastream {
            sensor_external_id: sensor.external_id.clone(),
            external_id: ds_id,
            category: frost_category(datastream).unwrap_or_default(),
            confidential: sensor.confidential,
        });
        out.sensors.push(sensor);
    }

    Ok(page
        .get("@iot.nextLink")
        .and_then(JsonValue::as_str)
        .map(String::from))
}

fn map_charging_value(value: JsonValue) -> JsonValue {
    match value.as_str() {
        Some("charging") => json!(1),
        Some("available") => json!(0),
        Some("outoforder") => json!(-1),
        _ => value,
    }
}

fn parse_frost_observation_page(
    datastream: &ExternalId,
    page: &JsonValue,
    out: &mut Vec<Observation>,
) -> Result<Option<String>, AdapterError> {
    let values = page
        .get("value")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::malformed(FROST_SOURCE, "observation page without value array")
        })?;

    for observation in values {
        let raw_time = observation
            .get("phenomenonTime")
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        let Some(timestamp) = parse_timestamp_utc(raw_time) else {
            warn!(datastream = %datastream, raw_time, "unparseable phenomenonTime, dropped");
            continue;
        };
        let value = observation.get("result").cloned().unwrap_or(JsonValue::Null);
        out.push(Observation {
            datastream_external_id: datastream.clone(),
            timestamp,
            value: map_charging_value(value),
        });
    }

    Ok(page
        .get("@iot.nextLink")
        .and_then(JsonValue::as_str)
        .map(String::from))
}

#[async_trait]
impl SourceAdapter for FrostAdapter {
    fn source(&self) -> &'static str {
        FROST_SOURCE
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<DiscoveredEntities, AdapterError> {
        let mut entities = DiscoveredEntities::default();
        let mut next = Some(format!(
            "{}/Datastreams?$top=1000&$orderby=@iot.id asc\
             &$select=@iot.id,description,properties,observedArea\
             &$expand=Thing($select=@iot.id,name,description,properties)",
            self.base_url
        ));

        while let Some(url) = next {
            let page = self.get_json(http, run_id, &url).await?;
            next = parse_frost_datastream_page(&page, &mut entities)?;
        }

        // A Thing owns several datastreams; keep one sensor row per thing.
        let mut seen = HashSet::new();
        entities
            .sensors
            .retain(|sensor| seen.insert(sensor.external_id.clone()));

        info!(
            sensors = entities.sensors.len(),
            datastreams = entities.datastreams.len(),
            "crawled FROST structure"
        );
        Ok(entities)
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        windows: &WindowPlan,
    ) -> Result<Vec<Observation>, AdapterError> {
        let mut observations = Vec::new();

        for datastream in windows.datastreams() {
            let since = windows
                .start_for(datastream)
                .to_rfc3339_opts(SecondsFormat::Secs, true);
            let mut next = Some(format!(
                "{}/Datastreams({})/Observations?$top=1000&$orderby=phenomenonTime asc\
                 &$select=@iot.id,phenomenonTime,result&$filter=resultTime gt {}",
                self.base_url,
                datastream.as_str(),
                since
            ));
            while let Some(url) = next {
                let page = self.get_json(http, run_id, &url).await?;
                next = parse_frost_observation_page(datastream, &page, &mut observations)?;
            }
        }

        info!(
            datastreams = windows.len(),
            observations = observations.len(),
            "crawled FROST observations"
        );
        Ok(observations)
    }
}

/// LANUV air quality CSV feed, one snapshot row per station.
pub struct LanuvAdapter {
    values_url: String,
    stations: Vec<String>,
}

impl LanuvAdapter {
    pub fn new(values_url: String, stations: Vec<String>) -> Self {
        Self {
            values_url,
            stations,
        }
    }

    async fn fetch_and_parse(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<(DiscoveredEntities, Vec<Observation>), AdapterError> {
        let resp = http
            .fetch_bytes(run_id, LANUV_SOURCE, &self.values_url, None)
            .await?;
        let body = String::from_utf8_lossy(&resp.body);
        parse_lanuv_csv(&body, &self.stations, Utc::now())
    }
}

fn floor_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// The feed is a `;`-separated table, two preamble lines, one row per
/// station: name, code, then one column per component. Values below the
/// detection limit arrive as `<n` and are clamped to the bound; `-` and `*`
/// mark missing values and are dropped here rather than stored as sentinels.
fn parse_lanuv_csv(
    body: &str,
    stations: &[String],
    now: DateTime<Utc>,
) -> Result<(DiscoveredEntities, Vec<Observation>), AdapterError> {
    if body.lines().count() < 3 {
        return Err(AdapterError::malformed(
            LANUV_SOURCE,
            "csv shorter than its preamble",
        ));
    }

    let timestamp = floor_to_hour(now);
    let mut entities = DiscoveredEntities::default();
    let mut observations = Vec::new();

    for line in body.lines().skip(2) {
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 2 + LANUV_COMPONENTS.len() {
            continue;
        }
        let description = fields[0].trim();
        let code = fields[1].trim();
        if !stations.iter().any(|station| station.as_str() == code) {
            continue;
        }

        let sensor_ex = ExternalId::new(code);
        entities.sensors.push(ObservedSensor {
            external_id: sensor_ex.clone(),
            description: description.to_string(),
            geometry: None,
            confidential: false,
        });

        for (idx, component) in LANUV_COMPONENTS.iter().enumerate() {
            let ds_ex = ExternalId::new(format!("{code}-{component}"));
            entities.datastreams.push(ObservedDatastream {
                sensor_external_id: sensor_ex.clone(),
                external_id: ds_ex.clone(),
                category: component.to_string(),
                confidential: false,
            });

            let raw = fields[idx + 2].trim();
            let cleaned = raw.trim_start_matches('<').trim();
            if cleaned.is_empty() || cleaned == "-" || cleaned == "*" {
                continue;
            }
            observations.push(Observation {
                datastream_external_id: ds_ex,
                timestamp,
                value: JsonValue::String(cleaned.to_string()),
            });
        }
    }

    Ok((entities, observations))
}

#[async_trait]
impl SourceAdapter for LanuvAdapter {
    fn source(&self) -> &'static str {
        LANUV_SOURCE
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<DiscoveredEntities, AdapterError> {
        Ok(self.fetch_and_parse(http, run_id).await?.0)
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        _windows: &WindowPlan,
    ) -> Result<Vec<Observation>, AdapterError> {
        Ok(self.fetch_and_parse(http, run_id).await?.1)
    }
}

/// Sensor.Community particulate/weather API, current readings per area.
pub struct SensorCommunityAdapter {
    data_url: String,
}

impl SensorCommunityAdapter {
    pub fn new(data_url: String) -> Self {
        Self { data_url }
    }

    async fn fetch_and_parse(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<(DiscoveredEntities, Vec<Observation>), AdapterError> {
        let resp = http
            .fetch_bytes(run_id, SENSOR_COMMUNITY_SOURCE, &self.data_url, None)
            .await?;
        parse_community_records(&resp.body)
    }
}

#[derive(Debug, Deserialize)]
struct CommunityRecord {
    timestamp: String,
    sensor: CommunitySensor,
    #[serde(default)]
    location: CommunityLocation,
    #[serde(default)]
    sensordatavalues: Vec<CommunityValue>,
}

#[derive(Debug, Deserialize)]
struct CommunitySensor {
    id: i64,
    #[serde(default)]
    sensor_type: Option<CommunitySensorType>,
}

#[derive(Debug, Deserialize)]
struct CommunitySensorType {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommunityLocation {
    // Delivered as strings by the API, occasionally as numbers.
    #[serde(default)]
    longitude: JsonValue,
    #[serde(default)]
    latitude: JsonValue,
}

#[derive(Debug, Deserialize)]
struct CommunityValue {
    value_type: String,
    #[serde(default)]
    value: JsonValue,
}

fn parse_community_records(
    body: &[u8],
) -> Result<(DiscoveredEntities, Vec<Observation>), AdapterError> {
    let records: Vec<CommunityRecord> = serde_json::from_slice(body)
        .map_err(|err| AdapterError::malformed(SENSOR_COMMUNITY_SOURCE, err.to_string()))?;

    let mut entities = DiscoveredEntities::default();
    let mut observations = Vec::new();
    let mut seen_sensors = HashSet::new();
    let mut seen_datastreams = HashSet::new();

    for record in records {
        let Some(timestamp) = parse_timestamp_utc(&record.timestamp) else {
            warn!(raw_time = %record.timestamp, "unparseable record timestamp, dropped");
            continue;
        };
        let sensor_ex = ExternalId::from(record.sensor.id);

        if seen_sensors.insert(sensor_ex.clone()) {
            let geometry = match (
                coerce_numeric(&record.location.longitude),
                coerce_numeric(&record.location.latitude),
            ) {
                (Some(lon), Some(lat)) => Some(Geometry::Point([lon, lat])),
                _ => None,
            };
            let description = record
                .sensor
                .sensor_type
                .as_ref()
                .and_then(|t| t.name.clone())
                .unwrap_or_default();
            entities.sensors.push(ObservedSensor {
                external_id: sensor_ex.clone(),
                description,
                geometry,
                confidential: false,
            });
        }

        for value in record.sensordatavalues {
            // Ancillary channels (sample counts, min/max deltas) are not
            // tracked as datastreams.
            if classify(SENSOR_COMMUNITY_SOURCE, &value.value_type).is_none() {
                continue;
            }
            let ds_ex = ExternalId::new(format!("{}-{}", sensor_ex, value.value_type));
            if seen_datastreams.insert(ds_ex.clone()) {
                entities.datastreams.push(ObservedDatastream {
                    sensor_external_id: sensor_ex.clone(),
                    external_id: ds_ex.clone(),
                    category: value.value_type.clone(),
                    confidential: false,
                });
            }
            observations.push(Observation {
                datastream_external_id: ds_ex,
                timestamp,
                value: value.value,
            });
        }
    }

    Ok((entities, observations))
}

#[async_trait]
impl SourceAdapter for SensorCommunityAdapter {
    fn source(&self) -> &'static str {
        SENSOR_COMMUNITY_SOURCE
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<DiscoveredEntities, AdapterError> {
        Ok(self.fetch_and_parse(http, run_id).await?.0)
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        _windows: &WindowPlan,
    ) -> Result<Vec<Observation>, AdapterError> {
        Ok(self.fetch_and_parse(http, run_id).await?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_plan_falls_back_to_default_start() {
        let epoch = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut plan = WindowPlan::new(epoch);
        plan.set_start(ExternalId::from(7), later);

        assert_eq!(plan.start_for(&ExternalId::from(7)), later);
        assert_eq!(plan.start_for(&ExternalId::from(8)), epoch);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn frost_datastream_page_yields_sensor_and_datastream() {
        let page = json!({
            "value": [{
                "@iot.id": 42,
                "description": "Belegung Ladepunkt",
                "properties": {"Klasse": "E-Ladepunkt"},
                "chargePointLocation": {"coordinates": {"lon": 6.08, "lat": 50.77}},
                "Thing": {
                    "@iot.id": 9,
                    "name": "LP-9",
                    "description": "Ladepunkt Elisenbrunnen",
                    "properties": {"species": "Ladestation"}
                }
            }],
            "@iot.nextLink": "https://example.org/FROST/Datastreams?$skip=1000"
        });

        let mut entities = DiscoveredEntities::default();
        let next = parse_frost_datastream_page(&page, &mut entities).unwrap();
        assert_eq!(next.as_deref(), Some("https://example.org/FROST/Datastreams?$skip=1000"));

        assert_eq!(entities.sensors.len(), 1);
        let sensor = &entities.sensors[0];
        assert_eq!(sensor.external_id, ExternalId::from(9));
        assert_eq!(sensor.description, "Ladepunkt Elisenbrunnen");
        assert!(sensor.confidential);
        assert_eq!(sensor.geometry, Some(Geometry::Point([6.08, 50.77])));

        assert_eq!(entities.datastreams.len(), 1);
        let datastream = &entities.datastreams[0];
        assert_eq!(datastream.external_id, ExternalId::from(42));
        assert_eq!(datastream.sensor_external_id, ExternalId::from(9));
        assert_eq!(datastream.category, "E-Ladepunkt");
    }

    #[test]
    fn frost_rows_without_expanded_thing_are_dropped_not_fatal() {
        let page = json!({
            "value": [
                {"@iot.id": 1, "description": "orphan"},
                {
                    "@iot.id": 2,
                    "description": "TEMPERATURE",
                    "properties": {},
                    "observedArea": {"type": "Point", "coordinates": [6.1, 50.8]},
                    "Thing": {"@iot.id": 3, "name": "WS-3", "properties": {}}
                }
            ]
        });

        let mut entities = DiscoveredEntities::default();
        let next = parse_frost_datastream_page(&page, &mut entities).unwrap();
        assert!(next.is_none());
        assert_eq!(entities.datastreams.len(), 1);
        assert_eq!(entities.datastreams[0].category, "Wetter");
    }

    #[test]
    fn frost_observations_map_charging_states_and_intervals() {
        let ds = ExternalId::from(42);
        let page = json!({
            "value": [
                {"phenomenonTime": "2024-01-01T00:00:00Z/2024-01-01T00:15:00Z", "result": "charging"},
                {"phenomenonTime": "2024-01-01T01:00:00Z", "result": 17.5},
                {"phenomenonTime": "not a time", "result": 1}
            ]
        });

        let mut observations = Vec::new();
        let next = parse_frost_observation_page(&ds, &page, &mut observations).unwrap();
        assert!(next.is_none());
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].value, json!(1));
        assert_eq!(
            observations[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(observations[1].value, json!(17.5));
    }

    #[test]
    fn frost_page_without_value_array_is_malformed() {
        let mut entities = DiscoveredEntities::default();
        let err = parse_frost_datastream_page(&json!({"oops": true}), &mut entities).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { source: "FROST", .. }));
    }

    #[test]
    fn lanuv_csv_filters_stations_and_cleans_values() {
        let body = "\
Aktuelle Luftqualität;;;;;;
Station;Kürzel;Ozon;SO2;NO2;PM10;
Aachen-Burtscheid;AABU;45;<2;21;18;
Köln-Rodenkirchen;KROD;50;3;30;25;
Aachen Wilhelmstraße;VACW;-;2;*;12;
";
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 42, 31).unwrap();
        let stations = vec!["AABU".to_string(), "VACW".to_string()];
        let (entities, observations) = parse_lanuv_csv(body, &stations, now).unwrap();

        assert_eq!(entities.sensors.len(), 2);
        assert_eq!(entities.sensors[0].external_id, ExternalId::from("AABU"));
        assert_eq!(entities.sensors[0].description, "Aachen-Burtscheid");
        assert_eq!(entities.datastreams.len(), 8);

        // AABU has all four values (the "<2" clamps to 2), VACW loses two
        // to missing-value markers.
        assert_eq!(observations.len(), 6);
        let so2 = observations
            .iter()
            .find(|o| o.datastream_external_id == ExternalId::from("AABU-SO2"))
            .unwrap();
        assert_eq!(so2.value, JsonValue::String("2".to_string()));
        assert_eq!(
            so2.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
        );
        assert!(!observations
            .iter()
            .any(|o| o.datastream_external_id == ExternalId::from("VACW-Ozon")));
    }

    #[test]
    fn lanuv_truncated_body_is_malformed() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let err = parse_lanuv_csv("half a header", &["AABU".to_string()], now).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { source: "LANUV", .. }));
    }

    #[test]
    fn community_records_map_known_value_types_only() {
        let body = json!([
            {
                "timestamp": "2024-05-01 13:05:07",
                "sensor": {"id": 31411, "sensor_type": {"name": "SDS011"}},
                "location": {"longitude": "6.095", "latitude": "50.776"},
                "sensordatavalues": [
                    {"value_type": "P1", "value": "12.3"},
                    {"value_type": "P2", "value": "5.4"},
                    {"value_type": "min_micro", "value": "712"}
                ]
            },
            {
                "timestamp": "2024-05-01 13:07:02",
                "sensor": {"id": 31411, "sensor_type": {"name": "SDS011"}},
                "location": {"longitude": "6.095", "latitude": "50.776"},
                "sensordatavalues": [{"value_type": "P1", "value": "11.9"}]
            }
        ]);
        let (entities, observations) =
            parse_community_records(body.to_string().as_bytes()).unwrap();

        assert_eq!(entities.sensors.len(), 1);
        assert_eq!(entities.sensors[0].geometry, Some(Geometry::Point([6.095, 50.776])));
        assert_eq!(entities.datastreams.len(), 2);
        assert!(entities
            .datastreams
            .iter()
            .all(|d| d.sensor_external_id == ExternalId::from(31411)));

        // min_micro is dropped, P1 appears twice (two records).
        assert_eq!(observations.len(), 3);
        assert_eq!(
            observations[0].datastream_external_id,
            ExternalId::from("31411-P1")
        );
    }

    #[test]
    fn community_non_array_body_is_malformed() {
        let err = parse_community_records(b"{\"not\": \"an array\"}").unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Malformed { source: "Sensor.Community", .. }
        ));
    }

    #[test]
    fn adapter_registry_builds_each_kind() {
        let lanuv: SourceSpec =
            serde_json::from_value(json!({"kind": "lanuv", "stations": ["AABU"]})).unwrap();
        assert_eq!(build_adapter(&lanuv).source(), "LANUV");

        let frost: SourceSpec = serde_json::from_value(
            json!({"kind": "frost", "base_url": "https://example.org/FROST/api/v1.1"}),
        )
        .unwrap();
        assert_eq!(build_adapter(&frost).source(), "FROST");

        let community: SourceSpec = serde_json::from_value(
            json!({"kind": "sensor_community", "data_url": "https://data.example.org/v1"}),
        )
        .unwrap();
        assert_eq!(build_adapter(&community).source(), "Sensor.Community");
    }
}
