//! Reconciliation + ingestion engine and the per-source pipeline scheduler.
//!
//! One generic engine replaces the per-source crawler loops: adapters hand
//! over normalized entities and observations, the reconciler maps external
//! ids onto store ids (creating missing rows exactly once), and the ingestor
//! appends measurements idempotently. The scheduler drives one pipeline per
//! source on its own cadence and keeps failures contained to the tick they
//! happened in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrosense_adapters::{
    build_adapter, AdapterError, SourceAdapter, SourceSpec, WindowPlan,
};
use metrosense_core::{
    classify, coerce_numeric, DiscoveredEntities, ExternalId, Geometry, IngestResult, Observation,
    ObservedDatastream, ObservedSensor, ResolvedObservation,
};
use metrosense_store::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MeasurementRow, MobilityStore, NewDatastream,
    NewSensor, StoreError,
};
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metrosense-ingest";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps externally observed entities onto store ids, creating what is
/// missing exactly once.
///
/// Identity lookups run once per batch and feed a per-run cache (the
/// returned map); nothing is cached across runs, so a concurrent creator is
/// picked up by the next run's resolve.
pub struct Reconciler<'a, S: MobilityStore> {
    store: &'a S,
    source: &'a str,
}

impl<'a, S: MobilityStore> Reconciler<'a, S> {
    pub fn new(store: &'a S, source: &'a str) -> Self {
        Self { store, source }
    }

    /// Ensure a sensor row exists per observed external id; returns the
    /// complete external-to-internal mapping for the batch.
    pub async fn reconcile_sensors(
        &self,
        observed: &[ObservedSensor],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        let unique = dedupe_by_key(observed, |sensor| &sensor.external_id);
        let ids: Vec<ExternalId> = unique.iter().map(|s| s.external_id.clone()).collect();

        let mut mapping = self.store.resolve_sensors(self.source, &ids).await?;

        let new_rows: Vec<NewSensor> = unique
            .iter()
            .filter(|sensor| !mapping.contains_key(&sensor.external_id))
            .map(|sensor| {
                let (longitude, latitude) = match sensor.geometry.as_ref().map(Geometry::centroid)
                {
                    Some(Some((lon, lat))) => (Some(lon), Some(lat)),
                    Some(None) => {
                        warn!(
                            source = self.source,
                            sensor = %sensor.external_id,
                            "no derivable centroid, sensor created without coordinates"
                        );
                        (None, None)
                    }
                    None => (None, None),
                };
                NewSensor {
                    external_id: sensor.external_id.clone(),
                    description: sensor.description.clone(),
                    longitude,
                    latitude,
                    confidential: sensor.confidential,
                }
            })
            .collect();

        if new_rows.is_empty() {
            return Ok(mapping);
        }

        let created = self.store.insert_sensors(self.source, &new_rows).await?;
        let raced: Vec<ExternalId> = new_rows
            .iter()
            .filter(|row| !created.contains_key(&row.external_id))
            .map(|row| row.external_id.clone())
            .collect();
        mapping.extend(created);

        if !raced.is_empty() {
            // A concurrent run created these between resolve and insert;
            // their ids are authoritative, not an error.
            info!(
                source = self.source,
                count = raced.len(),
                "sensors created concurrently elsewhere, re-resolving"
            );
            mapping.extend(self.store.resolve_sensors(self.source, &raced).await?);
        }
        Ok(mapping)
    }

    /// Same contract for datastreams; `sensors` is the mapping produced by
    /// [`Self::reconcile_sensors`] for the owning entities.
    pub async fn reconcile_datastreams(
        &self,
        sensors: &HashMap<ExternalId, i64>,
        observed: &[ObservedDatastream],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        let unique = dedupe_by_key(observed, |ds| &ds.external_id);
        let ids: Vec<ExternalId> = unique.iter().map(|ds| ds.external_id.clone()).collect();

        let mut mapping = self.store.resolve_datastreams(self.source, &ids).await?;

        let mut new_rows = Vec::new();
        for datastream in &unique {
            if mapping.contains_key(&datastream.external_id) {
                continue;
            }
            let Some(&sensor_id) = sensors.get(&datastream.sensor_external_id) else {
                error!(
                    source = self.source,
                    datastream = %datastream.external_id,
                    sensor = %datastream.sensor_external_id,
                    "owning sensor unresolved, datastream skipped"
                );
                continue;
            };
            let Some(classified) = classify(self.source, &datastream.category) else {
                error!(
                    source = self.source,
                    datastream = %datastream.external_id,
                    category = %datastream.category,
                    "no type/unit mapping for category, datastream skipped"
                );
                continue;
            };
            new_rows.push(NewDatastream {
                sensor_id,
                external_id: datastream.external_id.clone(),
                kind: classified.kind,
                unit: classified.unit,
                confidential: datastream.confidential,
            });
        }

        if new_rows.is_empty() {
            return Ok(mapping);
        }

        let created = self.store.insert_datastreams(&new_rows).await?;
        let raced: Vec<ExternalId> = new_rows
            .iter()
            .filter(|row| !created.contains_key(&row.external_id))
            .map(|row| row.external_id.clone())
            .collect();
        mapping.extend(created);

        if !raced.is_empty() {
            info!(
                source = self.source,
                count = raced.len(),
                "datastreams created concurrently elsewhere, re-resolving"
            );
            mapping.extend(self.store.resolve_datastreams(self.source, &raced).await?);
        }
        Ok(mapping)
    }
}

/// First occurrence wins; sources occasionally repeat an external id within
/// one payload and the repeats carry no extra information.
fn dedupe_by_key<'t, T, F>(items: &'t [T], key: F) -> Vec<&'t T>
where
    F: Fn(&T) -> &ExternalId,
{
    let mut seen = HashSet::new();
    items.iter().filter(|item| seen.insert(key(item))).collect()
}

/// Appends resolved observations with batch-internal and cross-batch
/// deduplication on the (datastream, timestamp) natural key.
pub struct Ingestor<'a, S: MobilityStore> {
    store: &'a S,
}

impl<'a, S: MobilityStore> Ingestor<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn ingest(
        &self,
        observations: Vec<ResolvedObservation>,
    ) -> Result<IngestResult, StoreError> {
        let mut result = IngestResult::default();

        // Coerce values first, then collapse batch-internal duplicates;
        // later occurrences overwrite earlier ones.
        let mut rows: BTreeMap<(i64, DateTime<Utc>), MeasurementRow> = BTreeMap::new();
        let mut coerced = 0u64;
        for observation in observations {
            let Some(value) = coerce_numeric(&observation.value) else {
                result.skipped_non_numeric += 1;
                debug!(
                    datastream = observation.datastream_id,
                    "non-numeric observation value dropped"
                );
                continue;
            };
            coerced += 1;
            rows.insert(
                (observation.datastream_id, observation.timestamp),
                MeasurementRow {
                    datastream_id: observation.datastream_id,
                    timestamp: observation.timestamp,
                    value,
                    confidential: observation.confidential,
                },
            );
        }

        let rows: Vec<MeasurementRow> = rows.into_values().collect();
        let attempted = rows.len() as u64;
        result.skipped_duplicate += coerced - attempted;

        result.written = self.store.insert_measurements(&rows).await?;
        // Rows the conflict target swallowed were already stored by an
        // earlier, overlapping window.
        result.skipped_duplicate += attempted - result.written;
        Ok(result)
    }
}

/// Compute per-datastream window starts from the stored watermarks, one
/// bulk query for the whole mapping.
pub async fn plan_windows<S: MobilityStore>(
    store: &S,
    datastreams: &HashMap<ExternalId, i64>,
    default_start: DateTime<Utc>,
) -> Result<WindowPlan, StoreError> {
    let internal_ids: Vec<i64> = datastreams.values().copied().collect();
    let latest = store.latest_timestamps(&internal_ids).await?;

    let mut plan = WindowPlan::new(default_start);
    for (external_id, internal_id) in datastreams {
        let start = latest.get(internal_id).copied().unwrap_or(default_start);
        plan.set_start(external_id.clone(), start);
    }
    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    Reconciling,
    Ingesting,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Fetching => "fetching",
            Stage::Reconciling => "reconciling",
            Stage::Ingesting => "ingesting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub interval: Duration,
    /// Window start for datastreams with no stored measurement yet.
    pub default_start: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sensors_mapped: usize,
    pub datastreams_mapped: usize,
    pub result: IngestResult,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Completed(RunSummary),
    /// The previous run of this pipeline was still in flight.
    SkippedOverlap,
    Failed,
}

/// One source's fetch → reconcile → ingest loop.
///
/// Store work happens in discrete batch calls between the network phases;
/// no connection or transaction is held across a fetch. A failed stage
/// drops back to idle with the watermarks untouched, so the next tick
/// re-requests the same window and the idempotent ingest path absorbs the
/// overlap.
pub struct Pipeline<S: MobilityStore> {
    adapter: Box<dyn SourceAdapter>,
    store: Arc<S>,
    http: HttpFetcher,
    settings: PipelineSettings,
    in_flight: tokio::sync::Mutex<()>,
}

impl<S: MobilityStore> Pipeline<S> {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        store: Arc<S>,
        http: HttpFetcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            http,
            settings,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn source(&self) -> &'static str {
        self.adapter.source()
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    /// Single-flight entry point used by the scheduler. Never propagates an
    /// error; an overlapping tick is skipped rather than queued.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!(
                source = self.source(),
                "previous run still in flight, tick skipped"
            );
            return TickOutcome::SkippedOverlap;
        };

        match self.run_once().await {
            Ok(summary) => {
                info!(
                    source = %summary.source,
                    run = %summary.run_id,
                    sensors = summary.sensors_mapped,
                    datastreams = summary.datastreams_mapped,
                    written = summary.result.written,
                    skipped_non_numeric = summary.result.skipped_non_numeric,
                    skipped_duplicate = summary.result.skipped_duplicate,
                    "pipeline run complete"
                );
                TickOutcome::Completed(summary)
            }
            Err(err) => {
                error!(source = self.source(), %err, "pipeline tick abandoned");
                TickOutcome::Failed
            }
        }
    }

    async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let source = self.adapter.source();

        debug!(source, run = %run_id, stage = %Stage::Fetching, "stage");
        let entities = self.adapter.discover(&self.http, run_id).await?;

        debug!(source, run = %run_id, stage = %Stage::Reconciling, "stage");
        let reconciler = Reconciler::new(self.store.as_ref(), source);
        let sensors = reconciler.reconcile_sensors(&entities.sensors).await?;
        let datastreams = reconciler
            .reconcile_datastreams(&sensors, &entities.datastreams)
            .await?;

        let windows = plan_windows(self.store.as_ref(), &datastreams, self.settings.default_start)
            .await?;

        let observations = self.adapter.collect(&self.http, run_id, &windows).await?;

        debug!(source, run = %run_id, stage = %Stage::Ingesting, "stage");
        let resolved = self
            .resolve_observations(source, &entities, &datastreams, observations)
            .await?;
        let result = Ingestor::new(self.store.as_ref()).ingest(resolved).await?;

        debug!(source, run = %run_id, stage = %Stage::Idle, "stage");
        Ok(RunSummary {
            run_id,
            source: source.to_string(),
            started_at,
            finished_at: Utc::now(),
            sensors_mapped: sensors.len(),
            datastreams_mapped: datastreams.len(),
            result,
        })
    }

    /// Attach internal ids and the inherited confidential flag to raw
    /// observations. Streams missing from the run's mapping get one bulk
    /// re-resolve; whatever remains unknown is dropped with a warning.
    async fn resolve_observations(
        &self,
        source: &str,
        entities: &DiscoveredEntities,
        datastreams: &HashMap<ExternalId, i64>,
        observations: Vec<Observation>,
    ) -> Result<Vec<ResolvedObservation>, StoreError> {
        let confidential_by_ds: HashMap<&ExternalId, bool> = entities
            .datastreams
            .iter()
            .map(|ds| (&ds.external_id, ds.confidential))
            .collect();

        let mut unknown: Vec<ExternalId> = observations
            .iter()
            .map(|obs| &obs.datastream_external_id)
            .filter(|id| !datastreams.contains_key(*id))
            .cloned()
            .collect();
        unknown.sort();
        unknown.dedup();
        let extra = if unknown.is_empty() {
            HashMap::new()
        } else {
            self.store.resolve_datastreams(source, &unknown).await?
        };

        let mut resolved = Vec::with_capacity(observations.len());
        let mut dropped_unknown = 0usize;
        for observation in observations {
            let id = datastreams
                .get(&observation.datastream_external_id)
                .or_else(|| extra.get(&observation.datastream_external_id));
            let Some(&datastream_id) = id else {
                dropped_unknown += 1;
                continue;
            };
            let confidential = confidential_by_ds
                .get(&observation.datastream_external_id)
                .copied()
                .unwrap_or(true);
            resolved.push(ResolvedObservation {
                datastream_id,
                timestamp: observation.timestamp,
                value: observation.value,
                confidential,
            });
        }
        if dropped_unknown > 0 {
            warn!(
                source,
                count = dropped_unknown,
                "observations for unknown datastreams dropped"
            );
        }
        Ok(resolved)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_backoff_secs() -> u64 {
    3
}

fn default_http_timeout_secs() -> u64 {
    20
}

/// One entry in `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub interval_secs: u64,
    pub default_start: DateTime<Utc>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(flatten)]
    pub spec: SourceSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

pub fn parse_registry(text: &str) -> anyhow::Result<SourceRegistry> {
    serde_yaml::from_str(text).context("parsing source registry")
}

pub fn load_registry(path: impl AsRef<Path>) -> anyhow::Result<SourceRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_registry(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Build one pipeline per enabled registry entry. Each pipeline gets its
/// own fetcher so the per-source retry policy applies.
pub fn build_pipelines<S: MobilityStore + 'static>(
    registry: &SourceRegistry,
    store: Arc<S>,
    user_agent: &str,
) -> anyhow::Result<Vec<Arc<Pipeline<S>>>> {
    registry
        .sources
        .iter()
        .filter(|config| config.enabled)
        .map(|config| {
            let adapter = build_adapter(&config.spec);
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(user_agent.to_string()),
                backoff: BackoffPolicy {
                    max_retries: config.max_retries,
                    delay: Duration::from_secs(config.retry_backoff_secs),
                },
            })
            .with_context(|| format!("building http client for {}", adapter.source()))?;
            Ok(Arc::new(Pipeline::new(
                adapter,
                store.clone(),
                http,
                PipelineSettings {
                    interval: Duration::from_secs(config.interval_secs),
                    default_start: config.default_start,
                },
            )))
        })
        .collect()
}

/// Run every pipeline once, sequentially. Used at startup so a fresh
/// deployment does not wait a full interval for its first data.
pub async fn run_all_once<S: MobilityStore>(pipelines: &[Arc<Pipeline<S>>]) {
    for pipeline in pipelines {
        pipeline.tick().await;
    }
}

/// Register one repeated job per pipeline. Ticks never propagate errors,
/// so one failing source leaves the remaining schedule running.
pub async fn build_scheduler<S: MobilityStore + 'static>(
    pipelines: &[Arc<Pipeline<S>>],
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    for pipeline in pipelines {
        let job_pipeline = pipeline.clone();
        let job = Job::new_repeated_async(pipeline.interval(), move |_uuid, _lock| {
            let pipeline = job_pipeline.clone();
            Box::pin(async move {
                pipeline.tick().await;
            })
        })
        .with_context(|| format!("creating job for {}", pipeline.source()))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}
