//! Postgres persistence + HTTP fetch utilities for metrosense.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrosense_core::ExternalId;
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metrosense-store";

/// Rows inserted per measurement statement. Larger batches are partitioned;
/// callers see one logical write either way.
const MEASUREMENT_CHUNK: usize = 50_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("database unavailable after {attempts} connect attempts")]
    Unavailable { attempts: u32 },
}

/// Sensor row as created by the reconciler. Coordinates are the derived
/// centroid and may be absent when the source geometry was unusable.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSensor {
    pub external_id: ExternalId,
    pub description: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub confidential: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDatastream {
    pub sensor_id: i64,
    pub external_id: ExternalId,
    pub kind: String,
    pub unit: Option<String>,
    pub confidential: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub datastream_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub confidential: bool,
}

/// Store operations the ingestion engine needs.
///
/// Identity lookups are bulk by contract: one round trip per batch, a map as
/// the result even when every id is unknown. Inserts are insert-or-ignore on
/// the natural key and return only the rows this call actually created, so a
/// concurrent creator shows up as an absent entry to re-resolve, not as an
/// error.
#[async_trait]
pub trait MobilityStore: Send + Sync {
    async fn resolve_sensors(
        &self,
        source: &str,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, i64>, StoreError>;

    async fn resolve_datastreams(
        &self,
        source: &str,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, i64>, StoreError>;

    async fn insert_sensors(
        &self,
        source: &str,
        rows: &[NewSensor],
    ) -> Result<HashMap<ExternalId, i64>, StoreError>;

    async fn insert_datastreams(
        &self,
        rows: &[NewDatastream],
    ) -> Result<HashMap<ExternalId, i64>, StoreError>;

    /// Insert-or-ignore on (datastream_id, timestamp); returns rows written.
    async fn insert_measurements(&self, rows: &[MeasurementRow]) -> Result<u64, StoreError>;

    /// Latest stored measurement timestamp per datastream, one bulk query.
    async fn latest_timestamps(
        &self,
        datastream_ids: &[i64],
    ) -> Result<HashMap<i64, DateTime<Utc>>, StoreError>;

    async fn resolve_sensor(
        &self,
        source: &str,
        external_id: &ExternalId,
    ) -> Result<Option<i64>, StoreError> {
        let mut map = self
            .resolve_sensors(source, std::slice::from_ref(external_id))
            .await?;
        Ok(map.remove(external_id))
    }

    async fn resolve_datastream(
        &self,
        source: &str,
        external_id: &ExternalId,
    ) -> Result<Option<i64>, StoreError> {
        let mut map = self
            .resolve_datastreams(source, std::slice::from_ref(external_id))
            .await?;
        Ok(map.remove(external_id))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connect with bounded retries; transient startup races against the
    /// database container are the norm, not the exception.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, StoreError> {
        for attempt in 1..=attempts {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    info!(attempt, "connected to database");
                    return Ok(Self::new(pool));
                }
                Err(err) => {
                    warn!(attempt, attempts, %err, "database connect failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(StoreError::Unavailable { attempts })
    }

    /// Create tables and indexes if absent. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id           BIGSERIAL PRIMARY KEY,
                source       TEXT    NOT NULL,
                ex_id        TEXT,
                description  TEXT,
                longitude    DOUBLE PRECISION,
                latitude     DOUBLE PRECISION,
                confidential BOOLEAN NOT NULL DEFAULT TRUE
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // ex_id is NULL for manually created sensors, so uniqueness of the
        // (source, ex_id) pair only applies where an external id is known.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sensors_source_ex_id
                ON sensors (source, ex_id) WHERE ex_id IS NOT NULL;
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS datastreams (
                id           BIGSERIAL PRIMARY KEY,
                sensor_id    BIGINT  NOT NULL REFERENCES sensors (id),
                ex_id        TEXT,
                type         TEXT    NOT NULL,
                unit         TEXT,
                confidential BOOLEAN NOT NULL DEFAULT TRUE
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_datastreams_sensor_ex_id
                ON datastreams (sensor_id, ex_id) WHERE ex_id IS NOT NULL;
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                datastream_id BIGINT           NOT NULL REFERENCES datastreams (id),
                timestamp     TIMESTAMPTZ      NOT NULL,
                value         DOUBLE PRECISION NOT NULL,
                confidential  BOOLEAN          NOT NULL DEFAULT TRUE,
                PRIMARY KEY (datastream_id, timestamp)
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn id_texts(external_ids: &[ExternalId]) -> Vec<String> {
    external_ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn into_id_map(rows: Vec<(String, i64)>) -> HashMap<ExternalId, i64> {
    rows.into_iter()
        .map(|(ex_id, id)| (ExternalId::new(ex_id), id))
        .collect()
}

#[async_trait]
impl MobilityStore for PgStore {
    async fn resolve_sensors(
        &self,
        source: &str,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT ex_id, id
            FROM sensors
            WHERE source = $1 AND ex_id = ANY($2)
            "#,
        )
        .bind(source)
        .bind(id_texts(external_ids))
        .fetch_all(&self.pool)
        .await?;
        Ok(into_id_map(rows))
    }

    async fn resolve_datastreams(
        &self,
        source: &str,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT d.ex_id, d.id
            FROM datastreams d
            JOIN sensors s ON s.id = d.sensor_id
            WHERE s.source = $1 AND d.ex_id = ANY($2)
            "#,
        )
        .bind(source)
        .bind(id_texts(external_ids))
        .fetch_all(&self.pool)
        .await?;
        Ok(into_id_map(rows))
    }

    async fn insert_sensors(
        &self,
        source: &str,
        rows: &[NewSensor],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        if rows.is_empty() {
            return Ok(HashMap::new());
        }
        let ex_ids: Vec<String> = rows.iter().map(|r| r.external_id.as_str().into()).collect();
        let descriptions: Vec<String> = rows.iter().map(|r| r.description.clone()).collect();
        let longitudes: Vec<Option<f64>> = rows.iter().map(|r| r.longitude).collect();
        let latitudes: Vec<Option<f64>> = rows.iter().map(|r| r.latitude).collect();
        let confidentials: Vec<bool> = rows.iter().map(|r| r.confidential).collect();

        let created = sqlx::query_as::<_, (String, i64)>(
            r#"
            INSERT INTO sensors (source, ex_id, description, longitude, latitude, confidential)
            SELECT $1, u.ex_id, u.description, u.longitude, u.latitude, u.confidential
            FROM UNNEST($2::text[], $3::text[], $4::float8[], $5::float8[], $6::bool[])
                 AS u(ex_id, description, longitude, latitude, confidential)
            ON CONFLICT (source, ex_id) WHERE ex_id IS NOT NULL DO NOTHING
            RETURNING ex_id, id
            "#,
        )
        .bind(source)
        .bind(ex_ids)
        .bind(descriptions)
        .bind(longitudes)
        .bind(latitudes)
        .bind(confidentials)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_id_map(created))
    }

    async fn insert_datastreams(
        &self,
        rows: &[NewDatastream],
    ) -> Result<HashMap<ExternalId, i64>, StoreError> {
        if rows.is_empty() {
            return Ok(HashMap::new());
        }
        let sensor_ids: Vec<i64> = rows.iter().map(|r| r.sensor_id).collect();
        let ex_ids: Vec<String> = rows.iter().map(|r| r.external_id.as_str().into()).collect();
        let kinds: Vec<String> = rows.iter().map(|r| r.kind.clone()).collect();
        let units: Vec<Option<String>> = rows.iter().map(|r| r.unit.clone()).collect();
        let confidentials: Vec<bool> = rows.iter().map(|r| r.confidential).collect();

        let created = sqlx::query_as::<_, (String, i64)>(
            r#"
            INSERT INTO datastreams (sensor_id, ex_id, type, unit, confidential)
            SELECT u.sensor_id, u.ex_id, u.type, u.unit, u.confidential
            FROM UNNEST($1::int8[], $2::text[], $3::text[], $4::text[], $5::bool[])
                 AS u(sensor_id, ex_id, type, unit, confidential)
            ON CONFLICT (sensor_id, ex_id) WHERE ex_id IS NOT NULL DO NOTHING
            RETURNING ex_id, id
            "#,
        )
        .bind(sensor_ids)
        .bind(ex_ids)
        .bind(kinds)
        .bind(units)
        .bind(confidentials)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_id_map(created))
    }

    async fn insert_measurements(&self, rows: &[MeasurementRow]) -> Result<u64, StoreError> {
        let mut written = 0u64;
        for chunk in rows.chunks(MEASUREMENT_CHUNK) {
            let datastream_ids: Vec<i64> = chunk.iter().map(|r| r.datastream_id).collect();
            let timestamps: Vec<DateTime<Utc>> = chunk.iter().map(|r| r.timestamp).collect();
            let values: Vec<f64> = chunk.iter().map(|r| r.value).collect();
            let confidentials: Vec<bool> = chunk.iter().map(|r| r.confidential).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO measurements (datastream_id, timestamp, value, confidential)
                SELECT u.datastream_id, u.timestamp, u.value, u.confidential
                FROM UNNEST($1::int8[], $2::timestamptz[], $3::float8[], $4::bool[])
                     AS u(datastream_id, timestamp, value, confidential)
                ON CONFLICT (datastream_id, timestamp) DO NOTHING
                "#,
            )
            .bind(datastream_ids)
            .bind(timestamps)
            .bind(values)
            .bind(confidentials)
            .execute(&self.pool)
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn latest_timestamps(
        &self,
        datastream_ids: &[i64],
    ) -> Result<HashMap<i64, DateTime<Utc>>, StoreError> {
        if datastream_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"
            SELECT datastream_id, MAX(timestamp)
            FROM measurements
            WHERE datastream_id = ANY($1)
            GROUP BY datastream_id
            "#,
        )
        .bind(datastream_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with a fixed pause between attempts, matching the cadence
/// the upstream gateways tolerate.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with bounded fixed-backoff retries on transient failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        auth: Option<(&str, &str)>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some((user, password)) = auth {
                request = request.basic_auth(user, Some(password));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%err, attempt, "retryable request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn default_backoff_is_five_fixed_pauses() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(3));
    }

    #[test]
    fn id_text_round_trip_preserves_canonical_form() {
        let ids = vec![ExternalId::from(7), ExternalId::from(" x-9 ")];
        assert_eq!(id_texts(&ids), vec!["7".to_string(), "x-9".to_string()]);

        let map = into_id_map(vec![("7".into(), 1), ("x-9".into(), 2)]);
        assert_eq!(map.get(&ExternalId::from(7)), Some(&1));
        assert_eq!(map.get(&ExternalId::from("x-9")), Some(&2));
    }
}
