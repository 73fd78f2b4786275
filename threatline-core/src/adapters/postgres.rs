//! PostgreSQL record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::error::AdapterError;
use crate::ports::{PutOutcome, RecordStore, UpdateOutcome};
use crate::record::{AttackRecord, InferenceResult, RecordId, RecordStatus, StoredRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS threatline_records (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    payload     JSONB NOT NULL,
    result      JSONB,
    failure     TEXT,
    updated_at  TIMESTAMPTZ NOT NULL,
    version     BIGINT NOT NULL
)
"#;

/// PostgreSQL-backed [`RecordStore`]. Conditional writes map onto
/// `ON CONFLICT DO NOTHING` and a version-guarded `UPDATE`.
#[derive(Clone, Debug)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool of up to `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AdapterError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(classify)?;
        Ok(Self::new(pool))
    }

    /// Creates the records table when missing.
    pub async fn bootstrap(&self) -> Result<(), AdapterError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        info!(target: "threatline::store", "record table ready");
        Ok(())
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError> {
        let version = to_db_version(record.version)?;
        let result = sqlx::query(
            r#"
            INSERT INTO threatline_records (id, kind, status, payload, result, failure, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id().as_str())
        .bind(&record.record.kind)
        .bind(record.status().as_str())
        .bind(Json(&record.record))
        .bind(record.result.as_ref().map(Json))
        .bind(record.failure.as_deref())
        .bind(record.updated_at)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(if result.rows_affected() == 1 {
            PutOutcome::Written
        } else {
            PutOutcome::AlreadyExists
        })
    }

    async fn update_if_version(
        &self,
        expected_version: u64,
        record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError> {
        let expected = to_db_version(expected_version)?;
        let row = sqlx::query(
            r#"
            UPDATE threatline_records
            SET status = $3,
                payload = $4,
                result = $5,
                failure = $6,
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(record.id().as_str())
        .bind(expected)
        .bind(record.status().as_str())
        .bind(Json(&record.record))
        .bind(record.result.as_ref().map(Json))
        .bind(record.failure.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        if let Some(row) = row {
            let version: i64 = row.try_get("version").map_err(classify)?;
            return Ok(UpdateOutcome::Applied {
                version: from_db_version(version)?,
            });
        }

        let exists = sqlx::query("SELECT 1 FROM threatline_records WHERE id = $1")
            .bind(record.id().as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        Ok(if exists.is_some() {
            UpdateOutcome::Conflict
        } else {
            UpdateOutcome::NotFound
        })
    }

    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError> {
        let row = sqlx::query(
            r#"
            SELECT status, payload, result, failure, updated_at, version
            FROM threatline_records
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(|row| decode(&row)).transpose()
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn decode(row: &PgRow) -> Result<StoredRecord, AdapterError> {
    let status: String = row.try_get("status").map_err(classify)?;
    let Json(mut record): Json<AttackRecord> = row.try_get("payload").map_err(classify)?;
    let result: Option<Json<InferenceResult>> = row.try_get("result").map_err(classify)?;
    let failure: Option<String> = row.try_get("failure").map_err(classify)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(classify)?;
    let version: i64 = row.try_get("version").map_err(classify)?;

    record.status = status
        .parse::<RecordStatus>()
        .map_err(|e| AdapterError::permanent(format!("corrupt record row: {e}")))?;
    Ok(StoredRecord {
        record,
        result: result.map(|Json(result)| result),
        failure,
        updated_at,
        version: from_db_version(version)?,
    })
}

fn to_db_version(version: u64) -> Result<i64, AdapterError> {
    i64::try_from(version)
        .map_err(|_| AdapterError::permanent(format!("version {version} exceeds BIGINT")))
}

fn from_db_version(version: i64) -> Result<u64, AdapterError> {
    u64::try_from(version)
        .map_err(|_| AdapterError::permanent(format!("negative version {version} in store")))
}

/// Pool exhaustion, I/O and serialization/deadlock aborts are worth
/// retrying; everything else is a permanent failure.
fn classify(err: sqlx::Error) -> AdapterError {
    let retryable = match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P01") | Some("53300")
        ),
        _ => false,
    };
    if retryable {
        AdapterError::transient(format!("store error: {err}"))
    } else {
        AdapterError::permanent(format!("store error: {err}"))
    }
}
