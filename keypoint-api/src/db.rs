//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling using deadpool-postgres and the
//! PostgreSQL-backed [`ResultStore`].
//!
//! Records live in a single append-only `log_requests` table. The store
//! never updates or deletes rows.

use crate::error::{ApiError, ApiResult};
use ::async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime, Timeouts,
};
use keypoint_core::{AuditRecord, Fingerprint, NewAuditRecord, RecordId, StorageError, Timestamp};
use keypoint_storage::ResultStore;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "keypoint".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("KEYPOINT_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("KEYPOINT_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("KEYPOINT_DB_NAME").unwrap_or_else(|_| "keypoint".to_string()),
            user: std::env::var("KEYPOINT_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("KEYPOINT_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("KEYPOINT_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("KEYPOINT_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(self.max_size);
        pool_config.timeouts = Timeouts {
            wait: Some(self.timeout),
            create: Some(self.timeout),
            recycle: Some(self.timeout),
        };
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS log_requests (
    id            BIGSERIAL PRIMARY KEY,
    entry_date    TIMESTAMPTZ NOT NULL DEFAULT now(),
    method        VARCHAR NOT NULL,
    response_body JSONB,
    file_hash     VARCHAR
)";

const CREATE_FILE_HASH_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS log_requests_file_hash_idx ON log_requests (file_hash, id)";

const CREATE_ENTRY_DATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS log_requests_entry_date_idx ON log_requests (entry_date)";

/// Applied in order by [`PgResultStore::ensure_schema`]; each is idempotent.
const SCHEMA_SQL: &[&str] = &[
    CREATE_TABLE_SQL,
    CREATE_FILE_HASH_INDEX_SQL,
    CREATE_ENTRY_DATE_INDEX_SQL,
];

const INSERT_SQL: &str = "\
INSERT INTO log_requests (method, response_body, file_hash)
VALUES ($1, $2, $3)
RETURNING id, entry_date";

const LOOKUP_SQL: &str = "\
SELECT id, entry_date, method, response_body, file_hash
FROM log_requests
WHERE file_hash = $1
ORDER BY id
LIMIT 1";

// ============================================================================
// POSTGRES RESULT STORE
// ============================================================================

/// [`ResultStore`] backed by the `log_requests` table.
#[derive(Clone)]
pub struct PgResultStore {
    pool: Pool,
}

impl PgResultStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create the records table and fingerprint index if they are missing.
    pub async fn ensure_schema(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        for statement in SCHEMA_SQL {
            conn.batch_execute(statement).await?;
        }
        tracing::info!("Record schema ready");
        Ok(())
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Object, StorageError> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StorageError> {
        let conn = self.get_conn().await?;
        let fingerprint = record.fingerprint.as_ref().map(Fingerprint::as_str);

        let row = conn
            .query_one(INSERT_SQL, &[&record.operation, &record.payload, &fingerprint])
            .await
            .map_err(|e| StorageError::InsertFailed {
                reason: e.to_string(),
            })?;

        let id: RecordId = row.try_get(0).map_err(|e| StorageError::InsertFailed {
            reason: e.to_string(),
        })?;
        let timestamp: Timestamp = row.try_get(1).map_err(|e| StorageError::CorruptRecord {
            id,
            reason: e.to_string(),
        })?;

        Ok(record.into_record(id, timestamp))
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AuditRecord>, StorageError> {
        let conn = self.get_conn().await?;

        let row = conn
            .query_opt(LOOKUP_SQL, &[&fingerprint.as_str()])
            .await
            .map_err(|e| StorageError::QueryFailed {
                reason: e.to_string(),
            })?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;

        // Simple query to verify connectivity
        conn.query_one("SELECT 1", &[])
            .await
            .map_err(|e| StorageError::Unavailable {
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

fn pool_error(err: PoolError) -> StorageError {
    StorageError::Unavailable {
        reason: err.to_string(),
    }
}

fn record_from_row(row: &Row) -> Result<AuditRecord, StorageError> {
    let id: RecordId = row.try_get("id").map_err(|e| StorageError::QueryFailed {
        reason: e.to_string(),
    })?;
    let corrupt = |reason: String| StorageError::CorruptRecord { id, reason };

    let timestamp: Timestamp = row.try_get("entry_date").map_err(|e| corrupt(e.to_string()))?;
    let operation: String = row.try_get("method").map_err(|e| corrupt(e.to_string()))?;
    let payload: Option<JsonValue> = row
        .try_get("response_body")
        .map_err(|e| corrupt(e.to_string()))?;
    let fingerprint = row
        .try_get::<_, Option<String>>("file_hash")
        .map_err(|e| corrupt(e.to_string()))?
        .map(|raw| raw.parse::<Fingerprint>())
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(AuditRecord {
        id,
        timestamp,
        operation,
        payload,
        fingerprint,
    })
}


#[cfg(all(test, feature = "db-tests"))]
mod db_tests {
    use super::*;
    use serde_json::json;

    async fn store() -> ApiResult<PgResultStore> {
        let store = PgResultStore::from_config(&DbConfig::from_env())?;
        store.ensure_schema().await?;
        Ok(store)
    }

    #[tokio::test]
    async fn test_append_then_lookup_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let store = store().await?;
        let fp = Fingerprint::of(format!("pg-{}", chrono::Utc::now()).as_bytes());

        let first = store
            .append(NewAuditRecord::new(
                "/process-image",
                Some(json!({"format": "png", "width": 4})),
                Some(fp.clone()),
            ))
            .await?;
        store
            .append(NewAuditRecord::new(
                "/process-image",
                Some(json!({"format": "png", "width": 8})),
                Some(fp.clone()),
            ))
            .await?;

        let found = store.find_by_fingerprint(&fp).await?;
        assert_eq!(found.map(|r| r.id), Some(first.id));
        Ok(())
    }

    #[tokio::test]
    async fn test_schema_creates_indexes() -> Result<(), Box<dyn std::error::Error>> {
        let store = store().await?;
        let conn = store.pool.get().await?;
        let rows = conn
            .query(
                "SELECT indexname FROM pg_indexes WHERE tablename = 'log_requests'",
                &[],
            )
            .await?;
        let names: Vec<String> = rows.iter().map(|row| row.get("indexname")).collect();
        assert!(names.iter().any(|n| n == "log_requests_file_hash_idx"));
        assert!(names.iter().any(|n| n == "log_requests_entry_date_idx"));
        Ok(())
    }

    #[tokio::test]
    async fn test_health_check() -> Result<(), Box<dyn std::error::Error>> {
        let store = store().await?;
        store.health_check().await?;
        Ok(())
    }
}
