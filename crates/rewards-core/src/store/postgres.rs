use super::{
    CommitRequest, Expectation, LedgerStore, Record, RecordKey, RecordKind, Snapshot,
    StoreError, StoreResult, Versioned,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use std::collections::BTreeMap;

/// PostgreSQL ledger store.
///
/// Every record lives in one table as tagged JSON next to its version. Commits run in a
/// single SQL transaction and lock the read set with `FOR UPDATE` before validating it.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rewards_records (
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                unique_index TEXT NULL,
                unique_value TEXT NULL,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (kind, record_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_rewards_records_unique ON rewards_records (unique_index, unique_value) WHERE unique_value IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn locked_version(conn: &mut PgConnection, key: &RecordKey) -> StoreResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT version FROM rewards_records WHERE kind = $1 AND record_id = $2 FOR UPDATE",
        )
        .bind(key.kind.as_str())
        .bind(&key.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| decode_version(&row)).transpose()
    }

    async fn apply_write(
        conn: &mut PgConnection,
        record: &Record,
        expected: Expectation,
    ) -> StoreResult<()> {
        let key = record.key();
        let payload =
            serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let (unique_index, unique_value) = match record.unique_key() {
            Some((index, value)) => (Some(index), Some(value)),
            None => (None, None),
        };

        let affected = match expected {
            Expectation::Absent => sqlx::query(
                r#"
                INSERT INTO rewards_records (kind, record_id, version, unique_index, unique_value, payload)
                VALUES ($1, $2, 1, $3, $4, $5)
                ON CONFLICT (kind, record_id) DO NOTHING
                "#,
            )
            .bind(key.kind.as_str())
            .bind(&key.id)
            .bind(unique_index)
            .bind(&unique_value)
            .bind(&payload)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected(),
            Expectation::Version(version) => sqlx::query(
                r#"
                UPDATE rewards_records
                SET version = version + 1, unique_index = $3, unique_value = $4, payload = $5, updated_at = now()
                WHERE kind = $1 AND record_id = $2 AND version = $6
                "#,
            )
            .bind(key.kind.as_str())
            .bind(&key.id)
            .bind(unique_index)
            .bind(&unique_value)
            .bind(&payload)
            .bind(to_db_version(version)?)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected(),
        };

        if affected != 1 {
            return Err(StoreError::Conflict(format!(
                "{key} expected {expected:?} at write time"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn read(&self, keys: &[RecordKey]) -> StoreResult<Snapshot> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut entries = BTreeMap::new();
        for key in keys {
            let row = sqlx::query(
                "SELECT version, payload FROM rewards_records WHERE kind = $1 AND record_id = $2",
            )
            .bind(key.kind.as_str())
            .bind(&key.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            let value = row.map(|row| decode_versioned(&row)).transpose()?;
            entries.insert(key.clone(), value);
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Snapshot::new(entries))
    }

    async fn commit(&self, request: CommitRequest) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Lock in key order so concurrent commits over overlapping sets cannot deadlock.
        let mut reads = request.reads;
        reads.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, observed) in &reads {
            let current = Self::locked_version(&mut tx, key).await?;
            if current != *observed {
                return Err(StoreError::Conflict(format!(
                    "{key} moved from {observed:?} to {current:?}"
                )));
            }
        }

        for write in &request.writes {
            Self::apply_write(&mut tx, &write.record, write.expected).await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn compare_and_swap(&self, record: Record, expected_version: u64) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        Self::apply_write(&mut conn, &record, Expectation::Version(expected_version)).await?;
        Ok(expected_version + 1)
    }

    async fn scan(&self, kind: RecordKind) -> StoreResult<Vec<Versioned>> {
        let rows = sqlx::query("SELECT version, payload FROM rewards_records WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(decode_versioned).collect()
    }
}

fn decode_version(row: &PgRow) -> StoreResult<u64> {
    let version: i64 = row
        .try_get("version")
        .map_err(|e| StoreError::Backend(format!("postgres decode version failed: {e}")))?;
    version
        .try_into()
        .map_err(|_| StoreError::Backend("negative record version in storage".to_string()))
}

fn decode_versioned(row: &PgRow) -> StoreResult<Versioned> {
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| StoreError::Backend(format!("postgres decode payload failed: {e}")))?;
    let record =
        serde_json::from_value(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Versioned {
        version: decode_version(row)?,
        record,
    })
}

fn to_db_version(version: u64) -> StoreResult<i64> {
    version
        .try_into()
        .map_err(|_| StoreError::Backend("record version exceeds BIGINT range".to_string()))
}

/// Unique violations become `Duplicate`; serialization failures and deadlocks are
/// reported as conflicts so the Mutator retries them.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        match db.code().as_deref() {
            Some("23505") => {
                return StoreError::Duplicate {
                    index: db.constraint().unwrap_or("unique").to_string(),
                    value: db.message().to_string(),
                }
            }
            Some("40001") | Some("40P01") => return StoreError::Conflict(db.message().to_string()),
            _ => {}
        }
    }
    StoreError::Backend(format!("postgres error: {err}"))
}
