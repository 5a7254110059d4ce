// Traces: a header row for listing plus the full body in the blob store.
// Attribute names are interned; attribute values are kept per trace for lookups.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::agent_rollup::AgentRollupId;
use crate::blob_store::{
    BlobStore, BlobToken, SqliteBlobStore, decode_trace, encode_trace, put_retrying_once,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{Trace, TraceHeader};
use crate::name_cache::{DedupNameCache, Interned};
use crate::name_table::SqliteNameTable;
use crate::rollup_schedule::NEVER_EXPIRE_HOURS;

const ATTRIBUTE_NAME_TABLE: &str = "trace_attribute_name";
const MS_PER_HOUR: i64 = 3_600_000;

pub struct TraceRepo<B = SqliteBlobStore> {
    pool: SqlitePool,
    blobs: Arc<B>,
    attribute_names: DedupNameCache<SqliteNameTable>,
    retention_hours: u32,
}

impl<B: BlobStore> TraceRepo<B> {
    pub fn new(pool: SqlitePool, blobs: Arc<B>, retention_hours: u32) -> Self {
        let attribute_names =
            DedupNameCache::new(SqliteNameTable::new(pool.clone(), ATTRIBUTE_NAME_TABLE));
        Self {
            pool,
            blobs,
            attribute_names,
            retention_hours,
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        self.attribute_names.table().init().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trace (
                agent_rollup TEXT NOT NULL,
                id TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                transaction_name TEXT NOT NULL,
                capture_time INTEGER NOT NULL,
                duration_nanos INTEGER NOT NULL,
                error INTEGER NOT NULL,
                headline TEXT NOT NULL,
                body_blob INTEGER NOT NULL,
                PRIMARY KEY (agent_rollup, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trace_capture_time ON trace(capture_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trace_attribute (
                agent_rollup TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                attribute_name_id INTEGER NOT NULL,
                value TEXT NOT NULL,
                capture_time INTEGER NOT NULL,
                PRIMARY KEY (agent_rollup, trace_id, attribute_name_id, value)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retention horizon, or `None` when traces are kept forever.
    pub fn retention_millis(&self) -> Option<i64> {
        (self.retention_hours != NEVER_EXPIRE_HOURS)
            .then(|| i64::from(self.retention_hours) * MS_PER_HOUR)
    }

    /// Stores (or replaces) a trace. Replacing keeps the trace id stable for redelivery.
    #[instrument(
        skip(self, agent_rollup, trace),
        fields(repo = "trace", operation = "store", agent_rollup = %agent_rollup, trace_id = %trace.id)
    )]
    pub async fn store(&self, agent_rollup: &AgentRollupId, trace: &Trace) -> StoreResult<()> {
        let duration_nanos = i64::try_from(trace.duration_nanos).map_err(|_| {
            StoreError::rejected(format!(
                "trace {}: duration {} out of range",
                trace.id, trace.duration_nanos
            ))
        })?;
        let mut attribute_ids = Vec::with_capacity(trace.attributes.len());
        for attr in &trace.attributes {
            match self
                .attribute_names
                .ensure_written(&attr.name, trace.capture_time)
                .await?
            {
                Interned::Id(id) => attribute_ids.push(id),
                Interned::Closed => return Err(StoreError::Closed),
            }
        }
        let body = put_retrying_once(&*self.blobs, encode_trace(trace)?).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO trace
            (agent_rollup, id, transaction_type, transaction_name, capture_time, duration_nanos,
             error, headline, body_blob)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(agent_rollup, id) DO UPDATE SET
                transaction_type = excluded.transaction_type,
                transaction_name = excluded.transaction_name,
                capture_time = excluded.capture_time,
                duration_nanos = excluded.duration_nanos,
                error = excluded.error,
                headline = excluded.headline,
                body_blob = excluded.body_blob
            "#,
        )
        .bind(agent_rollup.as_str())
        .bind(&trace.id)
        .bind(&trace.transaction_type)
        .bind(&trace.transaction_name)
        .bind(trace.capture_time)
        .bind(duration_nanos)
        .bind(trace.error)
        .bind(&trace.headline)
        .bind(body.0)
        .execute(&mut *tx)
        .await?;
        // a redelivered trace replaces its attribute index entries
        sqlx::query("DELETE FROM trace_attribute WHERE agent_rollup = $1 AND trace_id = $2")
            .bind(agent_rollup.as_str())
            .bind(&trace.id)
            .execute(&mut *tx)
            .await?;
        for (attr, name_id) in trace.attributes.iter().zip(&attribute_ids) {
            for value in &attr.values {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO trace_attribute
                    (agent_rollup, trace_id, attribute_name_id, value, capture_time)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(agent_rollup.as_str())
                .bind(&trace.id)
                .bind(name_id)
                .bind(value)
                .bind(trace.capture_time)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn read_trace(
        &self,
        agent_rollup: &AgentRollupId,
        trace_id: &str,
    ) -> StoreResult<Option<Trace>> {
        let token = sqlx::query_scalar::<_, i64>(
            "SELECT body_blob FROM trace WHERE agent_rollup = $1 AND id = $2",
        )
        .bind(agent_rollup.as_str())
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(token) = token else {
            return Ok(None);
        };
        let bytes = self.blobs.get(BlobToken(token)).await?;
        Ok(Some(decode_trace(&bytes)?))
    }

    /// Newest first, `from < capture_time <= to`.
    #[instrument(
        skip(self, agent_rollup),
        fields(repo = "trace", operation = "read_trace_headers", agent_rollup = %agent_rollup)
    )]
    pub async fn read_trace_headers(
        &self,
        agent_rollup: &AgentRollupId,
        from: i64,
        to: i64,
        limit: u32,
    ) -> StoreResult<Vec<TraceHeader>> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_type, transaction_name, capture_time, duration_nanos, error, headline
            FROM trace
            WHERE agent_rollup = $1 AND capture_time > $2 AND capture_time <= $3
            ORDER BY capture_time DESC, id ASC
            LIMIT $4
            "#,
        )
        .bind(agent_rollup.as_str())
        .bind(from)
        .bind(to)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let duration: i64 = row.try_get("duration_nanos")?;
                Ok(TraceHeader {
                    id: row.try_get("id")?,
                    transaction_type: row.try_get("transaction_type")?,
                    transaction_name: row.try_get("transaction_name")?,
                    capture_time: row.try_get("capture_time")?,
                    duration_nanos: duration.max(0) as u64,
                    error: row.try_get("error")?,
                    headline: row.try_get("headline")?,
                })
            })
            .collect()
    }

    /// Ids of traces carrying `attribute_name = value`, newest first.
    pub async fn find_trace_ids_by_attribute(
        &self,
        agent_rollup: &AgentRollupId,
        attribute_name: &str,
        value: &str,
    ) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(&format!(
            r#"
            SELECT a.trace_id FROM trace_attribute a
            JOIN {ATTRIBUTE_NAME_TABLE} n ON n.id = a.attribute_name_id
            WHERE a.agent_rollup = $1 AND n.key = $2 AND a.value = $3
            ORDER BY a.capture_time DESC, a.trace_id ASC
            "#
        ))
        .bind(agent_rollup.as_str())
        .bind(attribute_name)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    #[instrument(skip(self), fields(repo = "trace", operation = "prune_expired"))]
    pub async fn prune_expired(&self, now: i64) -> StoreResult<u64> {
        let Some(retention) = self.retention_millis() else {
            return Ok(0);
        };
        let cutoff = now - retention;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM trace_attribute WHERE capture_time < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let r = sqlx::query("DELETE FROM trace WHERE capture_time < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let names = self.attribute_names.prune_older_than(cutoff).await?;
        if names > 0 {
            debug!(names, "pruned trace attribute names");
        }
        Ok(r.rows_affected())
    }

    pub fn close(&self) {
        self.attribute_names.close();
    }
}
