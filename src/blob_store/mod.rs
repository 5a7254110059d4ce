// Bounded-size append-only blob store: `put(bytes) -> token`, `get(token) -> bytes`.
// Tabular rows keep only the token; the payload (histograms, trace bodies, query texts)
// lives here with a version prefix.

pub(crate) mod encoding;

use std::future::Future;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::models::{DurationHistogram, Trace};

/// Opaque handle to a stored blob; only meaningful to the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobToken(pub i64);

pub trait BlobStore: Send + Sync + 'static {
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = StoreResult<BlobToken>> + Send;
    fn get(&self, token: BlobToken) -> impl Future<Output = StoreResult<Vec<u8>>> + Send;
}

/// Writes a blob, retrying a single transient failure before giving up.
pub async fn put_retrying_once<B: BlobStore>(store: &B, bytes: Vec<u8>) -> StoreResult<BlobToken> {
    match store.put(bytes.clone()).await {
        Ok(token) => Ok(token),
        Err(e) if e.is_fatal() || e.is_payload_error() => Err(e),
        Err(e) => {
            warn!(error = %e, "blob write failed, retrying once");
            store.put(bytes).await
        }
    }
}

pub const DEFAULT_MAX_BLOB_BYTES: usize = 16 * 1024 * 1024;

/// Blob store kept in the same SQLite database as the tabular data.
pub struct SqliteBlobStore {
    pool: SqlitePool,
    max_blob_bytes: usize,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_max_blob_bytes(pool, DEFAULT_MAX_BLOB_BYTES)
    }

    pub fn with_max_blob_bytes(pool: SqlitePool, max_blob_bytes: usize) -> Self {
        Self {
            pool,
            max_blob_bytes,
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blob (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                data BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blob_created_at ON blob(created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes blobs written before `cutoff`. Callers pass the longest retention horizon,
    /// so every row still referencing a blob is pruned before the blob itself.
    #[instrument(skip(self), fields(repo = "blob", operation = "prune_older_than"))]
    pub async fn prune_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        let r = sqlx::query("DELETE FROM blob WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}

impl BlobStore for SqliteBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<BlobToken> {
        if bytes.len() > self.max_blob_bytes {
            return Err(StoreError::encode(
                "blob",
                format!("{} bytes exceeds limit {}", bytes.len(), self.max_blob_bytes),
            ));
        }
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO blob (created_at, data) VALUES ($1, $2) RETURNING id",
        )
        .bind(crate::db::now_millis())
        .bind(&bytes)
        .fetch_one(&self.pool)
        .await?;
        Ok(BlobToken(id))
    }

    async fn get(&self, token: BlobToken) -> StoreResult<Vec<u8>> {
        sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM blob WHERE id = $1")
            .bind(token.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::MissingBlob(token.0))
    }
}

pub(crate) fn encode_histogram(h: &DurationHistogram) -> StoreResult<Vec<u8>> {
    let payload = wincode::serialize(h).map_err(|e| StoreError::encode("histogram", e))?;
    Ok(encoding::with_version_prefix(
        encoding::HISTOGRAM_VERSION,
        payload,
    ))
}

pub(crate) fn decode_histogram(bytes: &[u8]) -> StoreResult<DurationHistogram> {
    let payload = encoding::blob_payload(bytes, encoding::HISTOGRAM_VERSION)
        .ok_or_else(|| StoreError::corrupt("histogram", "unknown blob version"))?;
    wincode::deserialize::<DurationHistogram>(payload).map_err(|e| StoreError::corrupt("histogram", e))
}

pub(crate) fn encode_trace(trace: &Trace) -> StoreResult<Vec<u8>> {
    let payload = wincode::serialize(trace).map_err(|e| StoreError::encode("trace", e))?;
    Ok(encoding::with_version_prefix(encoding::TRACE_VERSION, payload))
}

pub(crate) fn decode_trace(bytes: &[u8]) -> StoreResult<Trace> {
    let payload = encoding::blob_payload(bytes, encoding::TRACE_VERSION)
        .ok_or_else(|| StoreError::corrupt("trace", "unknown blob version"))?;
    wincode::deserialize::<Trace>(payload).map_err(|e| StoreError::corrupt("trace", e))
}

#[allow(clippy::ptr_arg)]
pub(crate) fn encode_query_texts(texts: &Vec<String>) -> StoreResult<Vec<u8>> {
    let payload = wincode::serialize(texts).map_err(|e| StoreError::encode("query texts", e))?;
    Ok(encoding::with_version_prefix(
        encoding::QUERY_TEXTS_VERSION,
        payload,
    ))
}

pub(crate) fn decode_query_texts(bytes: &[u8]) -> StoreResult<Vec<String>> {
    let payload = encoding::blob_payload(bytes, encoding::QUERY_TEXTS_VERSION)
        .ok_or_else(|| StoreError::corrupt("query texts", "unknown blob version"))?;
    wincode::deserialize::<Vec<String>>(payload).map_err(|e| StoreError::corrupt("query texts", e))
}
