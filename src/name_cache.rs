// Write-avoidance cache for recurring names (gauge names, trace attribute names).
// A hit means "already persisted within the TTL"; a miss proves nothing about the table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::error::StoreResult;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Rows younger than this past the prune cutoff are kept, because a name inside the
/// cache TTL is not re-written and its last capture time may lag by up to a day.
const PRUNE_SAFETY_MARGIN_MS: i64 = 24 * 60 * 60 * 1000;

const PURGE_EVERY: usize = 1024;

/// Backing table of `key -> (id, last_capture_time)`.
pub trait NameTable: Send + Sync + 'static {
    fn find(&self, key: &str) -> impl Future<Output = StoreResult<Option<i64>>> + Send;
    fn insert(&self, key: &str, capture_time: i64)
    -> impl Future<Output = StoreResult<i64>> + Send;
    fn touch(&self, id: i64, capture_time: i64) -> impl Future<Output = StoreResult<()>> + Send;
    fn delete_older_than(&self, cutoff: i64) -> impl Future<Output = StoreResult<u64>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interned {
    Id(i64),
    /// The cache has been closed; nothing was written.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct CachedName {
    id: i64,
    written_at: Instant,
}

pub struct DedupNameCache<T> {
    table: T,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedName>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<T: NameTable> DedupNameCache<T> {
    pub fn new(table: T) -> Self {
        Self::with_ttl(table, DEFAULT_TTL)
    }

    pub fn with_ttl(table: T, ttl: Duration) -> Self {
        Self {
            table,
            ttl,
            entries: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Makes sure `key` is persisted with a recent last capture time and returns its id.
    /// Hits inside the TTL do no I/O.
    #[instrument(skip(self), fields(operation = "ensure_written"))]
    pub async fn ensure_written(&self, key: &str, capture_time: i64) -> StoreResult<Interned> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(Interned::Closed);
        }
        if let Some(id) = self.lookup(key).await {
            return Ok(Interned::Id(id));
        }

        let _guard = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(Interned::Closed);
        }
        // another writer may have filled it while we waited for the lock
        if let Some(id) = self.lookup(key).await {
            return Ok(Interned::Id(id));
        }

        let id = match self.table.find(key).await? {
            Some(id) => {
                self.table.touch(id, capture_time).await?;
                id
            }
            None => match self.table.insert(key, capture_time).await {
                Ok(id) => id,
                Err(e) if e.is_conflict() => {
                    debug!(key, "name inserted concurrently, updating instead");
                    let Some(id) = self.table.find(key).await? else {
                        return Err(e);
                    };
                    self.table.touch(id, capture_time).await?;
                    id
                }
                Err(e) => return Err(e),
            },
        };

        let mut entries = self.entries.write().await;
        if entries.len() % PURGE_EVERY == PURGE_EVERY - 1 {
            let ttl = self.ttl;
            entries.retain(|_, e| e.written_at.elapsed() < ttl);
        }
        entries.insert(
            key.to_string(),
            CachedName {
                id,
                written_at: Instant::now(),
            },
        );
        Ok(Interned::Id(id))
    }

    /// Cache-only read. `None` does not mean the name is absent from the table.
    pub async fn lookup(&self, key: &str) -> Option<i64> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.written_at.elapsed() < self.ttl)
            .map(|e| e.id)
    }

    /// Deletes names last seen before `capture_time` minus a one-day margin.
    #[instrument(skip(self), fields(operation = "prune_names"))]
    pub async fn prune_older_than(&self, capture_time: i64) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.table
            .delete_older_than(capture_time - PRUNE_SAFETY_MARGIN_MS)
            .await
    }

    /// Forgets everything; call after the backing table was reset.
    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
