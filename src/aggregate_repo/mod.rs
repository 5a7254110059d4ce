// Transaction aggregates: raw ingestion at level 0, bucketed rollups above it.
// Rows are keyed by (level, agent rollup, type, name, capture time) and written with upserts,
// so redelivered batches and recomputed buckets converge to the same state.

pub mod aggregation;
pub mod summary;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::TryStreamExt;
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use crate::agent_rollup::AgentRollupId;
use crate::blob_store::{
    self, BlobStore, BlobToken, SqliteBlobStore, decode_histogram, encode_histogram,
    put_retrying_once,
};
use crate::error::StoreResult;
use crate::models::{
    Aggregate, AggregatesByType, DurationPercentiles, OverviewAggregate, SummarySortOrder,
    TransactionSummary,
};
use crate::rollup_pending::{self, PendingBucket, RollupKind};
use crate::rollup_schedule::RollupSchedule;

use aggregation::{BucketAccumulator, BucketSource, SourceRow};
pub use summary::{SummaryQuery, TransactionSummaryCollector};

const OVERALL: &str = "";

pub struct AggregateRepo<B = SqliteBlobStore> {
    pool: SqlitePool,
    blobs: Arc<B>,
    schedule: Arc<RollupSchedule>,
}

impl<B: BlobStore> AggregateRepo<B> {
    pub fn new(pool: SqlitePool, blobs: Arc<B>, schedule: Arc<RollupSchedule>) -> Self {
        Self {
            pool,
            blobs,
            schedule,
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        aggregation::init_aggregate_table(&self.pool).await?;
        rollup_pending::init(&self.pool).await?;
        Ok(())
    }

    pub fn schedule(&self) -> &RollupSchedule {
        &self.schedule
    }

    /// Writes one level-0 row per transaction type (overall) and per transaction name.
    /// Histograms and shared query texts go to the blob store; rows keep the tokens.
    #[instrument(
        skip(self, agent_rollup, aggregates_by_type, shared_query_texts),
        fields(repo = "aggregate", operation = "store", agent_rollup = %agent_rollup)
    )]
    pub async fn store(
        &self,
        agent_rollup: &AgentRollupId,
        capture_time: i64,
        aggregates_by_type: &[AggregatesByType],
        shared_query_texts: &[String],
    ) -> StoreResult<()> {
        if aggregates_by_type.is_empty() {
            return Ok(());
        }
        let query_texts = if shared_query_texts.is_empty() {
            None
        } else {
            let bytes = blob_store::encode_query_texts(&shared_query_texts.to_vec())?;
            Some(put_retrying_once(&*self.blobs, bytes).await?)
        };

        let mut rows = Vec::new();
        for by_type in aggregates_by_type {
            rows.push(
                self.prepare_row(&by_type.transaction_type, OVERALL, &by_type.overall, query_texts)
                    .await?,
            );
            for t in &by_type.transactions {
                rows.push(
                    self.prepare_row(
                        &by_type.transaction_type,
                        &t.transaction_name,
                        &t.aggregate,
                        query_texts,
                    )
                    .await?,
                );
            }
        }

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            upsert_row(&mut *tx, 0, agent_rollup, capture_time, row).await?;
        }
        if let Some(level) = self.schedule.level(1) {
            rollup_pending::mark(
                &mut *tx,
                RollupKind::Aggregate,
                1,
                agent_rollup,
                level.bucket_end(capture_time),
            )
            .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "aggregates stored");
        Ok(())
    }

    async fn prepare_row(
        &self,
        transaction_type: &str,
        transaction_name: &str,
        aggregate: &Aggregate,
        query_texts: Option<BlobToken>,
    ) -> StoreResult<SourceRow> {
        let histogram =
            put_retrying_once(&*self.blobs, encode_histogram(&aggregate.duration_histogram)?)
                .await?;
        Ok(SourceRow {
            transaction_type: transaction_type.to_string(),
            transaction_name: transaction_name.to_string(),
            total_duration_nanos: aggregate.total_duration_nanos,
            error_count: aggregate.error_count,
            transaction_count: aggregate.transaction_count,
            histogram,
            query_texts,
        })
    }

    pub async fn rollup(
        &self,
        agent_rollup: &AgentRollupId,
        parent: Option<&AgentRollupId>,
        leaf: bool,
    ) -> StoreResult<usize> {
        self.rollup_at(agent_rollup, parent, leaf, crate::db::now_millis())
            .await
    }

    /// Recomputes every marked bucket whose end is at or before `now`, level by level.
    /// A leaf reads its own level below; a grouping reads its direct children's rows at
    /// the same level. Returns the number of rows written.
    #[instrument(
        skip(self, agent_rollup, parent),
        fields(repo = "aggregate", operation = "rollup", agent_rollup = %agent_rollup)
    )]
    pub async fn rollup_at(
        &self,
        agent_rollup: &AgentRollupId,
        parent: Option<&AgentRollupId>,
        leaf: bool,
        now: i64,
    ) -> StoreResult<usize> {
        let mut written = 0;
        for level in self.schedule.rollup_levels() {
            let due =
                rollup_pending::due(&self.pool, RollupKind::Aggregate, level.index, agent_rollup, now)
                    .await?;
            for pending in due {
                let from = pending.bucket_end - level.capture_interval_millis;
                let source = if leaf {
                    self.read_own_rows(level.index - 1, agent_rollup, from, pending.bucket_end)
                        .await?
                } else {
                    self.read_child_rows(level.index, agent_rollup, from, pending.bucket_end)
                        .await?
                };
                written += self
                    .write_bucket(level.index, agent_rollup, parent, leaf, pending, source)
                    .await?;
            }
        }
        if written > 0 {
            debug!(rows = written, "rollup complete");
        }
        Ok(written)
    }

    async fn read_own_rows(
        &self,
        rollup_level: usize,
        agent_rollup: &AgentRollupId,
        from: i64,
        to: i64,
    ) -> StoreResult<BucketSource> {
        let rows = sqlx::query(
            r#"
            SELECT transaction_type, transaction_name, total_duration_nanos, error_count,
                   transaction_count, histogram_blob, query_texts_blob
            FROM aggregate
            WHERE rollup_level = $1 AND agent_rollup = $2 AND capture_time > $3 AND capture_time <= $4
            ORDER BY capture_time ASC, rowid ASC
            "#,
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        let rows = rows.iter().map(parse_source_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(rows.into())
    }

    async fn read_child_rows(
        &self,
        rollup_level: usize,
        parent: &AgentRollupId,
        from: i64,
        to: i64,
    ) -> StoreResult<BucketSource> {
        let sql = format!(
            r#"
            SELECT transaction_type, transaction_name, total_duration_nanos, error_count,
                   transaction_count, histogram_blob, query_texts_blob
            FROM aggregate
            WHERE rollup_level = $1 AND {} AND capture_time > $3 AND capture_time <= $4
            ORDER BY capture_time ASC, agent_rollup ASC, rowid ASC
            "#,
            rollup_pending::direct_child_predicate("agent_rollup", "$2")
        );
        let rows = sqlx::query(&sql)
            .bind(rollup_level as i64)
            .bind(parent.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        let rows = rows.iter().map(parse_source_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(rows.into())
    }

    /// Replaces the bucket ending at `pending.bucket_end` with the folded source, or deletes
    /// it when the source is empty. Marks the next level and the parent when anything changed.
    async fn write_bucket(
        &self,
        rollup_level: usize,
        agent_rollup: &AgentRollupId,
        parent: Option<&AgentRollupId>,
        leaf: bool,
        pending: PendingBucket,
        source: BucketSource,
    ) -> StoreResult<usize> {
        let rows = match source {
            BucketSource::Empty => Vec::new(),
            BucketSource::Rows(rows) => self.fold(rows).await?,
        };
        let bucket_end = pending.bucket_end;

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM aggregate WHERE rollup_level = $1 AND agent_rollup = $2 AND capture_time = $3",
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(bucket_end)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        for row in &rows {
            upsert_row(&mut *tx, rollup_level, agent_rollup, bucket_end, row).await?;
        }
        if !rows.is_empty() || deleted > 0 {
            if leaf && let Some(next) = self.schedule.level(rollup_level + 1) {
                rollup_pending::mark(
                    &mut *tx,
                    RollupKind::Aggregate,
                    next.index,
                    agent_rollup,
                    next.bucket_end(bucket_end),
                )
                .await?;
            }
            if let Some(parent) = parent {
                rollup_pending::mark(
                    &mut *tx,
                    RollupKind::Aggregate,
                    rollup_level,
                    parent,
                    bucket_end,
                )
                .await?;
            }
        }
        rollup_pending::clear(
            &mut *tx,
            RollupKind::Aggregate,
            rollup_level,
            agent_rollup,
            pending,
        )
        .await?;
        tx.commit().await?;
        Ok(rows.len())
    }

    /// Sums source rows per transaction, merging histograms and query texts into new blobs.
    async fn fold(&self, rows: Vec<SourceRow>) -> StoreResult<Vec<SourceRow>> {
        let mut acc = BucketAccumulator::new();
        for row in &rows {
            let histogram = decode_histogram(&self.blobs.get(row.histogram).await?)?;
            acc.add(row, &histogram);
        }

        let mut merged_texts: HashMap<Vec<BlobToken>, Option<BlobToken>> = HashMap::new();
        let mut out = Vec::new();
        for rolled in acc.into_rows() {
            let histogram =
                put_retrying_once(&*self.blobs, encode_histogram(&rolled.histogram)?).await?;
            let query_texts = match merged_texts.get(&rolled.query_texts) {
                Some(token) => *token,
                None => {
                    let token = self.merge_query_texts(&rolled.query_texts).await?;
                    merged_texts.insert(rolled.query_texts.clone(), token);
                    token
                }
            };
            out.push(SourceRow {
                transaction_type: rolled.transaction_type,
                transaction_name: rolled.transaction_name,
                total_duration_nanos: rolled.total_duration_nanos,
                error_count: rolled.error_count,
                transaction_count: rolled.transaction_count,
                histogram,
                query_texts,
            });
        }
        Ok(out)
    }

    async fn merge_query_texts(&self, tokens: &[BlobToken]) -> StoreResult<Option<BlobToken>> {
        match tokens {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            _ => {
                let mut texts = Vec::new();
                for token in tokens {
                    let bytes = self.blobs.get(*token).await?;
                    aggregation::union_query_texts(
                        &mut texts,
                        blob_store::decode_query_texts(&bytes)?,
                    );
                }
                let bytes = blob_store::encode_query_texts(&texts)?;
                Ok(Some(put_retrying_once(&*self.blobs, bytes).await?))
            }
        }
    }

    /// Overall rows of one transaction type, ascending by capture time, with percentiles.
    #[instrument(
        skip(self, agent_rollup),
        fields(repo = "aggregate", operation = "read_overview_aggregates", agent_rollup = %agent_rollup)
    )]
    pub async fn read_overview_aggregates(
        &self,
        agent_rollup: &AgentRollupId,
        transaction_type: &str,
        from: i64,
        to: i64,
        rollup_level: usize,
    ) -> StoreResult<Vec<OverviewAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT capture_time, total_duration_nanos, transaction_count, error_count, histogram_blob
            FROM aggregate
            WHERE rollup_level = $1 AND agent_rollup = $2 AND transaction_type = $3
              AND transaction_name = '' AND capture_time > $4 AND capture_time <= $5
            ORDER BY capture_time ASC
            "#,
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(transaction_type)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let token = BlobToken(row.try_get("histogram_blob")?);
            let histogram = decode_histogram(&self.blobs.get(token).await?)?;
            out.push(OverviewAggregate {
                capture_time: row.try_get("capture_time")?,
                total_duration_nanos: row.try_get("total_duration_nanos")?,
                transaction_count: row.try_get("transaction_count")?,
                error_count: row.try_get("error_count")?,
                percentiles: DurationPercentiles::from_histogram(&histogram),
            });
        }
        Ok(out)
    }

    /// Streams per-transaction rows matching `query` into `collector`.
    #[instrument(
        skip(self, collector, query),
        fields(repo = "aggregate", operation = "merge_in_transaction_summaries", agent_rollup = %query.agent_rollup)
    )]
    pub async fn merge_in_transaction_summaries(
        &self,
        collector: &mut TransactionSummaryCollector,
        query: &SummaryQuery,
    ) -> StoreResult<()> {
        let mut rows = sqlx::query(
            r#"
            SELECT transaction_name, total_duration_nanos, transaction_count
            FROM aggregate
            WHERE rollup_level = $1 AND agent_rollup = $2 AND transaction_type = $3
              AND transaction_name != '' AND capture_time > $4 AND capture_time <= $5
            ORDER BY capture_time ASC, rowid ASC
            "#,
        )
        .bind(query.rollup_level as i64)
        .bind(query.agent_rollup.as_str())
        .bind(&query.transaction_type)
        .bind(query.from)
        .bind(query.to)
        .fetch(&self.pool);

        while let Some(row) = rows.try_next().await? {
            let name: String = row.try_get("transaction_name")?;
            collector.collect(
                &name,
                row.try_get("total_duration_nanos")?,
                row.try_get("transaction_count")?,
            );
        }
        Ok(())
    }

    pub async fn merge_transaction_summaries(
        &self,
        query: &SummaryQuery,
        sort_order: SummarySortOrder,
        top_n: usize,
    ) -> StoreResult<Vec<TransactionSummary>> {
        let mut collector = TransactionSummaryCollector::new();
        self.merge_in_transaction_summaries(&mut collector, query)
            .await?;
        Ok(collector.get_result(sort_order, top_n))
    }

    /// Distinct transaction types recorded for an agent rollup at `rollup_level`.
    pub async fn read_transaction_types(
        &self,
        agent_rollup: &AgentRollupId,
        rollup_level: usize,
    ) -> StoreResult<Vec<String>> {
        let types = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT transaction_type FROM aggregate
            WHERE rollup_level = $1 AND agent_rollup = $2 ORDER BY transaction_type
            "#,
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    /// Deletes rows older than each level's horizon. Levels that never expire are skipped.
    #[instrument(skip(self), fields(repo = "aggregate", operation = "prune_expired"))]
    pub async fn prune_expired(&self, now: i64) -> StoreResult<u64> {
        let mut deleted = 0;
        for level in self.schedule.levels() {
            let Some(expiration) = level.expiration_millis() else {
                continue;
            };
            let cutoff = now - expiration;
            let r = sqlx::query("DELETE FROM aggregate WHERE rollup_level = $1 AND capture_time < $2")
                .bind(level.index as i64)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            deleted += r.rows_affected();
            rollup_pending::prune_older_than(&self.pool, RollupKind::Aggregate, level.index, cutoff)
                .await?;
        }
        Ok(deleted)
    }

    pub async fn pending_rollups(&self) -> StoreResult<i64> {
        rollup_pending::count(&self.pool, RollupKind::Aggregate).await
    }
}

async fn upsert_row<'e, E>(
    executor: E,
    rollup_level: usize,
    agent_rollup: &AgentRollupId,
    capture_time: i64,
    row: &SourceRow,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO aggregate
        (rollup_level, agent_rollup, transaction_type, transaction_name, capture_time,
         total_duration_nanos, error_count, transaction_count, histogram_blob, query_texts_blob)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT(rollup_level, agent_rollup, transaction_type, transaction_name, capture_time)
        DO UPDATE SET
            total_duration_nanos = excluded.total_duration_nanos,
            error_count = excluded.error_count,
            transaction_count = excluded.transaction_count,
            histogram_blob = excluded.histogram_blob,
            query_texts_blob = excluded.query_texts_blob
        "#,
    )
    .bind(rollup_level as i64)
    .bind(agent_rollup.as_str())
    .bind(&row.transaction_type)
    .bind(&row.transaction_name)
    .bind(capture_time)
    .bind(row.total_duration_nanos)
    .bind(row.error_count)
    .bind(row.transaction_count)
    .bind(row.histogram.0)
    .bind(row.query_texts.map(|t| t.0))
    .execute(executor)
    .await?;
    Ok(())
}

fn parse_source_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SourceRow> {
    let query_texts: Option<i64> = row.try_get("query_texts_blob")?;
    Ok(SourceRow {
        transaction_type: row.try_get("transaction_type")?,
        transaction_name: row.try_get("transaction_name")?,
        total_duration_nanos: row.try_get("total_duration_nanos")?,
        error_count: row.try_get("error_count")?,
        transaction_count: row.try_get("transaction_count")?,
        histogram: BlobToken(row.try_get("histogram_blob")?),
        query_texts: query_texts.map(BlobToken),
    })
}
