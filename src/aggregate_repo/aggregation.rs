// Rollup: schema for the aggregate table + pure bucket folding.
// DB access (source reads, bucket writes) stays in aggregate_repo::mod.

use std::collections::HashMap;

use sqlx::SqlitePool;

use crate::blob_store::BlobToken;
use crate::models::DurationHistogram;

/// Creates the aggregate table and its indexes if not present.
/// `transaction_name = ''` is the overall row of a transaction type.
pub async fn init_aggregate_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregate (
            rollup_level INTEGER NOT NULL,
            agent_rollup TEXT NOT NULL,
            transaction_type TEXT NOT NULL,
            transaction_name TEXT NOT NULL,
            capture_time INTEGER NOT NULL,
            total_duration_nanos REAL NOT NULL,
            error_count INTEGER NOT NULL,
            transaction_count INTEGER NOT NULL,
            histogram_blob INTEGER NOT NULL,
            query_texts_blob INTEGER,
            PRIMARY KEY (rollup_level, agent_rollup, transaction_type, transaction_name, capture_time)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_aggregate_level_capture_time ON aggregate(rollup_level, capture_time)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_aggregate_level_agent_capture_time ON aggregate(rollup_level, agent_rollup, capture_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One stored row read back as rollup input.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub transaction_type: String,
    pub transaction_name: String,
    pub total_duration_nanos: f64,
    pub error_count: i64,
    pub transaction_count: i64,
    pub histogram: BlobToken,
    pub query_texts: Option<BlobToken>,
}

/// What a bucket's source level holds.
#[derive(Debug)]
pub enum BucketSource {
    Empty,
    Rows(Vec<SourceRow>),
}

impl From<Vec<SourceRow>> for BucketSource {
    fn from(rows: Vec<SourceRow>) -> Self {
        if rows.is_empty() {
            BucketSource::Empty
        } else {
            BucketSource::Rows(rows)
        }
    }
}

/// Folded values for one `(transaction_type, transaction_name)` of a bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolledUpRow {
    pub transaction_type: String,
    pub transaction_name: String,
    pub total_duration_nanos: f64,
    pub error_count: i64,
    pub transaction_count: i64,
    pub histogram: DurationHistogram,
    /// Distinct query text blobs referenced by the source rows, first-seen order.
    pub query_texts: Vec<BlobToken>,
}

/// Sums source rows per `(transaction_type, transaction_name)`, preserving first-seen order.
#[derive(Debug, Default)]
pub struct BucketAccumulator {
    rows: Vec<RolledUpRow>,
    index: HashMap<(String, String), usize>,
}

impl BucketAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, row: &SourceRow, histogram: &DurationHistogram) {
        let key = (row.transaction_type.clone(), row.transaction_name.clone());
        let idx = match self.index.get(&key) {
            Some(idx) => *idx,
            None => {
                self.rows.push(RolledUpRow {
                    transaction_type: row.transaction_type.clone(),
                    transaction_name: row.transaction_name.clone(),
                    ..RolledUpRow::default()
                });
                self.index.insert(key, self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        let acc = &mut self.rows[idx];
        acc.total_duration_nanos += row.total_duration_nanos;
        acc.error_count = acc.error_count.saturating_add(row.error_count);
        acc.transaction_count = acc.transaction_count.saturating_add(row.transaction_count);
        acc.histogram.merge(histogram);
        if let Some(token) = row.query_texts
            && !acc.query_texts.contains(&token)
        {
            acc.query_texts.push(token);
        }
    }

    pub fn into_rows(self) -> Vec<RolledUpRow> {
        self.rows
    }
}

/// Appends `texts` to `out`, skipping ones already present.
pub fn union_query_texts(out: &mut Vec<String>, texts: Vec<String>) {
    for t in texts {
        if !out.contains(&t) {
            out.push(t);
        }
    }
}
