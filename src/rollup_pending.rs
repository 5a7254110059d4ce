// Pending-rollup markers: one row per (kind, level, agent rollup, bucket end) that needs
// recomputing. Re-marking bumps the generation, so a rollup that read an older generation
// does not clear a marker set while it was working.

use sqlx::{Sqlite, SqlitePool};

use crate::agent_rollup::AgentRollupId;
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupKind {
    Aggregate,
    Gauge,
}

impl RollupKind {
    fn as_str(self) -> &'static str {
        match self {
            RollupKind::Aggregate => "aggregate",
            RollupKind::Gauge => "gauge",
        }
    }
}

/// A due bucket, identified by its end time, and the marker generation that was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBucket {
    pub bucket_end: i64,
    pub generation: i64,
}

pub async fn init(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rollup_pending (
            kind TEXT NOT NULL,
            rollup_level INTEGER NOT NULL,
            agent_rollup TEXT NOT NULL,
            bucket_end INTEGER NOT NULL,
            generation INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (kind, rollup_level, agent_rollup, bucket_end)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark<'e, E>(
    executor: E,
    kind: RollupKind,
    rollup_level: usize,
    agent_rollup: &AgentRollupId,
    bucket_end: i64,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO rollup_pending (kind, rollup_level, agent_rollup, bucket_end)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT(kind, rollup_level, agent_rollup, bucket_end)
        DO UPDATE SET generation = generation + 1
        "#,
    )
    .bind(kind.as_str())
    .bind(rollup_level as i64)
    .bind(agent_rollup.as_str())
    .bind(bucket_end)
    .execute(executor)
    .await?;
    Ok(())
}

/// Buckets whose end is at or before `now`, oldest first.
pub async fn due(
    pool: &SqlitePool,
    kind: RollupKind,
    rollup_level: usize,
    agent_rollup: &AgentRollupId,
    now: i64,
) -> StoreResult<Vec<PendingBucket>> {
    let rows = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT bucket_end, generation FROM rollup_pending
        WHERE kind = $1 AND rollup_level = $2 AND agent_rollup = $3 AND bucket_end <= $4
        ORDER BY bucket_end ASC
        "#,
    )
    .bind(kind.as_str())
    .bind(rollup_level as i64)
    .bind(agent_rollup.as_str())
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(bucket_end, generation)| PendingBucket {
            bucket_end,
            generation,
        })
        .collect())
}

/// Clears the marker unless it was re-marked after `pending` was read.
pub async fn clear<'e, E>(
    executor: E,
    kind: RollupKind,
    rollup_level: usize,
    agent_rollup: &AgentRollupId,
    pending: PendingBucket,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        DELETE FROM rollup_pending
        WHERE kind = $1 AND rollup_level = $2 AND agent_rollup = $3 AND bucket_end = $4
          AND generation = $5
        "#,
    )
    .bind(kind.as_str())
    .bind(rollup_level as i64)
    .bind(agent_rollup.as_str())
    .bind(pending.bucket_end)
    .bind(pending.generation)
    .execute(executor)
    .await?;
    Ok(())
}

/// Drops markers for buckets that already fell out of the level's retention.
pub async fn prune_older_than(
    pool: &SqlitePool,
    kind: RollupKind,
    rollup_level: usize,
    cutoff: i64,
) -> StoreResult<u64> {
    let r = sqlx::query(
        "DELETE FROM rollup_pending WHERE kind = $1 AND rollup_level = $2 AND bucket_end < $3",
    )
    .bind(kind.as_str())
    .bind(rollup_level as i64)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(r.rows_affected())
}

/// Number of markers still waiting, for tests and diagnostics.
pub async fn count(pool: &SqlitePool, kind: RollupKind) -> StoreResult<i64> {
    let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM rollup_pending WHERE kind = $1")
        .bind(kind.as_str())
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// SQL predicate selecting direct children of the agent rollup bound at `$param`.
pub(crate) fn direct_child_predicate(column: &str, param: &str) -> String {
    format!(
        "(substr({column}, 1, length({param}) + 1) = {param} || '/' \
         AND instr(substr({column}, length({param}) + 2), '/') = 0)"
    )
}
