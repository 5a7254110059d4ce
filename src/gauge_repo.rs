// Gauge samples: raw values at level 0, weighted averages above it.
// Gauge names are interned through a DedupNameCache so recurring names cost no writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use crate::agent_rollup::AgentRollupId;
use crate::error::{StoreError, StoreResult};
use crate::models::{GaugeValue, weighted_average};
use crate::name_cache::{DedupNameCache, Interned, NameTable};
use crate::name_table::SqliteNameTable;
use crate::rollup_pending::{self, PendingBucket, RollupKind};
use crate::rollup_schedule::RollupSchedule;

const GAUGE_NAME_TABLE: &str = "gauge_name";

#[derive(Debug, Clone, Copy, PartialEq)]
struct GaugeSample {
    gauge_id: i64,
    value: f64,
    weight: i64,
}

pub struct GaugeRepo {
    pool: SqlitePool,
    names: DedupNameCache<SqliteNameTable>,
    schedule: Arc<RollupSchedule>,
}

impl GaugeRepo {
    pub fn new(pool: SqlitePool, schedule: Arc<RollupSchedule>) -> Self {
        let names = DedupNameCache::new(SqliteNameTable::new(pool.clone(), GAUGE_NAME_TABLE));
        Self {
            pool,
            names,
            schedule,
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        self.names.table().init().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gauge_value (
                rollup_level INTEGER NOT NULL,
                agent_rollup TEXT NOT NULL,
                gauge_id INTEGER NOT NULL,
                capture_time INTEGER NOT NULL,
                value REAL NOT NULL,
                weight INTEGER NOT NULL,
                PRIMARY KEY (rollup_level, agent_rollup, gauge_id, capture_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_gauge_value_level_capture_time ON gauge_value(rollup_level, capture_time)",
        )
        .execute(&self.pool)
        .await?;
        rollup_pending::init(&self.pool).await?;
        Ok(())
    }

    /// Stores raw samples and marks the level-1 bucket of each sample.
    #[instrument(
        skip(self, agent_rollup, values),
        fields(repo = "gauge", operation = "store", agent_rollup = %agent_rollup, count = values.len())
    )]
    pub async fn store(&self, agent_rollup: &AgentRollupId, values: &[GaugeValue]) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(values.len());
        for v in values {
            match self.names.ensure_written(&v.gauge_name, v.capture_time).await? {
                Interned::Id(id) => ids.push(id),
                Interned::Closed => return Err(StoreError::Closed),
            }
        }
        let buckets: BTreeSet<i64> = match self.schedule.level(1) {
            Some(level) => values.iter().map(|v| level.bucket_end(v.capture_time)).collect(),
            None => BTreeSet::new(),
        };

        let mut tx = self.pool.begin().await?;
        for (v, id) in values.iter().zip(&ids) {
            upsert_value(&mut *tx, 0, agent_rollup, *id, v.capture_time, v.value, v.weight).await?;
        }
        for bucket_end in buckets {
            rollup_pending::mark(&mut *tx, RollupKind::Gauge, 1, agent_rollup, bucket_end).await?;
        }
        tx.commit().await?;
        Ok(())
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

    /// Same bucket walk as aggregates; each gauge folds to a weighted average whose weight
    /// is the sum of the source weights.
    #[instrument(
        skip(self, agent_rollup, parent),
        fields(repo = "gauge", operation = "rollup", agent_rollup = %agent_rollup)
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
                rollup_pending::due(&self.pool, RollupKind::Gauge, level.index, agent_rollup, now)
                    .await?;
            for pending in due {
                let from = pending.bucket_end - level.capture_interval_millis;
                let samples = if leaf {
                    self.read_own_samples(level.index - 1, agent_rollup, from, pending.bucket_end)
                        .await?
                } else {
                    self.read_child_samples(level.index, agent_rollup, from, pending.bucket_end)
                        .await?
                };
                written += self
                    .write_bucket(level.index, agent_rollup, parent, leaf, pending, samples)
                    .await?;
            }
        }
        if written > 0 {
            debug!(rows = written, "gauge rollup complete");
        }
        Ok(written)
    }

    async fn read_own_samples(
        &self,
        rollup_level: usize,
        agent_rollup: &AgentRollupId,
        from: i64,
        to: i64,
    ) -> StoreResult<Vec<GaugeSample>> {
        let rows = sqlx::query_as::<_, (i64, f64, i64)>(
            r#"
            SELECT gauge_id, value, weight FROM gauge_value
            WHERE rollup_level = $1 AND agent_rollup = $2 AND capture_time > $3 AND capture_time <= $4
            ORDER BY capture_time ASC
            "#,
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(sample_from_tuple).collect())
    }

    async fn read_child_samples(
        &self,
        rollup_level: usize,
        parent: &AgentRollupId,
        from: i64,
        to: i64,
    ) -> StoreResult<Vec<GaugeSample>> {
        let sql = format!(
            r#"
            SELECT gauge_id, value, weight FROM gauge_value
            WHERE rollup_level = $1 AND {} AND capture_time > $3 AND capture_time <= $4
            ORDER BY capture_time ASC, agent_rollup ASC
            "#,
            rollup_pending::direct_child_predicate("agent_rollup", "$2")
        );
        let rows = sqlx::query_as::<_, (i64, f64, i64)>(&sql)
            .bind(rollup_level as i64)
            .bind(parent.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(sample_from_tuple).collect())
    }

    async fn write_bucket(
        &self,
        rollup_level: usize,
        agent_rollup: &AgentRollupId,
        parent: Option<&AgentRollupId>,
        leaf: bool,
        pending: PendingBucket,
        samples: Vec<GaugeSample>,
    ) -> StoreResult<usize> {
        let folded = fold_samples(&samples);
        let bucket_end = pending.bucket_end;

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM gauge_value WHERE rollup_level = $1 AND agent_rollup = $2 AND capture_time = $3",
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(bucket_end)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        for s in &folded {
            upsert_value(
                &mut *tx,
                rollup_level,
                agent_rollup,
                s.gauge_id,
                bucket_end,
                s.value,
                s.weight,
            )
            .await?;
        }
        if !folded.is_empty() || deleted > 0 {
            if leaf && let Some(next) = self.schedule.level(rollup_level + 1) {
                rollup_pending::mark(
                    &mut *tx,
                    RollupKind::Gauge,
                    next.index,
                    agent_rollup,
                    next.bucket_end(bucket_end),
                )
                .await?;
            }
            if let Some(parent) = parent {
                rollup_pending::mark(&mut *tx, RollupKind::Gauge, rollup_level, parent, bucket_end)
                    .await?;
            }
        }
        rollup_pending::clear(&mut *tx, RollupKind::Gauge, rollup_level, agent_rollup, pending)
            .await?;
        tx.commit().await?;
        Ok(folded.len())
    }

    /// Samples of one gauge with `from < capture_time <= to`, ascending.
    #[instrument(
        skip(self, agent_rollup),
        fields(repo = "gauge", operation = "read_gauge_values", agent_rollup = %agent_rollup)
    )]
    pub async fn read_gauge_values(
        &self,
        agent_rollup: &AgentRollupId,
        gauge_name: &str,
        from: i64,
        to: i64,
        rollup_level: usize,
    ) -> StoreResult<Vec<GaugeValue>> {
        let gauge_id = match self.names.lookup(gauge_name).await {
            Some(id) => id,
            None => match self.names.table().find(gauge_name).await? {
                Some(id) => id,
                None => return Ok(Vec::new()),
            },
        };
        let rows = sqlx::query(
            r#"
            SELECT capture_time, value, weight FROM gauge_value
            WHERE rollup_level = $1 AND agent_rollup = $2 AND gauge_id = $3
              AND capture_time > $4 AND capture_time <= $5
            ORDER BY capture_time ASC
            "#,
        )
        .bind(rollup_level as i64)
        .bind(agent_rollup.as_str())
        .bind(gauge_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(GaugeValue {
                    gauge_name: gauge_name.to_string(),
                    capture_time: row.try_get("capture_time")?,
                    value: row.try_get("value")?,
                    weight: row.try_get("weight")?,
                })
            })
            .collect()
    }

    /// Names of gauges with stored values for `agent_rollup`.
    pub async fn read_gauge_names(&self, agent_rollup: &AgentRollupId) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(&format!(
            r#"
            SELECT DISTINCT n.key FROM gauge_value g JOIN {GAUGE_NAME_TABLE} n ON n.id = g.gauge_id
            WHERE g.agent_rollup = $1 ORDER BY n.key
            "#
        ))
        .bind(agent_rollup.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Deletes expired samples per level, then gauge names unused past the longest horizon.
    #[instrument(skip(self), fields(repo = "gauge", operation = "prune_expired"))]
    pub async fn prune_expired(&self, now: i64) -> StoreResult<u64> {
        let mut deleted = 0;
        for level in self.schedule.levels() {
            let Some(expiration) = level.expiration_millis() else {
                continue;
            };
            let cutoff = now - expiration;
            let r = sqlx::query("DELETE FROM gauge_value WHERE rollup_level = $1 AND capture_time < $2")
                .bind(level.index as i64)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            deleted += r.rows_affected();
            rollup_pending::prune_older_than(&self.pool, RollupKind::Gauge, level.index, cutoff)
                .await?;
        }
        // a level that never expires may still reference any name
        if let Some(horizon) = self.schedule.max_expiration_millis() {
            let names = self.names.prune_older_than(now - horizon).await?;
            if names > 0 {
                debug!(names, "pruned gauge names");
            }
        }
        Ok(deleted)
    }

    /// Drops every gauge sample and name. The name cache is invalidated afterwards.
    #[instrument(skip(self), fields(repo = "gauge", operation = "delete_all"))]
    pub async fn delete_all(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM gauge_value")
            .execute(&self.pool)
            .await?;
        self.names.table().delete_all().await?;
        self.names.invalidate_all().await;
        Ok(())
    }

    pub async fn pending_rollups(&self) -> StoreResult<i64> {
        rollup_pending::count(&self.pool, RollupKind::Gauge).await
    }

    pub fn close(&self) {
        self.names.close();
    }
}

fn sample_from_tuple((gauge_id, value, weight): (i64, f64, i64)) -> GaugeSample {
    GaugeSample {
        gauge_id,
        value,
        weight,
    }
}

/// One weighted average per gauge, in first-seen order.
fn fold_samples(samples: &[GaugeSample]) -> Vec<GaugeSample> {
    let mut order = Vec::new();
    let mut by_gauge: HashMap<i64, Vec<(f64, i64)>> = HashMap::new();
    for s in samples {
        by_gauge
            .entry(s.gauge_id)
            .or_insert_with(|| {
                order.push(s.gauge_id);
                Vec::new()
            })
            .push((s.value, s.weight));
    }
    order
        .into_iter()
        .filter_map(|gauge_id| {
            let inputs = by_gauge.remove(&gauge_id)?;
            let (value, weight) = weighted_average(inputs)?;
            Some(GaugeSample {
                gauge_id,
                value,
                weight,
            })
        })
        .collect()
}

async fn upsert_value<'e, E>(
    executor: E,
    rollup_level: usize,
    agent_rollup: &AgentRollupId,
    gauge_id: i64,
    capture_time: i64,
    value: f64,
    weight: i64,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO gauge_value (rollup_level, agent_rollup, gauge_id, capture_time, value, weight)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT(rollup_level, agent_rollup, gauge_id, capture_time)
        DO UPDATE SET value = excluded.value, weight = excluded.weight
        "#,
    )
    .bind(rollup_level as i64)
    .bind(agent_rollup.as_str())
    .bind(gauge_id)
    .bind(capture_time)
    .bind(value)
    .bind(weight)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(gauge_id: i64, value: f64, weight: i64) -> GaugeSample {
        GaugeSample {
            gauge_id,
            value,
            weight,
        }
    }

    #[test]
    fn folds_each_gauge_to_weighted_average() {
        let folded = fold_samples(&[
            sample(2, 500.0, 1),
            sample(1, 10.0, 3),
            sample(2, 500.0, 1),
            sample(1, 50.0, 1),
        ]);
        assert_eq!(folded, vec![sample(2, 500.0, 2), sample(1, 20.0, 4)]);
    }

    #[test]
    fn nothing_to_fold() {
        assert!(fold_samples(&[]).is_empty());
    }
}
