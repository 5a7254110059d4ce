// Rollup levels: level 0 is raw, each higher level buckets the one below it.
// Pure data; validated once at load time.

use serde::Deserialize;
use thiserror::Error;

/// Expiration value that disables pruning for a level.
pub const NEVER_EXPIRE_HOURS: u32 = u32::MAX;

const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RollupLevelConfig {
    pub capture_interval_millis: i64,
    /// Longest query range this level should serve; 0 = any range.
    #[serde(default)]
    pub view_threshold_millis: i64,
    pub expiration_hours: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupLevel {
    pub index: usize,
    pub capture_interval_millis: i64,
    pub view_threshold_millis: i64,
    pub expiration_hours: u32,
}

impl RollupLevel {
    /// Retention horizon, or `None` when the level never expires.
    pub fn expiration_millis(&self) -> Option<i64> {
        if self.expiration_hours == NEVER_EXPIRE_HOURS {
            None
        } else {
            Some(i64::from(self.expiration_hours) * MS_PER_HOUR)
        }
    }

    /// End of the bucket containing `capture_time`. Buckets are `(end - interval, end]`.
    /// Saturates at `i64::MAX` for a bucket that would end past the representable range.
    pub fn bucket_end(&self, capture_time: i64) -> i64 {
        let interval = self.capture_interval_millis;
        if capture_time.rem_euclid(interval) == 0 {
            return capture_time;
        }
        (capture_time.div_euclid(interval) + 1).saturating_mul(interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("rollup schedule needs at least one level")]
    Empty,
    #[error("rollup level {index}: capture interval must be > 0, got {interval}")]
    NonPositiveInterval { index: usize, interval: i64 },
    #[error("rollup level {index}: capture interval {interval} must be greater than {previous}")]
    NotIncreasing {
        index: usize,
        interval: i64,
        previous: i64,
    },
    #[error("rollup level {index}: capture interval {interval} must be a multiple of {previous}")]
    NotMultiple {
        index: usize,
        interval: i64,
        previous: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupSchedule {
    levels: Vec<RollupLevel>,
}

impl RollupSchedule {
    pub fn new(configs: &[RollupLevelConfig]) -> Result<Self, ScheduleError> {
        if configs.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut levels: Vec<RollupLevel> = Vec::with_capacity(configs.len());
        for (index, c) in configs.iter().enumerate() {
            let interval = c.capture_interval_millis;
            if interval <= 0 {
                return Err(ScheduleError::NonPositiveInterval { index, interval });
            }
            if let Some(prev) = levels.last() {
                let previous = prev.capture_interval_millis;
                if interval <= previous {
                    return Err(ScheduleError::NotIncreasing {
                        index,
                        interval,
                        previous,
                    });
                }
                // a coarser bucket must cover whole finer buckets
                if interval % previous != 0 {
                    return Err(ScheduleError::NotMultiple {
                        index,
                        interval,
                        previous,
                    });
                }
            }
            levels.push(RollupLevel {
                index,
                capture_interval_millis: interval,
                view_threshold_millis: c.view_threshold_millis,
                expiration_hours: c.expiration_hours,
            });
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[RollupLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&RollupLevel> {
        self.levels.get(index)
    }

    /// Levels above raw, in rollup order.
    pub fn rollup_levels(&self) -> &[RollupLevel] {
        &self.levels[1..]
    }

    pub fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn capture_interval_millis(&self, index: usize) -> Option<i64> {
        self.level(index).map(|l| l.capture_interval_millis)
    }

    pub fn expiration_millis(&self, index: usize) -> Option<i64> {
        self.level(index).and_then(RollupLevel::expiration_millis)
    }

    /// Longest finite horizon across all levels, or `None` if any level never expires.
    pub fn max_expiration_millis(&self) -> Option<i64> {
        self.levels
            .iter()
            .map(RollupLevel::expiration_millis)
            .try_fold(0i64, |acc, e| e.map(|e| acc.max(e)))
    }

    /// Finest level whose view threshold covers `to - from`; the coarsest level otherwise.
    pub fn level_for_range(&self, from: i64, to: i64) -> usize {
        let range = to.saturating_sub(from);
        self.levels
            .iter()
            .find(|l| l.view_threshold_millis == 0 || range <= l.view_threshold_millis)
            .map(|l| l.index)
            .unwrap_or_else(|| self.max_level())
    }
}

impl Default for RollupSchedule {
    fn default() -> Self {
        Self {
            levels: default_level_configs()
                .iter()
                .enumerate()
                .map(|(index, c)| RollupLevel {
                    index,
                    capture_interval_millis: c.capture_interval_millis,
                    view_threshold_millis: c.view_threshold_millis,
                    expiration_hours: c.expiration_hours,
                })
                .collect(),
        }
    }
}

/// 1 min raw (1 day), 5 min (7 days), 30 min (30 days), 4 h (90 days).
pub fn default_level_configs() -> Vec<RollupLevelConfig> {
    vec![
        RollupLevelConfig {
            capture_interval_millis: 60_000,
            view_threshold_millis: 3_600_000,
            expiration_hours: 24,
        },
        RollupLevelConfig {
            capture_interval_millis: 300_000,
            view_threshold_millis: 28_800_000,
            expiration_hours: 24 * 7,
        },
        RollupLevelConfig {
            capture_interval_millis: 1_800_000,
            view_threshold_millis: 172_800_000,
            expiration_hours: 24 * 30,
        },
        RollupLevelConfig {
            capture_interval_millis: 14_400_000,
            view_threshold_millis: 0,
            expiration_hours: 24 * 90,
        },
    ]
}
