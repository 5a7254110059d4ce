// Transaction aggregates: wire shape sent by agents, and the query-side summaries.

use serde::{Deserialize, Serialize};

use super::{DurationHistogram, MAX_COUNT};

/// Measurements for one transaction name (or the overall row) over one capture interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub total_duration_nanos: f64,
    pub error_count: i64,
    pub transaction_count: i64,
    #[serde(default)]
    pub duration_histogram: DurationHistogram,
}

impl Aggregate {
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_count < 0 || self.error_count < 0 {
            return Err(format!(
                "negative counts (transactions {}, errors {})",
                self.transaction_count, self.error_count
            ));
        }
        if self.transaction_count > MAX_COUNT {
            return Err(format!(
                "transaction count {} exceeds {MAX_COUNT}",
                self.transaction_count
            ));
        }
        if self.error_count > self.transaction_count {
            return Err(format!(
                "error count {} exceeds transaction count {}",
                self.error_count, self.transaction_count
            ));
        }
        if !self.total_duration_nanos.is_finite() || self.total_duration_nanos < 0.0 {
            return Err(format!(
                "invalid total duration {}",
                self.total_duration_nanos
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAggregate {
    pub transaction_name: String,
    pub aggregate: Aggregate,
}

/// All aggregates of one transaction type for one capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatesByType {
    pub transaction_type: String,
    pub overall: Aggregate,
    #[serde(default)]
    pub transactions: Vec<TransactionAggregate>,
}

impl AggregatesByType {
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_type.trim().is_empty() {
            return Err("empty transaction type".into());
        }
        self.overall
            .validate()
            .map_err(|e| format!("{} overall: {e}", self.transaction_type))?;
        for t in &self.transactions {
            if t.transaction_name.is_empty() {
                return Err(format!(
                    "{}: empty transaction name is reserved for the overall row",
                    self.transaction_type
                ));
            }
            t.aggregate
                .validate()
                .map_err(|e| format!("{} {}: {e}", self.transaction_type, t.transaction_name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationPercentiles {
    pub p50_nanos: u64,
    pub p95_nanos: u64,
    pub p99_nanos: u64,
}

impl DurationPercentiles {
    pub fn from_histogram(h: &DurationHistogram) -> Self {
        Self {
            p50_nanos: h.value_at_percentile(50.0),
            p95_nanos: h.value_at_percentile(95.0),
            p99_nanos: h.value_at_percentile(99.0),
        }
    }
}

/// One overall row of a time series, as served to the query front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewAggregate {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: i64,
    pub error_count: i64,
    pub percentiles: DurationPercentiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub transaction_name: String,
    pub total_duration_nanos: f64,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummarySortOrder {
    #[default]
    TotalTime,
    TransactionCount,
}
