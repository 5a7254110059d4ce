// Query-time merge of per-transaction totals into a top-N list.

use std::collections::HashMap;

use serde::Deserialize;

use crate::agent_rollup::AgentRollupId;
use crate::models::{SummarySortOrder, TransactionSummary};

/// Rows with `from < capture_time <= to` at `rollup_level`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub agent_rollup: AgentRollupId,
    pub transaction_type: String,
    pub from: i64,
    pub to: i64,
    pub rollup_level: usize,
}

/// Accumulates `(total duration, count)` per transaction name across many rows.
#[derive(Debug, Default)]
pub struct TransactionSummaryCollector {
    summaries: Vec<TransactionSummary>,
    index: HashMap<String, usize>,
}

impl TransactionSummaryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, transaction_name: &str, total_duration_nanos: f64, transaction_count: i64) {
        match self.index.get(transaction_name) {
            Some(&idx) => {
                let s = &mut self.summaries[idx];
                s.total_duration_nanos += total_duration_nanos;
                s.transaction_count = s.transaction_count.saturating_add(transaction_count);
            }
            None => {
                self.index
                    .insert(transaction_name.to_string(), self.summaries.len());
                self.summaries.push(TransactionSummary {
                    transaction_name: transaction_name.to_string(),
                    total_duration_nanos,
                    transaction_count,
                });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// Top `top_n` names, descending by the sort key; equal keys keep first-seen order.
    pub fn get_result(&self, sort_order: SummarySortOrder, top_n: usize) -> Vec<TransactionSummary> {
        let mut out = self.summaries.clone();
        // sort_by is stable
        match sort_order {
            SummarySortOrder::TotalTime => {
                out.sort_by(|a, b| b.total_duration_nanos.total_cmp(&a.total_duration_nanos))
            }
            SummarySortOrder::TransactionCount => {
                out.sort_by(|a, b| b.transaction_count.cmp(&a.transaction_count))
            }
        }
        out.truncate(top_n);
        out
    }
}
