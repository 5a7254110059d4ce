// Domain models shared by the agent-side transport and the collector stores.

mod aggregate;
mod agent;
mod gauge;
mod histogram;
mod log;
mod trace;

pub use aggregate::{
    Aggregate, AggregatesByType, DurationPercentiles, OverviewAggregate, SummarySortOrder,
    TransactionAggregate, TransactionSummary,
};
pub use agent::{AgentConfig, SystemInfo};
pub use gauge::{GaugeValue, weighted_average};
pub use histogram::DurationHistogram;
pub use log::{LogEvent, LogLevel};
pub use trace::{Trace, TraceAttribute, TraceEntry, TraceHeader};

/// Latest accepted capture time: 9999-12-31T23:59:59.999Z in epoch millis.
pub const MAX_CAPTURE_TIME: i64 = 253_402_300_799_999;

/// Upper bound for a single transaction count, error count or gauge weight.
pub const MAX_COUNT: i64 = 1 << 40;

pub fn validate_capture_time(capture_time: i64) -> Result<(), String> {
    if capture_time <= 0 || capture_time > MAX_CAPTURE_TIME {
        return Err(format!(
            "capture time must be in 1..={MAX_CAPTURE_TIME}, got {capture_time}"
        ));
    }
    Ok(())
}
