// Log-linear duration histogram (nanoseconds). Mergeable by count addition,
// so rolled-up buckets keep exact counts and approximate percentiles.

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Values below this are counted exactly, one bucket per value.
const LINEAR_LIMIT: u64 = 16;
/// Sub-buckets per power of two above the linear range.
const SUB_BUCKET_BITS: u32 = 3;
const SUB_BUCKETS: u64 = 1 << SUB_BUCKET_BITS;
const FIRST_EXPONENT: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct DurationHistogram {
    /// Dense counts indexed by bucket; trailing empty buckets are not stored.
    pub counts: Vec<u64>,
}

fn bucket_index(nanos: u64) -> usize {
    if nanos < LINEAR_LIMIT {
        return nanos as usize;
    }
    let exponent = 63 - nanos.leading_zeros();
    let sub = (nanos >> (exponent - SUB_BUCKET_BITS)) & (SUB_BUCKETS - 1);
    (LINEAR_LIMIT + u64::from(exponent - FIRST_EXPONENT) * SUB_BUCKETS + sub) as usize
}

/// Smallest value that lands in `index`, or `None` past the representable range.
fn bucket_low(index: usize) -> Option<u64> {
    let index = index as u64;
    if index < LINEAR_LIMIT {
        return Some(index);
    }
    let offset = index - LINEAR_LIMIT;
    let exponent = (offset / SUB_BUCKETS) as u32 + FIRST_EXPONENT;
    let sub = offset % SUB_BUCKETS;
    if exponent > 63 {
        return None;
    }
    (SUB_BUCKETS + sub).checked_mul(1u64 << (exponent - SUB_BUCKET_BITS))
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, nanos: u64) {
        self.record_n(nanos, 1);
    }

    pub fn record_n(&mut self, nanos: u64, count: u64) {
        let idx = bucket_index(nanos);
        if self.counts.len() <= idx {
            self.counts.resize(idx + 1, 0);
        }
        self.counts[idx] = self.counts[idx].saturating_add(count);
    }

    pub fn merge(&mut self, other: &DurationHistogram) {
        if self.counts.len() < other.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine = mine.saturating_add(*theirs);
        }
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Upper bound of the bucket holding the `percentile`-th value (0..=100).
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        let total = self.total_count();
        if total == 0 {
            return 0;
        }
        let p = percentile.clamp(0.0, 100.0);
        let target = ((total as f64) * p / 100.0).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (idx, count) in self.counts.iter().enumerate() {
            seen = seen.saturating_add(*count);
            if seen >= target {
                return bucket_low(idx + 1).map_or(u64::MAX, |next| next - 1);
            }
        }
        u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_bounds_are_contiguous() {
        for idx in 0..400 {
            let low = bucket_low(idx).unwrap();
            let next = bucket_low(idx + 1).unwrap();
            assert!(next > low, "bucket {idx}");
            assert_eq!(bucket_index(low), idx);
            assert_eq!(bucket_index(next - 1), idx);
        }
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = DurationHistogram::new();
        a.record(100_000);
        a.record(100_000);
        let mut b = DurationHistogram::new();
        b.record(5_000_000);
        a.merge(&b);
        assert_eq!(a.total_count(), 3);
        assert!(a.value_at_percentile(50.0) < 200_000);
        assert!(a.value_at_percentile(100.0) >= 5_000_000);
    }

    #[test]
    fn counts_saturate() {
        let mut a = DurationHistogram::new();
        a.record_n(1_000, u64::MAX);
        a.record_n(1_000, 1);
        let mut b = DurationHistogram::new();
        b.record_n(5_000_000, u64::MAX);
        a.merge(&b);
        assert_eq!(a.total_count(), u64::MAX);
        assert!(a.value_at_percentile(100.0) >= 1_000);
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(DurationHistogram::new().value_at_percentile(99.0), 0);
    }

    #[test]
    fn small_values_are_exact() {
        let mut h = DurationHistogram::new();
        h.record(7);
        assert_eq!(h.value_at_percentile(50.0), 7);
    }
}
