// Gauge samples. Weight counts the raw samples folded into `value`.

use serde::{Deserialize, Serialize};

use super::MAX_COUNT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaugeValue {
    pub gauge_name: String,
    pub capture_time: i64,
    pub value: f64,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

impl GaugeValue {
    pub fn validate(&self) -> Result<(), String> {
        if self.gauge_name.trim().is_empty() {
            return Err("empty gauge name".into());
        }
        if self.weight <= 0 || self.weight > MAX_COUNT {
            return Err(format!(
                "gauge {}: weight must be in 1..={MAX_COUNT}, got {}",
                self.gauge_name, self.weight
            ));
        }
        if !self.value.is_finite() {
            return Err(format!("gauge {}: non-finite value", self.gauge_name));
        }
        Ok(())
    }
}

/// Weighted average of `(value, weight)` pairs: `(Σ value·weight / Σ weight, Σ weight)`.
/// Computed as a running mean; the total weight saturates.
/// `None` when there is nothing to fold.
pub fn weighted_average<I>(samples: I) -> Option<(f64, i64)>
where
    I: IntoIterator<Item = (f64, i64)>,
{
    let mut mean = 0.0;
    let mut seen = 0.0;
    let mut total_weight = 0i64;
    for (value, weight) in samples {
        if weight <= 0 {
            continue;
        }
        seen += weight as f64;
        mean += (value - mean) * (weight as f64 / seen);
        total_weight = total_weight.saturating_add(weight);
    }
    if total_weight == 0 {
        return None;
    }
    Some((mean, total_weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_keep_value_and_sum_weight() {
        assert_eq!(
            weighted_average([(500.0, 1), (500.0, 1)]),
            Some((500.0, 2))
        );
    }

    #[test]
    fn heavier_samples_dominate() {
        let (value, weight) = weighted_average([(100.0, 3), (500.0, 1)]).unwrap();
        assert_eq!(weight, 4);
        assert_eq!(value, 200.0);
    }

    #[test]
    fn huge_weights_saturate_instead_of_overflowing() {
        let (value, weight) = weighted_average([(7.0, i64::MAX), (7.0, i64::MAX)]).unwrap();
        assert_eq!(value, 7.0);
        assert_eq!(weight, i64::MAX);
    }

    #[test]
    fn weight_above_cap_is_invalid() {
        let g = GaugeValue {
            gauge_name: "heap".into(),
            capture_time: 1,
            value: 1.0,
            weight: MAX_COUNT + 1,
        };
        assert!(g.validate().is_err());
    }

    #[test]
    fn nothing_to_fold() {
        assert_eq!(weighted_average(std::iter::empty()), None);
    }
}
