//! Point-wise aggregators
//!
//! These work on the samples already present and never look at the query
//! window. Text series pass through every one of them unchanged.

use super::{map_numeric, AggregationError, AggregationResult, Aggregator, FilterOp};
use crate::query::result::{MetricResult, QueryDataPoint};
use crate::types::{DataValue, TimeUnit};

/// Difference between each sample and the one before it
#[derive(Debug, Clone, Copy)]
pub struct Diff;

impl Aggregator for Diff {
    fn name(&self) -> &'static str {
        "diff"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        map_numeric(result, |points| {
            points
                .windows(2)
                .filter_map(|pair| {
                    let value = match (&pair[0].value, &pair[1].value) {
                        (DataValue::Integer(a), DataValue::Integer(b)) => {
                            DataValue::Integer(b.saturating_sub(*a))
                        }
                        (a, b) => DataValue::Double(b.as_f64()? - a.as_f64()?),
                    };
                    Some(QueryDataPoint {
                        timestamp: pair[1].timestamp,
                        value,
                    })
                })
                .collect()
        })
    }
}

/// Divide every sample by a constant
#[derive(Debug, Clone, Copy)]
pub struct Divide {
    divisor: f64,
}

impl Divide {
    pub fn new(divisor: f64) -> AggregationResult<Self> {
        if divisor == 0.0 || !divisor.is_finite() {
            return Err(AggregationError::parameter(
                "div",
                format!("divisor must be a non-zero number, got {}", divisor),
            ));
        }
        Ok(Self { divisor })
    }
}

impl Aggregator for Divide {
    fn name(&self) -> &'static str {
        "div"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        map_numeric(result, |points| scale_points(points, 1.0 / self.divisor))
    }
}

/// Multiply every sample by a constant
#[derive(Debug, Clone, Copy)]
pub struct Scale {
    factor: f64,
}

impl Scale {
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl Aggregator for Scale {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        map_numeric(result, |points| scale_points(points, self.factor))
    }
}

fn scale_points(points: &[QueryDataPoint], factor: f64) -> Vec<QueryDataPoint> {
    points
        .iter()
        .filter_map(|p| {
            Some(QueryDataPoint {
                timestamp: p.timestamp,
                value: DataValue::Double(p.value.as_f64()? * factor),
            })
        })
        .collect()
}

/// Change per `unit` between consecutive samples
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    unit: TimeUnit,
}

impl Rate {
    pub fn new(unit: TimeUnit) -> Self {
        Self { unit }
    }
}

impl Aggregator for Rate {
    fn name(&self) -> &'static str {
        "rate"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        let unit_ms = self.unit.millis() as f64;
        map_numeric(result, |points| {
            points
                .windows(2)
                .filter_map(|pair| {
                    let elapsed = pair[1].timestamp - pair[0].timestamp;
                    if elapsed <= 0 {
                        return None;
                    }
                    let delta = pair[1].value.as_f64()? - pair[0].value.as_f64()?;
                    Some(QueryDataPoint {
                        timestamp: pair[1].timestamp,
                        value: DataValue::Double(delta / elapsed as f64 * unit_ms),
                    })
                })
                .collect()
        })
    }
}

/// Drop the samples that match a threshold comparison
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    op: FilterOp,
    threshold: f64,
}

impl Filter {
    pub fn new(op: FilterOp, threshold: f64) -> Self {
        Self { op, threshold }
    }
}

impl Aggregator for Filter {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        map_numeric(result, |points| {
            points
                .iter()
                .filter(|p| {
                    p.value
                        .as_f64()
                        .map_or(true, |v| !self.op.matches(v, self.threshold))
                })
                .cloned()
                .collect()
        })
    }
}

/// Marks the result for writing back under another metric name
///
/// The stage itself leaves its input unchanged; the executor performs the
/// write once the whole pipeline has run.
#[derive(Debug, Clone)]
pub struct SaveAs {
    metric_name: String,
}

impl SaveAs {
    pub fn new(metric_name: &str) -> AggregationResult<Self> {
        if metric_name.trim().is_empty() {
            return Err(AggregationError::parameter(
                "save_as",
                "metric_name must not be empty",
            ));
        }
        Ok(Self {
            metric_name: metric_name.to_string(),
        })
    }
}

impl Aggregator for SaveAs {
    fn name(&self) -> &'static str {
        "save_as"
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        result
    }

    fn save_as(&self) -> Option<&str> {
        Some(&self.metric_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::result::MetricValueResult;

    fn result(values: Vec<QueryDataPoint>) -> MetricResult {
        let mut series = MetricValueResult::empty("m");
        series.values = values;
        MetricResult {
            sample_size: series.values.len() as u64,
            results: vec![series],
            warnings: Vec::new(),
        }
    }

    fn values(result: &MetricResult) -> &[QueryDataPoint] {
        &result.results[0].values
    }

    #[test]
    fn test_diff() {
        let out = Diff.aggregate(result(vec![
            QueryDataPoint::new(1, 5i64),
            QueryDataPoint::new(2, 8i64),
            QueryDataPoint::new(3, 6i64),
        ]));
        assert_eq!(
            values(&out),
            &[QueryDataPoint::new(2, 3i64), QueryDataPoint::new(3, -2i64)]
        );

        let out = Diff.aggregate(result(vec![
            QueryDataPoint::new(1, 1.5),
            QueryDataPoint::new(2, 2i64),
        ]));
        assert_eq!(values(&out), &[QueryDataPoint::new(2, 0.5)]);
    }

    #[test]
    fn test_div_and_scale() {
        let input = result(vec![QueryDataPoint::new(1, 10i64), QueryDataPoint::new(2, 5.0)]);

        let out = Divide::new(4.0).unwrap().aggregate(input.clone());
        assert_eq!(
            values(&out),
            &[QueryDataPoint::new(1, 2.5), QueryDataPoint::new(2, 1.25)]
        );

        let out = Scale::new(-2.0).aggregate(input);
        assert_eq!(
            values(&out),
            &[QueryDataPoint::new(1, -20.0), QueryDataPoint::new(2, -10.0)]
        );

        assert!(Divide::new(0.0).is_err());
        assert!(Divide::new(f64::NAN).is_err());
    }

    #[test]
    fn test_rate_per_unit() {
        let out = Rate::new(TimeUnit::Seconds).aggregate(result(vec![
            QueryDataPoint::new(0, 0i64),
            QueryDataPoint::new(500, 10i64),
            QueryDataPoint::new(500, 12i64),
            QueryDataPoint::new(2500, 20i64),
        ]));
        assert_eq!(
            values(&out),
            &[QueryDataPoint::new(500, 20.0), QueryDataPoint::new(2500, 4.0)]
        );
    }

    #[test]
    fn test_filter_drops_matches() {
        let input = result(vec![
            QueryDataPoint::new(1, 1.0),
            QueryDataPoint::new(2, 5.0),
            QueryDataPoint::new(3, 9.0),
        ]);

        let out = Filter::new(FilterOp::Gte, 5.0).aggregate(input.clone());
        assert_eq!(values(&out), &[QueryDataPoint::new(1, 1.0)]);

        let out = Filter::new(FilterOp::Equal, 5.0).aggregate(input);
        assert_eq!(
            values(&out),
            &[QueryDataPoint::new(1, 1.0), QueryDataPoint::new(3, 9.0)]
        );
    }

    #[test]
    fn test_text_untouched() {
        let input = result(vec![QueryDataPoint::new(1, "a"), QueryDataPoint::new(2, "b")]);
        let out = Diff.aggregate(input.clone());
        assert_eq!(out, input);
        let out = Scale::new(3.0).aggregate(input.clone());
        assert_eq!(out, input);
    }

    #[test]
    fn test_save_as_passes_through() {
        let input = result(vec![QueryDataPoint::new(1, 1.0)]);
        let stage = SaveAs::new("m.copy").unwrap();
        assert_eq!(stage.save_as(), Some("m.copy"));
        assert_eq!(stage.aggregate(input.clone()), input);
    }
}
