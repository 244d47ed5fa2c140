//! Time-bucketed (range) aggregators
//!
//! Each numeric series is cut into `sampling`-wide buckets laid out from the
//! query window's start, and every non-empty bucket collapses to one point.
//! Without `sampling` the whole window is one bucket.
//!
//! Bucket timestamps:
//! - `align_start_time`: bucket start
//! - `align_end_time`: bucket end
//! - otherwise: the first sample in the bucket
//!
//! `align_sampling` snaps the bucket grid to multiples of the sampling width
//! (epoch based), so two queries with different start times share buckets.

use super::{map_numeric, Aggregator, Alignable, AggregationError, AggregationResult, RangeSpec};
use crate::query::result::{MetricResult, QueryDataPoint};
use crate::types::{DataValue, TimeRange};

/// Reduction applied to each bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeFunction {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
    /// Sample standard deviation
    Dev,
    /// Linearly interpolated percentile, fraction in `(0, 1]`
    Percentile(f64),
}

impl RangeFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
            Self::Dev => "dev",
            Self::Percentile(_) => "percentile",
        }
    }

    /// Reduce a bucket; None when it has no numeric sample
    pub fn apply(&self, points: &[QueryDataPoint]) -> Option<DataValue> {
        let numeric: Vec<(f64, &DataValue)> = points
            .iter()
            .filter_map(|p| p.value.as_f64().map(|v| (v, &p.value)))
            .collect();
        if numeric.is_empty() {
            return None;
        }
        let values = || numeric.iter().map(|(v, _)| *v);
        let n = numeric.len() as f64;

        Some(match self {
            Self::Avg => DataValue::Double(values().sum::<f64>() / n),
            Self::Sum => DataValue::Double(values().sum()),
            Self::Count => DataValue::Integer(numeric.len() as i64),
            Self::First => numeric.first()?.1.clone(),
            Self::Last => numeric.last()?.1.clone(),
            Self::Min => numeric
                .iter()
                .min_by(|a, b| a.0.total_cmp(&b.0))?
                .1
                .clone(),
            Self::Max => numeric
                .iter()
                .max_by(|a, b| a.0.total_cmp(&b.0))?
                .1
                .clone(),
            Self::Dev => {
                if numeric.len() < 2 {
                    DataValue::Double(0.0)
                } else {
                    let mean = values().sum::<f64>() / n;
                    let variance = values().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                    DataValue::Double(variance.sqrt())
                }
            }
            Self::Percentile(p) => {
                let mut sorted: Vec<f64> = values().collect();
                sorted.sort_by(f64::total_cmp);
                let rank = p * (sorted.len() - 1) as f64;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                let v = sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64);
                DataValue::Double(v)
            }
        })
    }
}

/// Alignable aggregator that reduces each time bucket to one point
#[derive(Debug, Clone)]
pub struct RangeAggregator {
    function: RangeFunction,
    sampling_ms: Option<i64>,
    align_sampling: bool,
    align_start_time: bool,
    align_end_time: bool,
    window: Option<TimeRange>,
}

impl RangeAggregator {
    pub fn new(function: RangeFunction, spec: &RangeSpec) -> AggregationResult<Self> {
        let sampling_ms = match spec.sampling {
            Some(sampling) if sampling.millis() <= 0 => {
                return Err(AggregationError::parameter(
                    function.name(),
                    format!("sampling must be positive, got {}", sampling),
                ))
            }
            Some(sampling) => Some(sampling.millis()),
            None => None,
        };

        Ok(Self {
            function,
            sampling_ms,
            align_sampling: spec.align_sampling,
            align_start_time: spec.align_start_time,
            align_end_time: spec.align_end_time,
            window: None,
        })
    }

    pub fn function(&self) -> RangeFunction {
        self.function
    }

    fn aggregate_series(&self, points: &[QueryDataPoint]) -> Vec<QueryDataPoint> {
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            return Vec::new();
        };
        let fallback = TimeRange::try_new(
            first.timestamp.min(last.timestamp),
            first.timestamp.max(last.timestamp).saturating_add(1),
        );
        let Some(window) = self.window.or(fallback) else {
            return Vec::new();
        };

        let Some(width) = self.sampling_ms else {
            return self
                .reduce(points, window.start, window.end)
                .into_iter()
                .collect();
        };

        // Saturating: sampling may be far wider than the representable range
        let base = if self.align_sampling {
            window.start.saturating_sub(window.start.rem_euclid(width))
        } else {
            window.start
        };

        let mut out = Vec::new();
        let mut begin = 0;
        while begin < points.len() {
            let offset = points[begin].timestamp.saturating_sub(base);
            let bucket_start = base.saturating_add(offset.div_euclid(width).saturating_mul(width));
            let bucket_end = bucket_start.saturating_add(width);
            let len = points[begin..]
                .iter()
                .take_while(|p| p.timestamp < bucket_end)
                .count()
                .max(1);
            out.extend(self.reduce(&points[begin..begin + len], bucket_start, bucket_end));
            begin += len;
        }
        out
    }

    fn reduce(&self, points: &[QueryDataPoint], start: i64, end: i64) -> Option<QueryDataPoint> {
        let value = self.function.apply(points)?;
        let timestamp = if self.align_start_time {
            start
        } else if self.align_end_time {
            end
        } else {
            points.first()?.timestamp
        };
        Some(QueryDataPoint { timestamp, value })
    }
}

impl Alignable for RangeAggregator {
    fn set_window(&mut self, window: TimeRange) {
        self.window = Some(window);
    }
}

impl Aggregator for RangeAggregator {
    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn aggregate(&self, result: MetricResult) -> MetricResult {
        map_numeric(result, |points| self.aggregate_series(points))
    }

    fn alignment(&mut self) -> Option<&mut dyn Alignable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::result::MetricValueResult;
    use crate::types::{Duration, TimeUnit};

    fn points(raw: &[(i64, f64)]) -> Vec<QueryDataPoint> {
        raw.iter().map(|(t, v)| QueryDataPoint::new(*t, *v)).collect()
    }

    fn aggregator(function: RangeFunction, spec: RangeSpec, window: TimeRange) -> RangeAggregator {
        let mut agg = RangeAggregator::new(function, &spec).unwrap();
        agg.set_window(window);
        agg
    }

    #[test]
    fn test_functions() {
        let data = points(&[(1, 2.0), (2, 4.0), (3, 4.0), (4, 4.0), (5, 5.0), (6, 5.0), (7, 7.0), (8, 9.0)]);

        assert_eq!(RangeFunction::Avg.apply(&data), Some(DataValue::Double(5.0)));
        assert_eq!(RangeFunction::Sum.apply(&data), Some(DataValue::Double(40.0)));
        assert_eq!(RangeFunction::Count.apply(&data), Some(DataValue::Integer(8)));
        assert_eq!(RangeFunction::Min.apply(&data), Some(DataValue::Double(2.0)));
        assert_eq!(RangeFunction::Max.apply(&data), Some(DataValue::Double(9.0)));
        assert_eq!(RangeFunction::First.apply(&data), Some(DataValue::Double(2.0)));
        assert_eq!(RangeFunction::Last.apply(&data), Some(DataValue::Double(9.0)));
        assert_eq!(RangeFunction::Percentile(0.5).apply(&data), Some(DataValue::Double(4.5)));
        assert_eq!(RangeFunction::Percentile(1.0).apply(&data), Some(DataValue::Double(9.0)));

        let Some(DataValue::Double(dev)) = RangeFunction::Dev.apply(&data) else {
            panic!("dev should be a double");
        };
        assert!((dev - 2.138).abs() < 1e-3);

        assert_eq!(RangeFunction::Avg.apply(&[]), None);
    }

    #[test]
    fn test_min_keeps_integer_values() {
        let data = vec![QueryDataPoint::new(1, 7i64), QueryDataPoint::new(2, 3i64)];
        assert_eq!(RangeFunction::Min.apply(&data), Some(DataValue::Integer(3)));
    }

    #[test]
    fn test_sampling_buckets_from_window_start() {
        let agg = aggregator(
            RangeFunction::Sum,
            RangeSpec::sampled(Duration::new(10, TimeUnit::Milliseconds)),
            TimeRange::new(5, 100),
        );
        let out = agg.aggregate_series(&points(&[(5, 1.0), (14, 2.0), (15, 3.0), (40, 4.0)]));
        assert_eq!(out, points(&[(5, 3.0), (15, 3.0), (40, 4.0)]));
    }

    #[test]
    fn test_align_sampling_and_timestamps() {
        let spec = RangeSpec {
            sampling: Some(Duration::new(10, TimeUnit::Milliseconds)),
            align_sampling: true,
            align_start_time: true,
            align_end_time: false,
        };
        let agg = aggregator(RangeFunction::Count, spec, TimeRange::new(5, 100));
        let out = agg.aggregate_series(&points(&[(5, 1.0), (9, 1.0), (14, 1.0)]));
        assert_eq!(
            out,
            vec![QueryDataPoint::new(0, 2i64), QueryDataPoint::new(10, 1i64)]
        );

        let spec = RangeSpec {
            align_end_time: true,
            ..RangeSpec::default()
        };
        let agg = aggregator(RangeFunction::Max, spec, TimeRange::new(0, 100));
        let out = agg.aggregate_series(&points(&[(5, 1.0), (9, 3.0)]));
        assert_eq!(out, points(&[(100, 3.0)]));
    }

    #[test]
    fn test_text_series_pass_through() {
        let mut text = MetricValueResult::empty("m");
        text.values = vec![QueryDataPoint::new(1, "up"), QueryDataPoint::new(2, "down")];
        let result = MetricResult {
            sample_size: 2,
            results: vec![text.clone()],
            warnings: Vec::new(),
        };

        let agg = aggregator(RangeFunction::Count, RangeSpec::default(), TimeRange::new(0, 10));
        let out = agg.aggregate(result);
        assert_eq!(out.results[0], text);
    }

    #[test]
    fn test_sampling_wider_than_time_itself() {
        let huge = Duration::new(1_000_000_000_000_000, TimeUnit::Years);
        let data = points(&[(1000, 1.0), (2000, 2.0)]);

        let agg = aggregator(RangeFunction::Sum, RangeSpec::sampled(huge), TimeRange::new(500, 5000));
        assert_eq!(agg.aggregate_series(&data), points(&[(1000, 3.0)]));

        let spec = RangeSpec {
            sampling: Some(huge),
            align_sampling: true,
            align_start_time: true,
            align_end_time: false,
        };
        let agg = aggregator(RangeFunction::Sum, spec, TimeRange::new(500, 5000));
        assert_eq!(agg.aggregate_series(&data), points(&[(0, 3.0)]));
    }

    #[test]
    fn test_zero_sampling_rejected() {
        let spec = RangeSpec::sampled(Duration::new(0, TimeUnit::Seconds));
        assert!(RangeAggregator::new(RangeFunction::Avg, &spec).is_err());
    }
}
