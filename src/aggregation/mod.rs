//! Aggregation Pipeline
//!
//! A metric's aggregators run in the order the query lists them, each one
//! consuming the previous stage's `MetricResult` and returning its
//! replacement. Before any of them run, the reassembled series are grouped:
//! by observed value type (`number` / `text`) always, and by tag or value
//! range when the query asks for it.
//!
//! Some aggregators need the query window to lay out their time buckets.
//! They expose it through [`Aggregator::alignment`], which the pipeline
//! checks once while it is built:
//!
//! ```text
//! specs ──build──▶ [stage, stage, ...] ──set_window on alignable stages
//! MetricResult ──stage 1──▶ MetricResult ──stage 2──▶ ... ──▶ response
//! ```

mod error;
pub mod group_by;
pub mod range;
pub mod transform;

pub use error::{AggregationError, AggregationResult};
pub use group_by::group;
pub use range::{RangeAggregator, RangeFunction};
pub use transform::{Diff, Divide, Filter, Rate, SaveAs, Scale};

use crate::query::result::{MetricResult, QueryDataPoint};
use crate::types::{Duration, TimeRange, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the pipeline
pub trait Aggregator: fmt::Debug + Send + Sync {
    /// Name used in query documents
    fn name(&self) -> &'static str;

    /// Consume a result and produce its replacement
    fn aggregate(&self, result: MetricResult) -> MetricResult;

    /// Stages that bucket by time return themselves here
    fn alignment(&mut self) -> Option<&mut dyn Alignable> {
        None
    }

    /// Metric name the stage's input should also be written under
    fn save_as(&self) -> Option<&str> {
        None
    }
}

/// Capability of stages that need the query window
pub trait Alignable {
    fn set_window(&mut self, window: TimeRange);
}

/// Apply `f` to every numeric series, leaving text series untouched
pub(crate) fn map_numeric<F>(mut result: MetricResult, f: F) -> MetricResult
where
    F: Fn(&[QueryDataPoint]) -> Vec<QueryDataPoint>,
{
    for series in result.results.iter_mut() {
        if series.values.is_empty() || series.is_text() {
            continue;
        }
        series.values = f(&series.values);
    }
    result
}

/// Bucketing options shared by the range aggregators
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeSpec {
    /// Bucket width; without it the whole window is a single bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Duration>,

    /// Snap bucket boundaries to multiples of the sampling width
    pub align_sampling: bool,

    /// Stamp each bucket with its start time
    pub align_start_time: bool,

    /// Stamp each bucket with its end time
    pub align_end_time: bool,
}

impl RangeSpec {
    pub fn sampled(sampling: Duration) -> Self {
        Self {
            sampling: Some(sampling),
            ..Self::default()
        }
    }
}

/// Comparison used by the `filter` aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Equal,
}

impl FilterOp {
    /// Whether `value` matches `threshold` under this operator
    pub fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lt => write!(f, "<"),
            Self::Lte => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Gte => write!(f, ">="),
            Self::Equal => write!(f, "=="),
        }
    }
}

fn default_rate_unit() -> TimeUnit {
    TimeUnit::Seconds
}

/// Aggregator definition as it appears in a query document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum AggregatorSpec {
    Avg(RangeSpec),
    Sum(RangeSpec),
    Min(RangeSpec),
    Max(RangeSpec),
    Count(RangeSpec),
    First(RangeSpec),
    Last(RangeSpec),
    Dev(RangeSpec),
    Percentile {
        /// Fraction in `(0, 1]`
        percentile: f64,
        #[serde(flatten)]
        range: RangeSpec,
    },
    Diff,
    Div {
        divisor: f64,
    },
    Scale {
        factor: f64,
    },
    Rate {
        #[serde(default = "default_rate_unit")]
        unit: TimeUnit,
    },
    Filter {
        filter_op: FilterOp,
        threshold: f64,
    },
    SaveAs {
        metric_name: String,
    },
}

impl AggregatorSpec {
    /// Build the stage, rejecting out-of-range parameters
    pub fn build(&self) -> AggregationResult<Box<dyn Aggregator>> {
        let stage: Box<dyn Aggregator> = match self {
            AggregatorSpec::Avg(range) => Box::new(RangeAggregator::new(RangeFunction::Avg, range)?),
            AggregatorSpec::Sum(range) => Box::new(RangeAggregator::new(RangeFunction::Sum, range)?),
            AggregatorSpec::Min(range) => Box::new(RangeAggregator::new(RangeFunction::Min, range)?),
            AggregatorSpec::Max(range) => Box::new(RangeAggregator::new(RangeFunction::Max, range)?),
            AggregatorSpec::Count(range) => {
                Box::new(RangeAggregator::new(RangeFunction::Count, range)?)
            }
            AggregatorSpec::First(range) => {
                Box::new(RangeAggregator::new(RangeFunction::First, range)?)
            }
            AggregatorSpec::Last(range) => {
                Box::new(RangeAggregator::new(RangeFunction::Last, range)?)
            }
            AggregatorSpec::Dev(range) => Box::new(RangeAggregator::new(RangeFunction::Dev, range)?),
            AggregatorSpec::Percentile { percentile, range } => {
                if !(*percentile > 0.0 && *percentile <= 1.0) {
                    return Err(AggregationError::parameter(
                        "percentile",
                        format!("percentile must be in (0, 1], got {}", percentile),
                    ));
                }
                Box::new(RangeAggregator::new(
                    RangeFunction::Percentile(*percentile),
                    range,
                )?)
            }
            AggregatorSpec::Diff => Box::new(Diff),
            AggregatorSpec::Div { divisor } => Box::new(Divide::new(*divisor)?),
            AggregatorSpec::Scale { factor } => Box::new(Scale::new(*factor)),
            AggregatorSpec::Rate { unit } => Box::new(Rate::new(*unit)),
            AggregatorSpec::Filter {
                filter_op,
                threshold,
            } => Box::new(Filter::new(*filter_op, *threshold)),
            AggregatorSpec::SaveAs { metric_name } => Box::new(SaveAs::new(metric_name)?),
        };
        Ok(stage)
    }
}

/// Group-by definition as it appears in a query document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum GroupBySpec {
    /// One group per distinct combination of these tags' values
    Tag { tags: Vec<String> },

    /// One group per `range_size`-wide value bucket
    Value { range_size: f64 },

    /// Grouping by value type, which every result gets anyway
    Type {
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        group_type: Option<String>,
    },
}

impl GroupBySpec {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupBySpec::Tag {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> AggregationResult<()> {
        match self {
            GroupBySpec::Tag { tags } if tags.is_empty() => Err(AggregationError::InvalidGroupBy {
                group_by: "tag",
                message: "at least one tag is required".to_string(),
            }),
            GroupBySpec::Value { range_size } if !(*range_size > 0.0) => {
                Err(AggregationError::InvalidGroupBy {
                    group_by: "value",
                    message: format!("range_size must be positive, got {}", range_size),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Built chain of aggregators for one metric
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Aggregator>>,
}

impl Pipeline {
    /// Build every stage and hand the query window to the alignable ones
    pub fn build(specs: &[AggregatorSpec], window: TimeRange) -> AggregationResult<Self> {
        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut stage = spec.build()?;
            if let Some(alignable) = stage.alignment() {
                alignable.set_window(window);
            }
            stages.push(stage);
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Metric names requested through `save_as` stages
    pub fn save_as_targets(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter_map(|s| s.save_as().map(str::to_string))
            .collect()
    }

    /// Run every stage in order; a void result skips the chain
    pub fn run(&self, result: MetricResult) -> MetricResult {
        if result.is_void() {
            return result;
        }
        self.stages
            .iter()
            .fold(result, |acc, stage| stage.aggregate(acc))
    }

    /// Run every stage, logging each one's duration
    pub fn run_timed(&self, result: MetricResult, metric: &str) -> MetricResult {
        if result.is_void() {
            return result;
        }
        self.stages.iter().fold(result, |acc, stage| {
            let started = std::time::Instant::now();
            let next = stage.aggregate(acc);
            tracing::debug!(
                metric,
                stage = stage.name(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "Aggregation stage finished"
            );
            next
        })
    }
}
