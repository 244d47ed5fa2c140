//! Select statement compilation
//!
//! For a metric with `n` tag slots, every slot becomes either the filter
//! value(s) of the tag key registered there or a wildcard. A tag filtered on
//! several values fans out into one path expression per combination; all
//! of them share a single statement.
//!
//! Slots are append-only, so a series written before the metric gained its
//! later keys has a shorter path. Every width from the last filtered slot up
//! to `n` is therefore selected, widest first.
//!
//! The fan-out is capped at [`MAX_PATH_EXPRESSIONS`]. Past the cap the most
//! selective filters are widened to wildcards and kept as residual filters,
//! which [`CompiledQuery::accepts`] applies to the returned series.

use crate::schema::TagPositions;
use crate::sql::path::{encode_segment, PathExpression, PathSegment, SeriesPath};
use crate::types::TimeRange;
use std::collections::BTreeMap;
use std::fmt;

/// Tag key → accepted values (OR within a key, AND across keys)
pub type TagFilters = BTreeMap<String, Vec<String>>;

/// Upper bound on path expressions in one select
pub const MAX_PATH_EXPRESSIONS: usize = 4096;

/// The path patterns a metric query expands to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub metric: String,
    pub expressions: Vec<PathExpression>,
    /// Slot filters left out of the paths, checked on returned series
    pub residual: Vec<(usize, Vec<String>)>,
}

impl CompiledQuery {
    /// Compile tag filters against a metric's slot mapping
    ///
    /// Returns None when a filtered tag key has no slot, meaning no series
    /// of this metric can match.
    pub fn compile(metric: &str, positions: &TagPositions, filters: &TagFilters) -> Option<Self> {
        let slot_count = positions.slot_count();
        // An empty choice list is a wildcard
        let mut per_slot: Vec<Vec<String>> = vec![Vec::new(); slot_count];
        let mut min_width = 0;

        for (key, values) in filters {
            let slot = positions.slot_of(key)?;
            let mut distinct: Vec<String> = Vec::new();
            for value in values {
                if !distinct.contains(value) {
                    distinct.push(value.clone());
                }
            }
            if distinct.is_empty() {
                continue;
            }
            min_width = min_width.max(slot + 1);
            per_slot[slot] = distinct;
        }

        let widths = slot_count - min_width + 1;
        let mut residual = Vec::new();
        while combinations(&per_slot).saturating_mul(widths) > MAX_PATH_EXPRESSIONS {
            let Some(widest) = (0..slot_count).max_by_key(|slot| per_slot[*slot].len()) else {
                break;
            };
            if per_slot[widest].len() <= 1 {
                break;
            }
            residual.push((widest, std::mem::take(&mut per_slot[widest])));
        }
        if !residual.is_empty() {
            tracing::debug!(
                metric,
                residual = residual.len(),
                "Tag filter fan-out capped, filtering returned series instead"
            );
        }

        let mut expressions = Vec::new();
        for width in (min_width..=slot_count).rev() {
            let mut partial: Vec<Vec<PathSegment>> = vec![Vec::with_capacity(width)];
            for choices in &per_slot[..width] {
                if choices.is_empty() {
                    for expr in &mut partial {
                        expr.push(PathSegment::Wildcard);
                    }
                    continue;
                }
                partial = partial
                    .iter()
                    .flat_map(|prefix| {
                        choices.iter().map(move |value| {
                            let mut expr = prefix.clone();
                            expr.push(PathSegment::Value(value.clone()));
                            expr
                        })
                    })
                    .collect();
            }
            expressions.extend(partial.into_iter().map(PathExpression::new));
        }

        Some(Self {
            metric: metric.to_string(),
            expressions,
            residual,
        })
    }

    /// Whether a returned series passes the residual filters
    pub fn accepts(&self, path: &SeriesPath) -> bool {
        self.residual.iter().all(|(slot, values)| {
            path.slots
                .get(*slot)
                .is_some_and(|value| values.contains(value))
        })
    }

    /// Select statement for one routed sub-range
    pub fn select(&self, range: TimeRange) -> SelectStatement {
        SelectStatement {
            metric: self.metric.clone(),
            expressions: self.expressions.clone(),
            range,
        }
    }

    /// One select statement per sub-range, in the order given
    pub fn select_all(&self, ranges: impl IntoIterator<Item = TimeRange>) -> Vec<SelectStatement> {
        ranges.into_iter().map(|range| self.select(range)).collect()
    }
}

/// A time-bounded multi-path select
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    pub metric: String,
    pub expressions: Vec<PathExpression>,
    pub range: TimeRange,
}

impl SelectStatement {
    pub fn to_sql(&self) -> String {
        let from = self
            .expressions
            .iter()
            .map(PathExpression::device_pattern)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT {} FROM {} WHERE time >= {} AND time < {}",
            encode_segment(&self.metric),
            from,
            self.range.start,
            self.range.end
        )
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Path expressions one width expands to
fn combinations(per_slot: &[Vec<String>]) -> usize {
    per_slot
        .iter()
        .fold(1usize, |n, choices| n.saturating_mul(choices.len().max(1)))
}
