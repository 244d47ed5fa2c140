//! Path encoding
//!
//! Backend series are addressed as
//!
//! ```text
//! root.<storage group>.<slot 0>.<slot 1>...<slot n-1>.<metric>
//! ```
//!
//! The first two segments are the reserved prefix, the last one is the
//! sample segment and everything in between is one tag value per registered
//! tag slot. Segments that are not plain identifiers are wrapped in
//! backticks, with embedded backticks doubled.

use std::borrow::Cow;
use std::fmt;

/// Path delimiter
pub const DELIMITER: char = '.';

/// First segment of every path
pub const ROOT: &str = "root";

/// Number of segments before the first tag slot (`root` + storage group)
pub const PREFIX_LEN: usize = 2;

/// Match-any segment
pub const WILDCARD: &str = "*";

/// Segment written for a slot the data point has no tag for
pub const PLACEHOLDER: &str = "_";

/// Storage group a metric is written to
pub fn storage_group(metric: &str, group_count: u32) -> String {
    let bucket = crc32fast::hash(metric.as_bytes()) % group_count.max(1);
    format!("group_{}", bucket)
}

/// Encode a single segment, quoting it when needed
pub fn encode_segment(segment: &str) -> Cow<'_, str> {
    let plain = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !segment.chars().all(|c| c.is_ascii_digit());

    if plain {
        Cow::Borrowed(segment)
    } else {
        Cow::Owned(format!("`{}`", segment.replace('`', "``")))
    }
}

/// Split an encoded path into decoded segments
///
/// Returns None for an unbalanced quote.
pub fn split_path(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '`' if quoted => {
                if chars.peek() == Some(&'`') {
                    chars.next();
                    current.push('`');
                } else {
                    quoted = false;
                }
            }
            '`' if current.is_empty() => quoted = true,
            DELIMITER if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if quoted {
        return None;
    }
    segments.push(current);
    Some(segments)
}

/// Join decoded segments into an encoded path
pub fn join_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join(".")
}

/// One segment of a path pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Value(String),
    Wildcard,
}

impl PathSegment {
    pub fn matches(&self, segment: &str) -> bool {
        match self {
            PathSegment::Wildcard => true,
            PathSegment::Value(v) => v == segment,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, PathSegment::Wildcard)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Wildcard => write!(f, "{}", WILDCARD),
            PathSegment::Value(v) => write!(f, "{}", encode_segment(v)),
        }
    }
}

/// The tag-slot portion of a path pattern, one segment per slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PathExpression {
    pub segments: Vec<PathSegment>,
}

impl PathExpression {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Number of concrete (non-wildcard) segments
    pub fn concrete_count(&self) -> usize {
        self.segments.iter().filter(|s| !s.is_wildcard()).count()
    }

    /// Number of wildcard segments
    pub fn wildcard_count(&self) -> usize {
        self.segments.len() - self.concrete_count()
    }

    /// Device pattern for a FROM clause: `root.*.<segments>`
    pub fn device_pattern(&self) -> String {
        let mut out = format!("{}.{}", ROOT, WILDCARD);
        for segment in &self.segments {
            out.push(DELIMITER);
            out.push_str(&segment.to_string());
        }
        out
    }

    /// Whether decoded tag-slot segments match this pattern
    pub fn matches(&self, slots: &[String]) -> bool {
        slots.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(slots)
                .all(|(pattern, value)| pattern.matches(value))
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_pattern())
    }
}

/// A fully concrete series path, as found in result column names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesPath {
    pub group: String,
    pub slots: Vec<String>,
    pub metric: String,
}

impl SeriesPath {
    pub fn new(group: impl Into<String>, slots: Vec<String>, metric: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            slots,
            metric: metric.into(),
        }
    }

    /// Parse an encoded column name
    pub fn parse(column: &str) -> Option<Self> {
        let mut segments = split_path(column)?;
        if segments.len() < PREFIX_LEN + 1 || segments[0] != ROOT {
            return None;
        }
        let metric = segments.pop()?;
        let slots = segments.split_off(PREFIX_LEN);
        let group = segments.pop()?;
        Some(Self {
            group,
            slots,
            metric,
        })
    }

    /// Encoded device path (everything but the sample segment)
    pub fn device(&self) -> String {
        let mut parts: Vec<&str> = vec![ROOT, &self.group];
        parts.extend(self.slots.iter().map(String::as_str));
        join_segments(parts)
    }

    /// Encoded sample segment
    pub fn sensor(&self) -> String {
        encode_segment(&self.metric).into_owned()
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device(), self.sensor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_and_quoted() {
        assert_eq!(encode_segment("host_1"), "host_1");
        assert_eq!(encode_segment("cpu.usage"), "`cpu.usage`");
        assert_eq!(encode_segment("us-east"), "`us-east`");
        assert_eq!(encode_segment("42"), "`42`");
        assert_eq!(encode_segment("a`b"), "`a``b`");
        assert_eq!(encode_segment(""), "``");
    }

    #[test]
    fn test_split_honours_quotes() {
        let segments = split_path("root.group_1.`us-east`.a.`cpu.usage`").unwrap();
        assert_eq!(
            segments,
            vec!["root", "group_1", "us-east", "a", "cpu.usage"]
        );

        let segments = split_path("root.g.`a``b`.m").unwrap();
        assert_eq!(segments[2], "a`b");

        assert!(split_path("root.`open").is_none());
    }

    #[test]
    fn test_series_path_parse_and_display() {
        let path = SeriesPath::parse("root.group_3.a.`us-west`.`cpu.usage`").unwrap();
        assert_eq!(path.group, "group_3");
        assert_eq!(path.slots, vec!["a", "us-west"]);
        assert_eq!(path.metric, "cpu.usage");
        assert_eq!(path.device(), "root.group_3.a.`us-west`");
        assert_eq!(path.to_string(), "root.group_3.a.`us-west`.`cpu.usage`");

        assert!(SeriesPath::parse("other.g.m").is_none());
        assert!(SeriesPath::parse("root.g").is_none());
    }

    #[test]
    fn test_series_path_without_slots() {
        let path = SeriesPath::parse("root.group_0.load").unwrap();
        assert!(path.slots.is_empty());
        assert_eq!(path.metric, "load");
    }

    #[test]
    fn test_expression_matching() {
        let expr = PathExpression::new(vec![
            PathSegment::Value("a".into()),
            PathSegment::Wildcard,
        ]);
        assert_eq!(expr.device_pattern(), "root.*.a.*");
        assert!(expr.matches(&["a".into(), "us".into()]));
        assert!(!expr.matches(&["b".into(), "us".into()]));
        assert!(!expr.matches(&["a".into()]));
        assert_eq!(expr.concrete_count(), 1);
        assert_eq!(expr.wildcard_count(), 1);
    }

    #[test]
    fn test_storage_group_is_stable() {
        let a = storage_group("cpu.usage", 50);
        assert_eq!(a, storage_group("cpu.usage", 50));
        assert!(a.starts_with("group_"));
        assert_eq!(storage_group("anything", 1), "group_0");
    }
}
