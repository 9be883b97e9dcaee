//! Translation of OpenTSDB (tcollector) text lines into [`Metric`]s.
//!
//! Each non-blank line has the shape
//!
//! ```text
//! <metric> <timestamp> <value> [<tagk>=<tagv>[,<tagk>=<tagv>...] ...]
//! ```
//!
//! Translation is all-or-nothing: the first bad line fails the whole input.

use crate::error::ParseError;
use crate::model::{LabelSet, Metric};

/// Translate every line of `input` into a gauge [`Metric`].
///
/// Metric names and tag keys are rewritten with [`sanitize_name`]. The
/// timestamp must parse but is otherwise discarded.
pub fn translate(input: &str) -> Result<Vec<Metric>, ParseError> {
    let mut metrics = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        metrics.push(parse_line(idx + 1, line)?);
    }
    Ok(metrics)
}

/// Parse one tcollector-style line.
fn parse_line(line_no: usize, line: &str) -> Result<Metric, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ParseError::BadLine {
            line: line_no,
            text: line.to_string(),
        });
    }

    fields[1]
        .parse::<i64>()
        .map_err(|_| ParseError::BadTimestamp {
            line: line_no,
            value: fields[1].to_string(),
        })?;
    let value = fields[2]
        .parse::<f64>()
        .map_err(|_| ParseError::BadValue {
            line: line_no,
            value: fields[2].to_string(),
        })?;

    let metric = fields[0];
    if !is_valid_tsdb_string(metric) {
        return Err(ParseError::BadMetric {
            line: line_no,
            name: metric.to_string(),
        });
    }

    let mut labels = LabelSet::new();
    for token in &fields[3..] {
        let tags = parse_tags(token).map_err(|reason| ParseError::BadTag {
            line: line_no,
            metric: metric.to_string(),
            tag: token.to_string(),
            reason,
        })?;
        for (key, value) in tags {
            labels.insert(sanitize_name(&key), value);
        }
    }

    Ok(Metric::new(sanitize_name(metric), labels, value))
}

/// Split a tag token of comma-separated `key=value` pairs.
fn parse_tags(token: &str) -> Result<Vec<(String, String)>, String> {
    let mut tags: Vec<(String, String)> = Vec::new();
    for pair in token.split(',') {
        let parts: Vec<&str> = pair.split('=').collect();
        if parts.len() != 2 {
            return Err(format!("expected key=value, got '{pair}'"));
        }
        let key = parts[0].trim();
        let value = parts[1].trim();
        if key.is_empty() {
            return Err(format!("empty tag key in '{pair}'"));
        }
        if tags.iter().any(|(k, _)| k == key) {
            return Err(format!("duplicate tag key '{key}'"));
        }
        tags.push((key.to_string(), value.to_string()));
    }
    Ok(tags)
}

/// Whether `s` is an acceptable OpenTSDB metric name: non-empty and made of
/// letters, digits, `-`, `_`, `.` and `/`.
pub fn is_valid_tsdb_string(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

/// Rewrite `s` into a valid metric or label name.
///
/// Characters outside `[A-Za-z_]` become `_`, except ASCII digits after the
/// first position, which are kept.
pub fn sanitize_name(s: &str) -> String {
    s.chars()
        .enumerate()
        .map(|(i, c)| match c {
            'a'..='z' | 'A'..='Z' | '_' => c,
            '0'..='9' if i > 0 => c,
            _ => '_',
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
