//! Parser for the standard text exposition format.
//!
//! Produces one [`MetricFamily`] per family name, ready to be handed to a
//! gatherer. Summary quantiles and histogram buckets are folded into a single
//! metric per label set, as the exposition format expects. Sample timestamps
//! are preserved.

use std::collections::{BTreeMap, HashMap};

use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};

use crate::error::ParseError;

/// Parse `input` into metric families keyed by family name.
///
/// Families declared with `# HELP` / `# TYPE` but without any sample are
/// omitted.
pub fn parse(input: &str) -> Result<BTreeMap<String, MetricFamily>, ParseError> {
    let mut parser = TextParser::default();
    for (idx, line) in input.lines().enumerate() {
        parser.line(idx + 1, line)?;
    }
    Ok(parser.finish())
}

pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------------

type Labels = Vec<(String, String)>;

#[derive(Default)]
struct TextParser {
    families: BTreeMap<String, FamilyBuilder>,
}

#[derive(Default)]
struct FamilyBuilder {
    help: Option<String>,
    kind: Option<MetricType>,
    metrics: Vec<proto::Metric>,
    /// Index into `metrics` by label signature, for summaries and histograms.
    folded: HashMap<String, usize>,
}

/// Which part of a family a sample line contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plain,
    Quantile,
    Bucket,
    Sum,
    Count,
}

fn error(line: usize, message: impl Into<String>) -> ParseError {
    ParseError::TextFormat {
        line,
        message: message.into(),
    }
}

impl TextParser {
    fn line(&mut self, line_no: usize, raw: &str) -> Result<(), ParseError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(());
        }
        match line.strip_prefix('#') {
            Some(comment) => self.comment(line_no, comment),
            None => self.sample(line_no, line),
        }
    }

    fn comment(&mut self, line_no: usize, comment: &str) -> Result<(), ParseError> {
        let (keyword, rest) = split_token(comment.trim_start());
        if keyword != "HELP" && keyword != "TYPE" {
            return Ok(());
        }
        let (name, payload) = split_token(rest.trim_start());
        if name.is_empty() {
            return Err(error(line_no, format!("{keyword} line without metric name")));
        }
        if !is_valid_metric_name(name) {
            return Err(error(line_no, format!("invalid metric name '{name}'")));
        }
        let payload = payload.trim_start();
        let family = self.families.entry(name.to_string()).or_default();

        if keyword == "HELP" {
            if family.help.is_some() {
                return Err(error(line_no, format!("second HELP line for metric name '{name}'")));
            }
            family.help = Some(unescape_help(payload));
            return Ok(());
        }

        if family.kind.is_some() {
            return Err(error(line_no, format!("second TYPE line for metric name '{name}'")));
        }
        if !family.metrics.is_empty() {
            return Err(error(line_no, format!("TYPE line for '{name}' after its samples")));
        }
        family.kind = Some(match payload {
            "counter" => MetricType::COUNTER,
            "gauge" => MetricType::GAUGE,
            "summary" => MetricType::SUMMARY,
            "histogram" => MetricType::HISTOGRAM,
            "untyped" => MetricType::UNTYPED,
            other => return Err(error(line_no, format!("unknown metric type '{other}'"))),
        });
        Ok(())
    }

    fn sample(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        let name_end = line
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
            .unwrap_or(line.len());
        let name = &line[..name_end];
        if !is_valid_metric_name(name) {
            return Err(error(line_no, format!("invalid metric name in '{line}'")));
        }

        let rest = &line[name_end..];
        let (mut labels, rest) = match rest.strip_prefix('{') {
            Some(inner) => parse_labels(line_no, inner)?,
            None => (Labels::new(), rest),
        };
        if !rest.starts_with(char::is_whitespace) {
            return Err(error(line_no, "expected whitespace before sample value"));
        }

        let mut fields = rest.split_whitespace();
        let value_text = fields
            .next()
            .ok_or_else(|| error(line_no, "missing sample value"))?;
        let value: f64 = value_text
            .parse()
            .map_err(|_| error(line_no, format!("invalid sample value '{value_text}'")))?;
        let timestamp = match fields.next() {
            Some(ts) => Some(
                ts.parse::<i64>()
                    .map_err(|_| error(line_no, format!("invalid timestamp '{ts}'")))?,
            ),
            None => None,
        };
        if fields.next().is_some() {
            return Err(error(line_no, "unexpected text after timestamp"));
        }

        let (family_name, role) = self.resolve(name);
        let family = self.families.entry(family_name).or_default();
        let kind = family.kind.unwrap_or(MetricType::UNTYPED);

        match role {
            Role::Plain => {
                let mut metric = new_metric(&labels, timestamp);
                match kind {
                    MetricType::COUNTER => {
                        let mut counter = proto::Counter::default();
                        counter.set_value(value);
                        metric.set_counter(counter);
                    }
                    MetricType::GAUGE => {
                        let mut gauge = proto::Gauge::default();
                        gauge.set_value(value);
                        metric.set_gauge(gauge);
                    }
                    MetricType::SUMMARY | MetricType::HISTOGRAM => {
                        return Err(error(
                            line_no,
                            format!("sample '{name}' needs a quantile, bucket, sum or count form"),
                        ));
                    }
                    MetricType::UNTYPED => {
                        let mut untyped = proto::Untyped::default();
                        untyped.set_value(value);
                        metric.set_untyped(untyped);
                    }
                }
                family.metrics.push(metric);
            }
            Role::Quantile => {
                let quantile = take_bound(line_no, &mut labels, "quantile")?;
                let metric = family.fold(&labels, timestamp, kind);
                let mut q = proto::Quantile::default();
                q.set_quantile(quantile);
                q.set_value(value);
                metric.mut_summary().mut_quantile().push(q);
            }
            Role::Bucket => {
                let upper_bound = take_bound(line_no, &mut labels, "le")?;
                let count = as_count(line_no, value)?;
                let metric = family.fold(&labels, timestamp, kind);
                let mut bucket = proto::Bucket::default();
                bucket.set_upper_bound(upper_bound);
                bucket.set_cumulative_count(count);
                metric.mut_histogram().mut_bucket().push(bucket);
            }
            Role::Sum => {
                let metric = family.fold(&labels, timestamp, kind);
                if kind == MetricType::SUMMARY {
                    metric.mut_summary().set_sample_sum(value);
                } else {
                    metric.mut_histogram().set_sample_sum(value);
                }
            }
            Role::Count => {
                let count = as_count(line_no, value)?;
                let metric = family.fold(&labels, timestamp, kind);
                if kind == MetricType::SUMMARY {
                    metric.mut_summary().set_sample_count(count);
                } else {
                    metric.mut_histogram().set_sample_count(count);
                }
            }
        }
        Ok(())
    }

    /// Map a sample name onto its family, recognising the suffixed sample
    /// names of summaries and histograms.
    fn resolve(&self, name: &str) -> (String, Role) {
        let kind_of = |family: &str| self.families.get(family).and_then(|f| f.kind);

        match kind_of(name) {
            Some(MetricType::SUMMARY) => return (name.to_string(), Role::Quantile),
            Some(MetricType::HISTOGRAM) => return (name.to_string(), Role::Plain),
            _ => {}
        }
        let suffixes = [
            ("_bucket", Role::Bucket),
            ("_sum", Role::Sum),
            ("_count", Role::Count),
        ];
        for (suffix, role) in suffixes {
            let Some(base) = name.strip_suffix(suffix) else {
                continue;
            };
            match (kind_of(base), role) {
                (Some(MetricType::HISTOGRAM), _) => return (base.to_string(), role),
                (Some(MetricType::SUMMARY), Role::Sum | Role::Count) => {
                    return (base.to_string(), role)
                }
                _ => {}
            }
        }
        (name.to_string(), Role::Plain)
    }

    fn finish(self) -> BTreeMap<String, MetricFamily> {
        self.families
            .into_iter()
            .filter(|(_, family)| !family.metrics.is_empty())
            .map(|(name, family)| {
                let mut mf = MetricFamily::default();
                mf.set_name(name.clone());
                mf.set_help(family.help.unwrap_or_default());
                mf.set_field_type(family.kind.unwrap_or(MetricType::UNTYPED));
                for metric in family.metrics {
                    mf.mut_metric().push(metric);
                }
                (name, mf)
            })
            .collect()
    }
}

impl FamilyBuilder {
    /// Find or create the metric for `labels` in a summary or histogram.
    fn fold(
        &mut self,
        labels: &[(String, String)],
        timestamp: Option<i64>,
        kind: MetricType,
    ) -> &mut proto::Metric {
        let signature = label_signature(labels);
        let idx = match self.folded.get(&signature) {
            Some(&idx) => idx,
            None => {
                let mut metric = new_metric(labels, None);
                if kind == MetricType::SUMMARY {
                    metric.set_summary(proto::Summary::default());
                } else {
                    metric.set_histogram(proto::Histogram::default());
                }
                self.metrics.push(metric);
                self.folded.insert(signature, self.metrics.len() - 1);
                self.metrics.len() - 1
            }
        };
        let metric = &mut self.metrics[idx];
        if let Some(ts) = timestamp {
            metric.set_timestamp_ms(ts);
        }
        metric
    }
}

// ---------------------------------------------------------------------------
// Lexing helpers
// ---------------------------------------------------------------------------

fn split_token(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

fn new_metric(labels: &[(String, String)], timestamp: Option<i64>) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
    if let Some(ts) = timestamp {
        metric.set_timestamp_ms(ts);
    }
    metric
}

fn label_signature(labels: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(name, value)| format!("{name}\u{ff}{value}"))
        .collect::<Vec<_>>()
        .join("\u{fe}")
}

/// Remove the `quantile` / `le` label and parse its value.
fn take_bound(line_no: usize, labels: &mut Labels, label: &str) -> Result<f64, ParseError> {
    let idx = labels
        .iter()
        .position(|(name, _)| name == label)
        .ok_or_else(|| error(line_no, format!("missing '{label}' label")))?;
    let (_, raw) = labels.remove(idx);
    raw.parse()
        .map_err(|_| error(line_no, format!("invalid '{label}' label value '{raw}'")))
}

fn as_count(line_no: usize, value: f64) -> Result<u64, ParseError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value as u64)
    } else {
        Err(error(line_no, format!("invalid count {value}")))
    }
}

/// Parse `name="value",...}` and return the labels plus the text after `}`.
fn parse_labels(line_no: usize, mut s: &str) -> Result<(Labels, &str), ParseError> {
    let mut labels = Labels::new();
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix('}') {
            return Ok((labels, rest));
        }

        let end = s
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(s.len());
        let name = &s[..end];
        if !is_valid_label_name(name) {
            return Err(error(line_no, format!("invalid label name in '{s}'")));
        }
        s = s[end..].trim_start();
        s = s
            .strip_prefix('=')
            .ok_or_else(|| error(line_no, format!("expected '=' after label name '{name}'")))?
            .trim_start();
        s = s
            .strip_prefix('"')
            .ok_or_else(|| {
                error(line_no, format!("expected '\"' to open value of label '{name}'"))
            })?;

        let (value, rest) = parse_quoted(s).map_err(|msg| error(line_no, msg))?;
        if labels.iter().any(|(existing, _)| existing == name) {
            return Err(error(line_no, format!("duplicate label name '{name}'")));
        }
        labels.push((name.to_string(), value));

        s = rest.trim_start();
        if let Some(rest) = s.strip_prefix(',') {
            s = rest;
        } else if !s.starts_with('}') {
            return Err(error(line_no, "expected ',' or '}' after label value"));
        }
    }
}

/// Read an escaped label value up to its closing quote.
fn parse_quoted(s: &str) -> Result<(String, &str), String> {
    let mut out = String::new();
    let mut chars = s.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &s[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, other)) => return Err(format!("invalid escape sequence '\\{other}'")),
                None => break,
            },
            other => out.push(other),
        }
    }
    Err("unterminated label value".to_string())
}

fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
