//! Turning script output into an exposition response.
//!
//! Each response is backed by exactly one [`Gatherer`]: either the
//! exporter's own registry, or one built from a single script's output by
//! [`assemble`]. [`encode_text`] serializes whatever the gatherer yields.

use std::collections::{BTreeMap, HashMap};

use prometheus::core::Desc;
use prometheus::proto::{self, LabelPair, MetricFamily};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::error::{ParseError, ServeError};
use crate::model::{Metric, OutputFormat};
use crate::{opentsdb, textformat};

const TRANSLATED_HELP: &str = "translated from OpenTSDB script output";

/// Produces the metric families for one response.
///
/// Implementations must be deterministic: gathering twice over the same
/// input yields identical families in identical order.
pub trait Gatherer {
    fn gather(&self) -> Result<Vec<MetricFamily>, ServeError>;
}

impl Gatherer for Registry {
    fn gather(&self) -> Result<Vec<MetricFamily>, ServeError> {
        Ok(Registry::gather(self))
    }
}

/// Parse `output` in the given format and wrap it in a gatherer.
pub fn assemble(
    format: OutputFormat,
    output: &str,
) -> Result<Box<dyn Gatherer + Send + Sync>, ParseError> {
    match format {
        OutputFormat::OpenTsdb => Ok(Box::new(SliceCollector::new(opentsdb::translate(output)?))),
        OutputFormat::Prometheus => Ok(Box::new(ParsedFamilies::new(textformat::parse(output)?))),
    }
}

/// Serialize the gatherer's families in the text exposition format.
pub fn encode_text(gatherer: &dyn Gatherer) -> Result<Vec<u8>, ServeError> {
    let families = gatherer.gather()?;
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(|e| ServeError::Encoding(e.to_string()))?;
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// Translated metrics
// ---------------------------------------------------------------------------

/// Gatherer over a flat list of translated metrics.
///
/// Descriptors are rebuilt on every call; nothing is cached between
/// responses.
#[derive(Debug, Clone)]
pub struct SliceCollector {
    metrics: Vec<Metric>,
}

impl SliceCollector {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }
}

impl Gatherer for SliceCollector {
    fn gather(&self) -> Result<Vec<MetricFamily>, ServeError> {
        let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();

        for metric in &self.metrics {
            let const_labels: HashMap<String, String> = metric
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let desc = Desc::new(
                metric.name.clone(),
                TRANSLATED_HELP.to_string(),
                Vec::new(),
                const_labels,
            )?;

            let family = families.entry(desc.fq_name.clone()).or_insert_with(|| {
                let mut mf = MetricFamily::default();
                mf.set_name(desc.fq_name.clone());
                mf.set_help(desc.help.clone());
                mf.set_field_type(metric.kind());
                mf
            });

            let mut sample = proto::Metric::default();
            for pair in &desc.const_label_pairs {
                sample.mut_label().push(pair.clone());
            }
            let mut gauge = proto::Gauge::default();
            gauge.set_value(metric.value);
            sample.set_gauge(gauge);
            family.mut_metric().push(sample);
        }

        normalize(families)
    }
}

// ---------------------------------------------------------------------------
// Parsed text format
// ---------------------------------------------------------------------------

/// Gatherer over families parsed from the standard text format.
#[derive(Debug, Clone, Default)]
pub struct ParsedFamilies {
    families: BTreeMap<String, MetricFamily>,
}

impl ParsedFamilies {
    pub fn new(families: BTreeMap<String, MetricFamily>) -> Self {
        Self { families }
    }
}

impl Gatherer for ParsedFamilies {
    fn gather(&self) -> Result<Vec<MetricFamily>, ServeError> {
        normalize(self.families.clone())
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn label_key(metric: &proto::Metric) -> Vec<(&str, &str)> {
    metric
        .get_label()
        .iter()
        .map(|pair| (pair.get_name(), pair.get_value()))
        .collect()
}

fn render_labels(metric: &proto::Metric) -> String {
    let pairs: Vec<String> = metric
        .get_label()
        .iter()
        .map(|pair| format!("{}=\"{}\"", pair.get_name(), pair.get_value()))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

/// Sort labels within each metric and metrics within each family, drop
/// families without samples, and reject repeated series.
fn normalize(families: BTreeMap<String, MetricFamily>) -> Result<Vec<MetricFamily>, ServeError> {
    let mut out = Vec::with_capacity(families.len());

    for (name, mut family) in families {
        if family.get_metric().is_empty() {
            continue;
        }

        for metric in family.mut_metric().iter_mut() {
            metric
                .mut_label()
                .sort_by(|a: &LabelPair, b: &LabelPair| a.get_name().cmp(b.get_name()));
        }
        family
            .mut_metric()
            .sort_by(|a, b| label_key(a).cmp(&label_key(b)));

        if let Some(pair) = family
            .get_metric()
            .windows(2)
            .find(|pair| label_key(&pair[0]) == label_key(&pair[1]))
        {
            return Err(ServeError::DuplicateSeries {
                name,
                labels: render_labels(&pair[0]),
            });
        }

        out.push(family);
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use prometheus::proto::MetricType;

    use super::*;
    use crate::model::LabelSet;

    impl std::fmt::Debug for dyn Gatherer + Send + Sync {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Gatherer")
        }
    }

    fn text(gatherer: &dyn Gatherer) -> String {
        String::from_utf8(encode_text(gatherer).expect("encode")).expect("utf8")
    }

    #[test]
    fn translated_metrics_become_gauges() {
        let gatherer = assemble(OutputFormat::OpenTsdb, "a.a 1000 9 l1=v1\na.b 1001 99 l2=v2 l3=v3")
            .expect("assemble");
        let families = gatherer.gather().expect("gather");
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].get_name(), "a_a");
        assert_eq!(families[0].get_field_type(), MetricType::GAUGE);
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 9.0);

        let out = text(gatherer.as_ref());
        assert!(out.contains("a_a{l1=\"v1\"} 9\n"), "{out}");
        assert!(out.contains("a_b{l2=\"v2\",l3=\"v3\"} 99\n"), "{out}");
        assert!(out.contains("# TYPE a_b gauge\n"), "{out}");
    }

    #[test]
    fn same_name_different_labels_share_a_family() {
        let gatherer = assemble(
            OutputFormat::OpenTsdb,
            "disk.free 1 20 mount=/var\ndisk.free 1 10 mount=/\n",
        )
        .expect("assemble");
        let families = gatherer.gather().expect("gather");
        assert_eq!(families.len(), 1);
        let values: Vec<f64> = families[0]
            .get_metric()
            .iter()
            .map(|m| m.get_gauge().get_value())
            .collect();
        assert_eq!(values, vec![10.0, 20.0]);
    }

    #[test]
    fn duplicate_series_is_a_serve_error() {
        let collector = SliceCollector::new(vec![
            Metric::new("x", LabelSet::new(), 1.0),
            Metric::new("x", LabelSet::new(), 2.0),
        ]);
        assert_matches!(
            collector.gather(),
            Err(ServeError::DuplicateSeries { ref name, .. }) if name == "x"
        );
    }

    #[test]
    fn empty_translation_encodes_to_nothing() {
        let gatherer = assemble(OutputFormat::OpenTsdb, "\n\n").expect("assemble");
        assert_eq!(text(gatherer.as_ref()), "");
    }

    #[test]
    fn parse_errors_surface_before_gathering() {
        assert_matches!(
            assemble(OutputFormat::OpenTsdb, "a.b 1001"),
            Err(ParseError::BadLine { line: 1, .. })
        );
        assert_matches!(
            assemble(OutputFormat::Prometheus, "ok 1\n{bad} 2\n"),
            Err(ParseError::TextFormat { line: 2, .. })
        );
    }

    #[test]
    fn parsed_families_sort_labels() {
        let gatherer =
            assemble(OutputFormat::Prometheus, "m{z=\"1\",a=\"2\"} 5\n").expect("assemble");
        let families = gatherer.gather().expect("gather");
        let names: Vec<&str> = families[0].get_metric()[0]
            .get_label()
            .iter()
            .map(|l| l.get_name())
            .collect();
        assert_eq!(names, vec!["a", "z"]);
        assert!(text(gatherer.as_ref()).ends_with("\nm{a=\"2\",z=\"1\"} 5\n"));
    }

    #[test]
    fn parsed_output_is_reproducible() {
        let input = "\
# HELP b_total things
# TYPE b_total counter
b_total{k=\"2\"} 2
b_total{k=\"1\"} 1
a 7 1700000000000
";
        let gatherer = assemble(OutputFormat::Prometheus, input).expect("assemble");
        let first = text(gatherer.as_ref());
        let second = text(gatherer.as_ref());
        assert_eq!(first, second);
        assert!(first.starts_with("# TYPE a untyped\na 7 1700000000000\n"), "{first}");
        let one = first.find("b_total{k=\"1\"}").expect("k=1");
        let two = first.find("b_total{k=\"2\"}").expect("k=2");
        assert!(one < two);
    }

    #[test]
    fn parsed_duplicate_series_is_rejected() {
        let gatherer = assemble(OutputFormat::Prometheus, "x{a=\"1\"} 1\nx{a=\"1\"} 2\n")
            .expect("assemble");
        assert_matches!(gatherer.gather(), Err(ServeError::DuplicateSeries { .. }));
    }

    #[test]
    fn registry_is_a_gatherer() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("own_total", "own counter").expect("counter");
        registry.register(Box::new(counter.clone())).expect("register");
        counter.inc();
        let out = text(&registry);
        assert!(out.contains("own_total 1\n"), "{out}");
    }
}
