//! Canonical metric model produced from script output.

use std::collections::BTreeMap;

use prometheus::proto::MetricType;

/// Label set keyed by label name. Ordered so that output is stable.
pub type LabelSet = BTreeMap<String, String>;

/// One sample translated from script output.
///
/// Translated samples are always gauges: the source format carries no type
/// information, and its timestamp is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub labels: LabelSet,
    pub value: f64,
}

impl Metric {
    pub fn new(name: impl Into<String>, labels: LabelSet, value: f64) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
        }
    }

    pub fn kind(&self) -> MetricType {
        MetricType::GAUGE
    }
}

/// How script stdout should be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Standard text exposition format.
    #[default]
    Prometheus,
    /// `metric timestamp value [tag=value ...]` lines.
    OpenTsdb,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::OpenTsdb => "opentsdb",
        }
    }
}
