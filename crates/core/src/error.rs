use std::process::ExitStatus;

/// Errors produced while admitting or executing a script.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("can't spawn a new instance of script '{script}': already have {running} running")]
    AdmissionRejected { script: String, running: usize },

    #[error("invalid script name '{0}'")]
    InvalidScriptName(String),

    #[error("failed to start child: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed waiting for child: {0}")]
    Io(#[source] std::io::Error),

    #[error("script exited with {0}")]
    ExitStatus(ExitStatus),

    #[error("got stderr output: {0}")]
    Stderr(String),

    #[error("script output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution deadline exceeded")]
    TimedOut,

    #[error("dispatcher is not running")]
    DispatcherStopped,
}

/// Coarse classification of an [`ExecError`], used to pick counters and
/// response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    AdmissionRejected,
    ExecutionFailed,
    Cancelled,
    TimedOut,
    InvalidRequest,
}

impl ExecError {
    pub fn kind(&self) -> ExecErrorKind {
        match self {
            Self::AdmissionRejected { .. } => ExecErrorKind::AdmissionRejected,
            Self::InvalidScriptName(_) => ExecErrorKind::InvalidRequest,
            Self::Spawn(_)
            | Self::Io(_)
            | Self::ExitStatus(_)
            | Self::Stderr(_)
            | Self::OutputTooLarge { .. }
            | Self::DispatcherStopped => ExecErrorKind::ExecutionFailed,
            Self::Cancelled => ExecErrorKind::Cancelled,
            Self::TimedOut => ExecErrorKind::TimedOut,
        }
    }
}

/// A script's output could not be read as metrics.
///
/// Every variant carries the 1-based line number of the offending input line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: bad line: {text}")]
    BadLine { line: usize, text: String },

    #[error("line {line}: bad timestamp: {value}")]
    BadTimestamp { line: usize, value: String },

    #[error("line {line}: bad value: {value}")]
    BadValue { line: usize, value: String },

    #[error("line {line}: bad metric: {name}")]
    BadMetric { line: usize, name: String },

    #[error("line {line}: bad tag, metric {metric}: {tag}: {reason}")]
    BadTag {
        line: usize,
        metric: String,
        tag: String,
        reason: String,
    },

    #[error("line {line}: {message}")]
    TextFormat { line: usize, message: String },
}

impl ParseError {
    pub fn line(&self) -> usize {
        match self {
            Self::BadLine { line, .. }
            | Self::BadTimestamp { line, .. }
            | Self::BadValue { line, .. }
            | Self::BadMetric { line, .. }
            | Self::BadTag { line, .. }
            | Self::TextFormat { line, .. } => *line,
        }
    }
}

/// Failure while assembling or serializing a metrics response.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("metric descriptor rejected: {0}")]
    Descriptor(#[from] prometheus::Error),

    #[error("duplicate series {name}{labels}")]
    DuplicateSeries { name: String, labels: String },

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
