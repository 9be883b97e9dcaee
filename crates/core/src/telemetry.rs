//! The exporter's own metrics, labelled by script name.

use std::time::Duration;

use prometheus::{CounterVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::{ExecError, ExecErrorKind};

const SCRIPT_LABEL: &str = "script_name";

/// Counters and gauges describing script executions.
///
/// Owns its own [`Registry`], so several instances (one per test, say) never
/// collide on metric names.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    duration_seconds: CounterVec,
    concurrency_exceeds: IntCounterVec,
    runs: IntCounterVec,
    errors: IntCounterVec,
    parse_errors: IntCounterVec,
    timeouts: IntCounterVec,
    running: IntGaugeVec,
}

impl ExporterMetrics {
    /// Build and register every metric.
    ///
    /// On Linux the process collector (CPU, memory, open fds of the exporter
    /// itself) is registered as well.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let duration_seconds = CounterVec::new(
            Opts::new("script_duration_seconds_total", "time elapsed executing script"),
            &[SCRIPT_LABEL],
        )?;
        let concurrency_exceeds = IntCounterVec::new(
            Opts::new(
                "script_concurrency_exceeds_total",
                "number of times script was not executed because there were already too many executions ongoing",
            ),
            &[SCRIPT_LABEL],
        )?;
        let runs = IntCounterVec::new(
            Opts::new("script_runs_total", "number of times script execution attempted"),
            &[SCRIPT_LABEL],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "script_errors_total",
                "number of script executions that ended with an error",
            ),
            &[SCRIPT_LABEL],
        )?;
        let parse_errors = IntCounterVec::new(
            Opts::new(
                "script_parse_errors_total",
                "number of script executions that ended without error but produced unparseable output",
            ),
            &[SCRIPT_LABEL],
        )?;
        let timeouts = IntCounterVec::new(
            Opts::new(
                "script_timeouts_total",
                "number of script executions that were killed due to timeout",
            ),
            &[SCRIPT_LABEL],
        )?;
        let running = IntGaugeVec::new(
            Opts::new("script_running", "number of executions ongoing"),
            &[SCRIPT_LABEL],
        )?;

        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(concurrency_exceeds.clone()))?;
        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(running.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            duration_seconds,
            concurrency_exceeds,
            runs,
            errors,
            parse_errors,
            timeouts,
            running,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A run was refused because the script is at its concurrency limit.
    pub fn record_rejection(&self, script: &str) {
        self.concurrency_exceeds.with_label_values(&[script]).inc();
    }

    /// A run was admitted and is about to start.
    pub fn run_started(&self, script: &str) {
        self.running.with_label_values(&[script]).inc();
        self.runs.with_label_values(&[script]).inc();
    }

    /// A run finished, successfully or not.
    ///
    /// Every error counts towards `script_errors_total`; only an expired
    /// deadline counts towards `script_timeouts_total`.
    pub fn run_finished(&self, script: &str, elapsed: Duration, error: Option<&ExecError>) {
        self.running.with_label_values(&[script]).dec();
        self.duration_seconds
            .with_label_values(&[script])
            .inc_by(elapsed.as_secs_f64());
        if let Some(err) = error {
            self.errors.with_label_values(&[script]).inc();
            if err.kind() == ExecErrorKind::TimedOut {
                self.timeouts.with_label_values(&[script]).inc();
            }
        }
    }

    pub fn record_parse_error(&self, script: &str) {
        self.parse_errors.with_label_values(&[script]).inc();
    }

    #[cfg(test)]
    fn running(&self, script: &str) -> i64 {
        self.running.with_label_values(&[script]).get()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
