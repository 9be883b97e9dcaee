//! Per-script admission control.
//!
//! Requests enter a single admission loop in arrival order. The loop checks
//! the [`ConcurrencyTable`] and either rejects the request on the spot or
//! admits it and hands it to its own execution task, returning straight away
//! to the next request. Only the table bookkeeping is serialized; script
//! execution never blocks the loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::context::RunContext;
use crate::error::ExecError;
use crate::runner::{ExecutionResult, ScriptExecutor};
use crate::telemetry::ExporterMetrics;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Directory that script names are resolved against.
    pub script_dir: PathBuf,
    /// Maximum concurrent runs of any one script.
    pub max_per_script: usize,
}

/// One request travelling from a caller to the admission loop.
struct ExecutionRequest {
    script: String,
    ctx: RunContext,
    result: oneshot::Sender<ExecutionResult>,
}

// ---------------------------------------------------------------------------
// ConcurrencyTable
// ---------------------------------------------------------------------------

/// In-flight run count per script name.
///
/// All reads and writes go through one mutex, held only for the
/// check-and-increment or the decrement.
#[derive(Debug, Default)]
pub struct ConcurrencyTable {
    counts: Mutex<HashMap<String, usize>>,
}

impl ConcurrencyTable {
    pub fn running(&self, script: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(script).copied().unwrap_or(0)
    }

    /// Total runs in flight across all scripts.
    pub fn total(&self) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.values().sum()
    }

    /// Claim a slot for `script`, or return the current count if it is
    /// already at `max`.
    fn try_acquire(self: &Arc<Self>, script: &str, max: usize) -> Result<AdmissionSlot, usize> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let current = counts.get(script).copied().unwrap_or(0);
        if current >= max {
            return Err(current);
        }
        counts.insert(script.to_string(), current + 1);
        Ok(AdmissionSlot {
            table: Arc::clone(self),
            script: script.to_string(),
        })
    }

    fn release(&self, script: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(script) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(script);
            }
            None => tracing::error!(script, "Released a slot that was never acquired"),
        }
    }
}

/// An admitted run's place in the table. Dropping it frees the slot, so a
/// panicking execution task still gives its slot back.
struct AdmissionSlot {
    table: Arc<ConcurrencyTable>,
    script: String,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.table.release(&self.script);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle for submitting script runs.
///
/// The admission loop stops once every handle has been dropped and all
/// admitted runs have finished.
#[derive(Clone)]
pub struct Dispatcher {
    requests: mpsc::Sender<ExecutionRequest>,
    table: Arc<ConcurrencyTable>,
}

impl Dispatcher {
    /// Spawn the admission loop on the current runtime.
    pub fn start<E>(
        settings: DispatcherSettings,
        executor: Arc<E>,
        metrics: Arc<ExporterMetrics>,
    ) -> (Self, JoinHandle<()>)
    where
        E: ScriptExecutor + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let table = Arc::new(ConcurrencyTable::default());
        let admission = AdmissionLoop {
            settings,
            executor,
            metrics,
            table: Arc::clone(&table),
        };
        let handle = tokio::spawn(admission.run(rx));
        (Self { requests: tx, table }, handle)
    }

    /// Run `script` under `ctx` and wait for its single result.
    ///
    /// Invalid names are refused here, before they reach admission control.
    pub async fn execute(&self, script: &str, ctx: RunContext) -> ExecutionResult {
        if let Err(e) = validate_script_name(script) {
            return ExecutionResult::failure(String::new(), e);
        }

        let (tx, rx) = oneshot::channel();
        let request = ExecutionRequest {
            script: script.to_string(),
            ctx,
            result: tx,
        };
        if self.requests.send(request).await.is_err() {
            return ExecutionResult::failure(String::new(), ExecError::DispatcherStopped);
        }
        rx.await.unwrap_or_else(|_| {
            ExecutionResult::failure(String::new(), ExecError::DispatcherStopped)
        })
    }

    pub fn concurrency(&self) -> &ConcurrencyTable {
        &self.table
    }
}

/// Reject names that could escape the script directory.
///
/// A name is a `/`-separated relative path whose segments are all non-empty
/// and neither `.` nor `..`.
pub fn validate_script_name(script: &str) -> Result<(), ExecError> {
    let invalid = || ExecError::InvalidScriptName(script.to_string());
    if script.is_empty() || script.starts_with('/') || script.contains('\0') {
        return Err(invalid());
    }
    if script
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Admission loop
// ---------------------------------------------------------------------------

struct AdmissionLoop<E> {
    settings: DispatcherSettings,
    executor: Arc<E>,
    metrics: Arc<ExporterMetrics>,
    table: Arc<ConcurrencyTable>,
}

impl<E: ScriptExecutor + 'static> AdmissionLoop<E> {
    async fn run(self, mut requests: mpsc::Receiver<ExecutionRequest>) {
        let mut tasks = JoinSet::new();
        tracing::info!(
            max_per_script = self.settings.max_per_script,
            script_dir = %self.settings.script_dir.display(),
            "Dispatcher started",
        );

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.admit(&mut tasks, request),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Script execution task failed");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Dispatcher draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Script execution task failed");
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    fn admit(&self, tasks: &mut JoinSet<()>, request: ExecutionRequest) {
        let slot = match self
            .table
            .try_acquire(&request.script, self.settings.max_per_script)
        {
            Ok(slot) => slot,
            Err(running) => {
                self.metrics.record_rejection(&request.script);
                tracing::warn!(script = %request.script, running, "Concurrency limit reached");
                let error = ExecError::AdmissionRejected {
                    script: request.script,
                    running,
                };
                let rejected = ExecutionResult::failure(String::new(), error);
                if request.result.send(rejected).is_err() {
                    tracing::debug!("Caller went away before the rejection was delivered");
                }
                return;
            }
        };

        self.metrics.run_started(&request.script);
        let path = self.settings.script_dir.join(&request.script);
        tasks.spawn(execute_admitted(
            Arc::clone(&self.executor),
            Arc::clone(&self.metrics),
            path,
            request,
            slot,
        ));
    }
}

async fn execute_admitted<E: ScriptExecutor>(
    executor: Arc<E>,
    metrics: Arc<ExporterMetrics>,
    path: PathBuf,
    request: ExecutionRequest,
    slot: AdmissionSlot,
) {
    tracing::debug!(script = %request.script, path = %path.display(), "Executing script");
    let started = Instant::now();
    let result = executor.execute(&request.ctx, &path).await;
    let elapsed = started.elapsed();

    drop(slot);
    metrics.run_finished(&request.script, elapsed, result.error.as_ref());
    tracing::debug!(
        script = %request.script,
        elapsed_ms = elapsed.as_millis() as u64,
        success = result.is_success(),
        "Script finished",
    );

    if request.result.send(result).is_err() {
        tracing::debug!(script = %request.script, "Caller went away before the result was ready");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::context::Interrupt;
    use crate::error::ExecErrorKind;
    use crate::runner::ProcessRunner;

    /// Executor that blocks each run until the test opens the gate.
    struct GatedExecutor {
        gate: Semaphore,
        started: Notify,
        calls: AtomicUsize,
    }

    impl GatedExecutor {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                started: Notify::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ScriptExecutor for GatedExecutor {
        async fn execute(&self, ctx: &RunContext, script: &Path) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            tokio::select! {
                permit = self.gate.acquire() => {
                    drop(permit);
                    ExecutionResult::success(format!("{}\n", script.display()))
                }
                interrupt = ctx.done() => {
                    let error = match interrupt {
                        Interrupt::Cancelled => ExecError::Cancelled,
                        Interrupt::DeadlineExceeded => ExecError::TimedOut,
                    };
                    ExecutionResult::failure(String::new(), error)
                }
            }
        }
    }

    fn settings(max_per_script: usize) -> DispatcherSettings {
        DispatcherSettings {
            script_dir: PathBuf::from("/scripts"),
            max_per_script,
        }
    }

    fn start_gated(max: usize) -> (Dispatcher, Arc<GatedExecutor>, Arc<ExporterMetrics>) {
        let executor = Arc::new(GatedExecutor::new());
        let metrics = Arc::new(ExporterMetrics::new().expect("metrics"));
        let (dispatcher, _handle) =
            Dispatcher::start(settings(max), Arc::clone(&executor), Arc::clone(&metrics));
        (dispatcher, executor, metrics)
    }

    fn counter(metrics: &ExporterMetrics, name: &str) -> f64 {
        metrics
            .registry()
            .gather()
            .into_iter()
            .find(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric().iter().map(|m| m.get_counter().get_value()).sum())
            .unwrap_or(0.0)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn second_run_of_same_script_is_rejected() {
        let (dispatcher, executor, metrics) = start_gated(1);

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.execute("a.sh", RunContext::background()).await })
        };
        executor.started.notified().await;

        let second = dispatcher.execute("a.sh", RunContext::background()).await;
        assert_matches!(
            second.error,
            Some(ExecError::AdmissionRejected { ref script, running: 1 }) if script == "a.sh"
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter(&metrics, "script_concurrency_exceeds_total"), 1.0);

        executor.gate.add_permits(1);
        let first = first.await.expect("join");
        assert!(first.is_success());
        assert_eq!(first.output, "/scripts/a.sh\n");
        assert_eq!(dispatcher.concurrency().running("a.sh"), 0);
        assert_eq!(counter(&metrics, "script_runs_total"), 1.0);
    }

    #[tokio::test]
    async fn different_scripts_run_concurrently() {
        let (dispatcher, executor, _metrics) = start_gated(1);

        let a = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.execute("a.sh", RunContext::background()).await })
        };
        executor.started.notified().await;
        let b = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.execute("b.sh", RunContext::background()).await })
        };
        executor.started.notified().await;

        assert_eq!(dispatcher.concurrency().running("a.sh"), 1);
        assert_eq!(dispatcher.concurrency().running("b.sh"), 1);
        assert_eq!(dispatcher.concurrency().total(), 2);

        executor.gate.add_permits(2);
        assert!(a.await.expect("join").is_success());
        assert!(b.await.expect("join").is_success());
        assert_eq!(dispatcher.concurrency().total(), 0);
    }

    #[tokio::test]
    async fn higher_limit_admits_up_to_limit() {
        let (dispatcher, executor, _metrics) = start_gated(2);

        let mut runs = Vec::new();
        for _ in 0..2 {
            let dispatcher = dispatcher.clone();
            runs.push(tokio::spawn(async move {
                dispatcher.execute("a.sh", RunContext::background()).await
            }));
            executor.started.notified().await;
        }

        let third = dispatcher.execute("a.sh", RunContext::background()).await;
        assert_eq!(third.error_kind(), Some(ExecErrorKind::AdmissionRejected));

        executor.gate.add_permits(2);
        for run in runs {
            assert!(run.await.expect("join").is_success());
        }
    }

    #[tokio::test]
    async fn invalid_names_never_reach_admission() {
        let (dispatcher, executor, metrics) = start_gated(1);
        for name in ["", "../etc/passwd", "/bin/sh", "a//b", "a/./b", "dir/"] {
            let result = dispatcher.execute(name, RunContext::background()).await;
            assert_eq!(result.error_kind(), Some(ExecErrorKind::InvalidRequest), "{name:?}");
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(counter(&metrics, "script_runs_total"), 0.0);
    }

    #[test]
    fn nested_names_are_valid() {
        assert!(validate_script_name("disk.sh").is_ok());
        assert!(validate_script_name("net/ping.sh").is_ok());
        assert!(validate_script_name("a..b").is_ok());
    }

    // -----------------------------------------------------------------------
    // Result delivery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn timeout_is_counted_and_slot_freed() {
        let (dispatcher, _executor, metrics) = start_gated(1);

        let result = dispatcher
            .execute("slow.sh", RunContext::with_timeout(Duration::from_millis(30)))
            .await;
        assert_matches!(result.error, Some(ExecError::TimedOut));
        assert_eq!(dispatcher.concurrency().running("slow.sh"), 0);
        assert_eq!(counter(&metrics, "script_errors_total"), 1.0);
        assert_eq!(counter(&metrics, "script_timeouts_total"), 1.0);
    }

    #[tokio::test]
    async fn abandoned_caller_still_releases_slot() {
        let (dispatcher, executor, _metrics) = start_gated(1);

        let ctx = RunContext::background();
        let caller = {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatcher.execute("a.sh", ctx).await })
        };
        executor.started.notified().await;
        caller.abort();
        let _ = caller.await;

        // The run is still holding its slot until it is told to stop.
        assert_eq!(dispatcher.concurrency().running("a.sh"), 1);
        ctx.cancel();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.concurrency().running("a.sh") != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot released");

        executor.gate.add_permits(1);
        let again = dispatcher.execute("a.sh", RunContext::background()).await;
        assert!(again.is_success());
    }

    #[tokio::test]
    async fn loop_exits_after_last_handle_dropped() {
        let executor = Arc::new(GatedExecutor::new());
        let metrics = Arc::new(ExporterMetrics::new().expect("metrics"));
        let (dispatcher, handle) = Dispatcher::start(settings(1), executor, metrics);
        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exited")
            .expect("join");
    }

    // -----------------------------------------------------------------------
    // Real processes
    // -----------------------------------------------------------------------

    fn write_script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, body).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[tokio::test]
    async fn runs_scripts_from_script_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "hello.sh", "#!/bin/sh\necho hello\n");
        write_script(dir.path(), "fail.sh", "#!/bin/sh\nexit 1\n");

        let metrics = Arc::new(ExporterMetrics::new().expect("metrics"));
        let (dispatcher, _handle) = Dispatcher::start(
            DispatcherSettings {
                script_dir: dir.path().to_path_buf(),
                max_per_script: 1,
            },
            Arc::new(ProcessRunner::new()),
            Arc::clone(&metrics),
        );

        let hello = dispatcher.execute("hello.sh", RunContext::background()).await;
        assert!(hello.is_success());
        assert_eq!(hello.output, "hello\n");

        let fail = dispatcher.execute("fail.sh", RunContext::background()).await;
        assert_eq!(fail.output, "");
        assert_matches!(fail.error, Some(ExecError::ExitStatus(_)));
        assert_eq!(counter(&metrics, "script_errors_total"), 1.0);
        assert_eq!(counter(&metrics, "script_runs_total"), 2.0);
    }
}
