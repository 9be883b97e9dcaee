//! Cancellation-safe subprocess execution.
//!
//! [`ProcessRunner::run`] spawns a command, copies stdout and stderr into
//! separate buffers from two independent tasks, and returns as soon as both
//! streams close *or* the [`RunContext`] fires. Waiting on the streams rather
//! than on the process alone keeps a child that forked helpers from pinning
//! the caller past its deadline.
//!
//! Killing the direct child does not kill processes it spawned. A shell
//! script that started `sleep 60` leaves that `sleep` running, holding its
//! copy of the pipes, after the run has been reported as timed out. Enable
//! [`ProcessRunner::kill_process_group`] to signal the whole process group
//! instead.

use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::context::{Interrupt, RunContext};
use crate::error::{ExecError, ExecErrorKind};

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Bytes past the limit are read and discarded so the child never blocks on
/// a full pipe. A run whose stdout overflowed fails with
/// [`ExecError::OutputTooLarge`], since a cut-off line may still parse.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Outcome of one script execution.
///
/// `output` holds whatever stdout was captured, which is partial when the run
/// was interrupted. It is only a complete result when `error` is `None`.
#[derive(Debug)]
pub struct ExecutionResult {
    pub output: String,
    pub error: Option<ExecError>,
}

impl ExecutionResult {
    pub fn success(output: String) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn failure(output: String, error: ExecError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ExecErrorKind> {
        self.error.as_ref().map(ExecError::kind)
    }

    /// Discard partial output on failure.
    pub fn into_result(self) -> Result<String, ExecError> {
        match self.error {
            None => Ok(self.output),
            Some(err) => Err(err),
        }
    }
}

/// Anything that can execute a script file under a [`RunContext`].
///
/// The dispatcher is generic over this so tests can substitute a scripted
/// executor for real processes.
pub trait ScriptExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &RunContext,
        script: &Path,
    ) -> impl Future<Output = ExecutionResult> + Send;
}

/// Spawns commands and classifies their outcome.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_process_group: bool,
    max_output_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            kill_process_group: false,
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    /// Start each child as its own process-group leader and signal the whole
    /// group on cancellation. Only effective on Unix.
    pub fn kill_process_group(mut self, enabled: bool) -> Self {
        self.kill_process_group = enabled;
        self
    }

    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    /// Run `program` with `args`, returning captured stdout and the error
    /// classification.
    ///
    /// Classification precedence:
    /// 1. context fired: [`ExecError::TimedOut`] or [`ExecError::Cancelled`],
    ///    whatever the process did;
    /// 2. non-zero exit or death by signal: [`ExecError::ExitStatus`];
    /// 3. clean exit with anything on stderr: [`ExecError::Stderr`];
    /// 4. clean exit with stdout past the cap: [`ExecError::OutputTooLarge`];
    /// 5. otherwise success.
    pub async fn run<I, S>(
        &self,
        ctx: &RunContext,
        program: impl AsRef<OsStr>,
        args: I,
    ) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if let Some(why) = ctx.err() {
            return ExecutionResult::failure(String::new(), interrupt_error(why));
        }

        let mut cmd = build_command(program.as_ref(), args);
        #[cfg(unix)]
        if self.kill_process_group {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failure(String::new(), ExecError::Spawn(e)),
        };

        let stdout = Capture::new(self.max_output_bytes);
        let stderr = Capture::new(self.max_output_bytes);
        let mut stdout_pump = tokio::spawn(pump(child.stdout.take(), stdout.clone()));
        let mut stderr_pump = tokio::spawn(pump(child.stderr.take(), stderr.clone()));

        // Both streams closing normally means the process is exiting; a
        // descendant holding a pipe open is handled by the context branch.
        let streams_closed = async {
            let _ = (&mut stdout_pump).await;
            let _ = (&mut stderr_pump).await;
        };
        let waited = tokio::select! {
            _ = streams_closed => None,
            why = ctx.done() => Some(Waited::Interrupted(why)),
        };
        let waited = match waited {
            Some(waited) => waited,
            None => tokio::select! {
                status = child.wait() => Waited::Exited(status),
                why = ctx.done() => Waited::Interrupted(why),
            },
        };

        if let Waited::Interrupted(why) = waited {
            tracing::debug!(interrupt = ?why, pid = ?child.id(), "Terminating interrupted child");
            self.terminate(&mut child).await;
            stdout_pump.abort();
            stderr_pump.abort();
        }

        let error = classify(waited, &stderr.snapshot(), &stdout);
        ExecutionResult {
            output: stdout.snapshot(),
            error,
        }
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if self.kill_process_group {
            if let Some(pid) = child.id() {
                signal_process_group(pid);
            }
        }
        // The child may have exited between the context firing and now.
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Child already gone");
        }
        if let Err(e) = child.wait().await {
            tracing::warn!(error = %e, "Failed to reap killed child");
        }
    }
}

impl ScriptExecutor for ProcessRunner {
    async fn execute(&self, ctx: &RunContext, script: &Path) -> ExecutionResult {
        self.run(ctx, script, std::iter::empty::<&OsStr>()).await
    }
}

/// Run `program` with the default [`ProcessRunner`].
pub async fn run_command<I, S>(
    ctx: &RunContext,
    program: impl AsRef<OsStr>,
    args: I,
) -> ExecutionResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    ProcessRunner::new().run(ctx, program, args).await
}

/// Run `program`, reading its output only after the child has exited.
///
/// Not used for serving requests. It exists to pin down why
/// [`ProcessRunner::run`] pumps streams independently: here the direct child
/// is killed promptly on cancellation, but reading to end-of-file still waits
/// for every descendant that inherited the pipes, so a script that started a
/// long `sleep` keeps this call blocked long after its deadline. A child that
/// fills a pipe buffer also stalls until the deadline.
pub async fn run_command_unpumped<I, S>(
    ctx: &RunContext,
    program: impl AsRef<OsStr>,
    args: I,
) -> ExecutionResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if let Some(why) = ctx.err() {
        return ExecutionResult::failure(String::new(), interrupt_error(why));
    }

    let mut child = match build_command(program.as_ref(), args).spawn() {
        Ok(child) => child,
        Err(e) => return ExecutionResult::failure(String::new(), ExecError::Spawn(e)),
    };
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        why = ctx.done() => Waited::Interrupted(why),
    };
    if let Waited::Interrupted(_) = waited {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    let stdout = Capture::new(MAX_OUTPUT_BYTES);
    let stderr = Capture::new(MAX_OUTPUT_BYTES);
    pump(stdout_pipe, stdout.clone()).await;
    pump(stderr_pipe, stderr.clone()).await;

    let error = classify(waited, &stderr.snapshot(), &stdout);
    ExecutionResult {
        output: stdout.snapshot(),
        error,
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Interrupted(Interrupt),
}

fn build_command<I, S>(program: &OsStr, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn classify(waited: Waited, stderr: &str, stdout: &Capture) -> Option<ExecError> {
    match waited {
        Waited::Interrupted(why) => Some(interrupt_error(why)),
        Waited::Exited(Err(e)) => Some(ExecError::Io(e)),
        Waited::Exited(Ok(status)) if !status.success() => Some(ExecError::ExitStatus(status)),
        Waited::Exited(Ok(_)) if !stderr.is_empty() => {
            Some(ExecError::Stderr(stderr.to_string()))
        }
        Waited::Exited(Ok(_)) if stdout.truncated() => Some(ExecError::OutputTooLarge {
            limit: stdout.limit,
        }),
        Waited::Exited(Ok(_)) => None,
    }
}

fn interrupt_error(why: Interrupt) -> ExecError {
    match why {
        Interrupt::Cancelled => ExecError::Cancelled,
        Interrupt::DeadlineExceeded => ExecError::TimedOut,
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32) {
    // Safety: kill(2) takes plain integers and touches no memory of ours.
    // The child leads its own group, so its pid is the group id.
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if ret != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to signal process group",
        );
    }
}

/// Shared, size-capped byte buffer filled by a pump task.
#[derive(Clone)]
struct Capture {
    buf: Arc<Mutex<CaptureBuf>>,
    limit: usize,
}

#[derive(Default)]
struct CaptureBuf {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(CaptureBuf::default())),
            limit,
        }
    }

    fn append(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let room = self.limit.saturating_sub(buf.bytes.len());
        if chunk.len() > room {
            buf.truncated = true;
        }
        buf.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Whether any bytes were dropped at the cap.
    fn truncated(&self) -> bool {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).truncated
    }

    fn snapshot(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf.bytes).into_owned()
    }
}

/// Copy `stream` into `sink` until end-of-file or a read error.
async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, sink: Capture) {
    let Some(mut stream) = stream else {
        return;
    };
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.append(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
