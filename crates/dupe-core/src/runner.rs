use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::command::{self, CommandSpec};
use crate::elevation::{self, Elevate, ExitClass};
use crate::error::{DupeError, Result};
use crate::reader::OutputStreamReader;

/// Default wait after process exit for buffered output to arrive.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Output lines kept for interpreting the exit of an elevated process.
const TAIL_LINES: usize = 8;

/// Sending half of a cancellation signal. Clones trigger the same token.
#[derive(Debug, Clone)]
pub struct CancelTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the trigger
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked trigger/token pair.
pub fn cancel_pair() -> (CancelTrigger, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx: Arc::new(tx) }, CancelToken { rx })
}

/// How the wait on the child ended.
enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Launches one command chain as a single process, elevating it when any
/// member asks for administrator rights, and streams its combined output.
///
/// Every output line is sent on the caller's line channel as soon as it is
/// complete. The call resolves only after the child has been reaped and both
/// output readers are detached, on every exit path, so no line is sent after
/// it returns.
#[derive(Debug, Clone)]
pub struct PrivilegedCommandRunner {
    elevation: Arc<dyn Elevate>,
    drain_grace: Duration,
    timeout: Option<Duration>,
}

impl PrivilegedCommandRunner {
    pub fn new(elevation: Arc<dyn Elevate>) -> Self {
        Self {
            elevation,
            drain_grace: DEFAULT_DRAIN_GRACE,
            timeout: None,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Kill the process and fail with [`DupeError::Timeout`] after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn elevation(&self) -> &dyn Elevate {
        self.elevation.as_ref()
    }

    /// Run a single command.
    pub async fn run(
        &self,
        command: &CommandSpec,
        lines: &UnboundedSender<String>,
        cancel: CancelToken,
    ) -> Result<()> {
        self.run_chain(std::slice::from_ref(command), lines, cancel)
            .await
    }

    /// Run a chain of commands joined with `&&` as one process.
    pub async fn run_chain(
        &self,
        chain: &[CommandSpec],
        lines: &UnboundedSender<String>,
        mut cancel: CancelToken,
    ) -> Result<()> {
        let program = command::chain_label(chain);
        if chain.is_empty() {
            return Err(DupeError::InvalidRequest("empty command chain".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(DupeError::Cancelled);
        }

        let script = command::render_chain(chain);
        let elevated = command::chain_requires_elevation(chain);
        let mut cmd = if elevated {
            self.elevation.command(&script)
        } else {
            let (shell, flag) = elevation::shell_command();
            let mut cmd = tokio::process::Command::new(shell);
            cmd.arg(flag).arg(&script);
            cmd
        };
        let group = !elevated || self.elevation.own_process_group();
        #[cfg(unix)]
        if group {
            cmd.process_group(0);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %program,
            elevation = if elevated { self.elevation.name() } else { "none" },
            script = %script,
            "spawning command"
        );
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| DupeError::CommandLaunch {
            program: program.clone(),
            message: e.to_string(),
        })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(OutputStreamReader::attach(
                stdout,
                line_sink(lines.clone(), tail.clone()),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(OutputStreamReader::attach(
                stderr,
                line_sink(lines.clone(), tail.clone()),
            ));
        }

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            after = deadline(self.timeout) => Exit::TimedOut(after),
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        if matches!(exit, Exit::TimedOut(_) | Exit::Cancelled) {
            if let Err(e) = terminate(&mut child, group, self.drain_grace).await {
                tracing::warn!(program = %program, error = %e, "failed to kill child process");
            }
        }

        for reader in readers {
            reader.detach(self.drain_grace).await;
        }

        let tail: Vec<String> = tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();

        let result = match exit {
            Exit::Status(Ok(status)) => self.interpret(&program, status, elevated, &tail),
            Exit::Status(Err(e)) => Err(DupeError::Io(e)),
            Exit::TimedOut(after) => Err(DupeError::Timeout {
                program: program.clone(),
                after,
            }),
            Exit::Cancelled => Err(DupeError::Cancelled),
        };

        tracing::debug!(
            program = %program,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "command finished"
        );
        result
    }

    fn interpret(
        &self,
        program: &str,
        status: ExitStatus,
        elevated: bool,
        tail: &[String],
    ) -> Result<()> {
        let Some(code) = status.code() else {
            // Terminated by a signal: no exit code to report.
            tracing::warn!(program, status = %status, "command terminated by signal");
            return Err(DupeError::CommandExit {
                program: program.to_string(),
                code: -1,
            });
        };

        let class = if elevated {
            self.elevation.classify_exit(code, tail)
        } else if code == 0 {
            ExitClass::Success
        } else {
            ExitClass::Failed(code)
        };

        match class {
            ExitClass::Success => Ok(()),
            ExitClass::Failed(code) => Err(DupeError::CommandExit {
                program: program.to_string(),
                code,
            }),
            ExitClass::Denied(message) => Err(DupeError::CommandLaunch {
                program: program.to_string(),
                message,
            }),
        }
    }
}

/// Build the per-stream callback: forward each line and remember the tail.
fn line_sink(
    tx: UnboundedSender<String>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> impl FnMut(String) + Send + 'static {
    move |line: String| {
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        // The receiver may have been dropped; output is then discarded.
        let _ = tx.send(line);
    }
}

/// Stop the child and the tools it started, then reap it.
///
/// SIGTERM goes to the whole process group when the child leads one, or to
/// the child alone otherwise (sudo relays it to its command). Once the child
/// has exited, or `grace` has passed, whatever is left gets SIGKILL.
#[cfg(unix)]
async fn terminate(child: &mut Child, group: bool, grace: Duration) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let Some(raw) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    let pid = Pid::from_raw(raw as i32);
    let send = |signal: Signal| {
        if group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        }
    };

    if let Err(errno) = send(Signal::SIGTERM) {
        tracing::debug!(pid = raw, %errno, "SIGTERM not delivered");
    }
    let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
    if exited && !group {
        return Ok(());
    }

    match send(Signal::SIGKILL) {
        // The group emptied out on SIGTERM.
        Err(Errno::ESRCH) if exited => Ok(()),
        Ok(()) if exited => Ok(()),
        Ok(()) => child.wait().await.map(|_| ()),
        Err(errno) => {
            tracing::debug!(pid = raw, %errno, "SIGKILL not delivered");
            if exited {
                Ok(())
            } else {
                child.kill().await
            }
        }
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _group: bool, _grace: Duration) -> std::io::Result<()> {
    // kill() also reaps the child.
    child.kill().await
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}
