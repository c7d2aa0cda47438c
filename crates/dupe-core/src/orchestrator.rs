use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DupeConfig;
use crate::elevation::Elevate;
use crate::error::{DupeError, Result};
use crate::events::{Event, OperationId, OperationStatus, OutputEvent};
use crate::operation::{OperationKind, OperationRequest, Plan, ProgressMode, Step};
use crate::progress::{self, Heartbeat};
use crate::runner::{CancelToken, CancelTrigger, PrivilegedCommandRunner, cancel_pair};

/// Mode applied to a freshly created image: owner read/write, everyone read.
pub const IMAGE_MODE: u32 = 0o644;

/// Lifecycle of one operation. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    /// Running step `step` (one-based) of `of`.
    Running { step: usize, of: usize },
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Terminal result of an operation. Exactly one per accepted request.
#[derive(Debug)]
pub enum OperationOutcome {
    Succeeded,
    /// The first failing step's error. Later steps never ran.
    Failed(DupeError),
    Cancelled,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Succeeded)
    }

    pub fn status(&self) -> OperationStatus {
        match self {
            OperationOutcome::Succeeded => OperationStatus::Succeeded,
            OperationOutcome::Failed(_) => OperationStatus::Failed,
            OperationOutcome::Cancelled => OperationStatus::Cancelled,
        }
    }
}

/// Runs operations as ordered steps of privileged command chains.
///
/// Each accepted operation runs on its own tokio task and reports through an
/// [`Event`] channel owned by its [`OperationHandle`]. Cloning the
/// orchestrator shares the operation counter and the busy flag.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<DupeConfig>,
    runner: PrivilegedCommandRunner,
    next_id: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Build an orchestrator that elevates with the configured method.
    pub fn new(config: DupeConfig) -> Self {
        let elevation: Arc<dyn Elevate> = Arc::new(config.elevation);
        Self::with_elevation(config, elevation)
    }

    /// Build an orchestrator with a custom elevation mechanism.
    pub fn with_elevation(config: DupeConfig, elevation: Arc<dyn Elevate>) -> Self {
        let runner = PrivilegedCommandRunner::new(elevation)
            .with_drain_grace(config.drain_grace())
            .with_timeout(config.step_timeout());
        Self {
            config: Arc::new(config),
            runner,
            next_id: Arc::new(AtomicU64::new(1)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DupeConfig {
        &self.config
    }

    /// Whether an operation started by this orchestrator is still running.
    /// Only tracked in exclusive mode.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Validate and plan `request`, then start it on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: OperationRequest) -> Result<OperationHandle> {
        request.validate()?;
        let plan = Plan::for_request(&request, &self.config.tools);
        self.start_plan(plan)
    }

    /// Start an already-built plan on a background task.
    pub fn start_plan(&self, plan: Plan) -> Result<OperationHandle> {
        if plan.steps.is_empty() {
            return Err(DupeError::InvalidRequest("operation has no steps".to_string()));
        }
        let guard = self.acquire()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = plan.kind;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(OperationState::Idle);
        let (trigger, token) = cancel_pair();

        let execution = Execution {
            id,
            runner: self.runner.clone(),
            heartbeat_interval: self.config.heartbeat_interval(),
            heartbeat_increment: self.config.heartbeat_increment,
            events: event_tx,
            state: state_tx,
            high_water: None,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            execution.execute(plan, token).await
        });

        Ok(OperationHandle {
            id,
            kind,
            events: Some(event_rx),
            state: state_rx,
            cancel: trigger,
            task,
        })
    }

    fn acquire(&self) -> Result<BusyGuard> {
        if !self.config.exclusive {
            return Ok(BusyGuard(None));
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DupeError::Busy)?;
        Ok(BusyGuard(Some(self.busy.clone())))
    }
}

/// Clears the busy flag when the operation task ends, however it ends.
struct BusyGuard(Option<Arc<AtomicBool>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.0 {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Caller's side of a running operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    kind: OperationKind,
    events: Option<UnboundedReceiver<Event>>,
    state: watch::Receiver<OperationState>,
    cancel: CancelTrigger,
    task: JoinHandle<OperationOutcome>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Take the event receiver. Returns `None` after the first call.
    ///
    /// The stream ends once the operation task has finished.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<Event>> {
        self.events.take()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<OperationState> {
        self.state.clone()
    }

    /// Request cancellation: the running step's process is killed and the
    /// operation resolves as cancelled. No effect once it has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A trigger that cancels this operation, usable from another task.
    pub fn canceller(&self) -> CancelTrigger {
        self.cancel.clone()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> OperationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => OperationOutcome::Failed(DupeError::Io(std::io::Error::other(format!(
                "operation task failed: {e}"
            )))),
        }
    }
}

/// State owned by one operation's task.
struct Execution {
    id: OperationId,
    runner: PrivilegedCommandRunner,
    heartbeat_interval: Duration,
    heartbeat_increment: f64,
    events: UnboundedSender<Event>,
    state: watch::Sender<OperationState>,
    /// Highest overall progress emitted so far.
    high_water: Option<f64>,
}

impl Execution {
    async fn execute(mut self, plan: Plan, cancel: CancelToken) -> OperationOutcome {
        let started = Instant::now();
        let total = plan.steps.len();
        tracing::info!(id = self.id, kind = %plan.kind, steps = total, "operation started");
        self.emit(Event::OperationStarted {
            id: self.id,
            kind: plan.kind,
            steps: total,
        });
        self.progress(0.0);

        for (index, step) in plan.steps.iter().enumerate() {
            self.state.send_replace(OperationState::Running {
                step: index + 1,
                of: total,
            });
            for line in &step.intro {
                self.info(line.clone());
            }
            tracing::info!(id = self.id, step = index + 1, of = total, label = %step.label, "step started");
            self.emit(Event::StepStarted {
                id: self.id,
                index,
                total,
                label: step.label.clone(),
            });

            let step_started = Instant::now();
            let result = self.run_step(step, cancel.clone()).await;
            let duration = step_started.elapsed();
            tracing::info!(
                id = self.id,
                step = index + 1,
                success = result.is_ok(),
                elapsed_ms = duration.as_millis() as u64,
                "step finished"
            );
            self.emit(Event::StepFinished {
                id: self.id,
                index,
                success: result.is_ok(),
                duration,
            });

            if let Err(e) = result {
                return self.finish(Err(e), started);
            }

            self.progress(step.span.scale(1.0));
            if let Some(path) = &step.normalize_permissions
                && let Some(warning) = normalize_image_permissions(path)
            {
                self.emit(Event::Warning {
                    id: self.id,
                    message: warning,
                });
            }
            for line in &step.outro {
                self.info(line.clone());
            }
        }

        self.progress(1.0);
        self.finish(Ok(()), started)
    }

    /// Run one step's chain, turning its output into events as it arrives.
    ///
    /// The heartbeat lives inside the same select loop that observes the
    /// chain's completion, so once completion is seen no tick can follow.
    async fn run_step(&mut self, step: &Step, cancel: CancelToken) -> Result<()> {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let runner = self.runner.clone();
        let run = runner.run_chain(&step.commands, &line_tx, cancel);
        tokio::pin!(run);

        let mut heartbeat = match step.mode {
            ProgressMode::Heartbeat => Some(Heartbeat::new(
                self.heartbeat_interval,
                self.heartbeat_increment,
                Heartbeat::DEFAULT_CEILING,
            )),
            ProgressMode::Parsed => None,
        };

        let result = loop {
            tokio::select! {
                biased;
                Some(line) = line_rx.recv() => self.on_line(step, line),
                result = &mut run => break result,
                Some(fraction) = next_tick(&mut heartbeat) => {
                    self.progress(step.span.scale(fraction));
                }
            }
        };
        drop(heartbeat);

        // The runner has detached its readers; whatever is queued is final.
        while let Ok(line) = line_rx.try_recv() {
            self.on_line(step, line);
        }
        result
    }

    fn on_line(&mut self, step: &Step, line: String) {
        let fraction = progress::extract(&line);
        self.emit(Event::Output(OutputEvent {
            operation: self.id,
            line,
        }));
        if let Some(fraction) = fraction {
            self.progress(step.span.scale(fraction));
        }
    }

    /// Emit overall progress, clamped into [0, 1] and to the running maximum.
    fn progress(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if self.high_water.is_some_and(|high| value <= high) {
            return;
        }
        self.high_water = Some(value);
        self.emit(Event::Progress { id: self.id, value });
    }

    fn info(&self, message: String) {
        self.emit(Event::Info {
            id: self.id,
            message,
        });
    }

    fn finish(self, result: Result<()>, started: Instant) -> OperationOutcome {
        let duration = started.elapsed();
        let (state, outcome) = match result {
            Ok(()) => (OperationState::Succeeded, OperationOutcome::Succeeded),
            Err(DupeError::Cancelled) => (OperationState::Cancelled, OperationOutcome::Cancelled),
            Err(e) => (OperationState::Failed, OperationOutcome::Failed(e)),
        };
        let message = match &outcome {
            OperationOutcome::Failed(e) => Some(e.to_string()),
            _ => None,
        };

        match &message {
            Some(reason) => tracing::warn!(id = self.id, reason = %reason, "operation failed"),
            None => tracing::info!(
                id = self.id,
                status = ?outcome.status(),
                elapsed_ms = duration.as_millis() as u64,
                "operation finished"
            ),
        }

        self.state.send_replace(state);
        self.emit(Event::OperationFinished {
            id: self.id,
            status: outcome.status(),
            message,
            duration,
        });
        outcome
    }

    fn emit(&self, event: Event) {
        // The handle may have dropped its receiver; the operation still runs.
        let _ = self.events.send(event);
    }
}

async fn next_tick(heartbeat: &mut Option<Heartbeat>) -> Option<f64> {
    match heartbeat {
        Some(heartbeat) => heartbeat.tick().await,
        None => std::future::pending().await,
    }
}

/// Best-effort: make a created image world-readable from the unprivileged
/// side. The elevated chain has usually done this already. Returns a
/// user-facing warning when it could not be done.
fn normalize_image_permissions(path: &Path) -> Option<String> {
    match set_image_mode(path) {
        Ok(true) => {
            tracing::debug!(path = %path.display(), "image permissions normalized");
            None
        }
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not normalize image permissions"
            );
            Some(format!(
                "could not set permissions of {} to 644: {e}",
                path.display()
            ))
        }
    }
}

/// Returns `true` if the mode was changed.
#[cfg(unix)]
fn set_image_mode(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode == IMAGE_MODE {
        return Ok(false);
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(IMAGE_MODE))?;
    Ok(true)
}

#[cfg(not(unix))]
fn set_image_mode(_path: &Path) -> std::io::Result<bool> {
    Ok(false)
}
