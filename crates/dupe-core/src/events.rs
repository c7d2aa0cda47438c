use std::time::Duration;

use crate::operation::OperationKind;

/// Identifier assigned to an operation when it is accepted. Stamped on every
/// event so consumers can tell concurrent operations apart.
pub type OperationId = u64;

/// One trimmed, non-empty line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub operation: OperationId,
    pub line: String,
}

/// How an operation ended, as reported on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Events emitted by the orchestrator while an operation runs.
///
/// These decouple execution from presentation: the CLI progress bar, a JSON
/// logger or a test all consume the same stream. Within one operation events
/// arrive in emission order and `OperationFinished` is always last.
#[derive(Debug, Clone)]
pub enum Event {
    /// The operation was accepted and its plan has `steps` steps.
    OperationStarted {
        id: OperationId,
        kind: OperationKind,
        steps: usize,
    },
    /// Step `index` (zero-based) of `total` is about to launch.
    StepStarted {
        id: OperationId,
        index: usize,
        total: usize,
        label: String,
    },
    StepFinished {
        id: OperationId,
        index: usize,
        success: bool,
        duration: Duration,
    },
    /// A raw line of output from the running tool.
    Output(OutputEvent),
    /// A transcript line produced by the orchestrator itself.
    Info { id: OperationId, message: String },
    /// Overall progress in [0, 1]. Never decreases within one operation.
    Progress { id: OperationId, value: f64 },
    /// Something went wrong that does not fail the operation.
    Warning { id: OperationId, message: String },
    /// Terminal event. `message` carries the failure description.
    OperationFinished {
        id: OperationId,
        status: OperationStatus,
        message: Option<String>,
        duration: Duration,
    },
}

impl Event {
    /// The operation this event belongs to.
    pub fn operation(&self) -> OperationId {
        match self {
            Event::OperationStarted { id, .. }
            | Event::StepStarted { id, .. }
            | Event::StepFinished { id, .. }
            | Event::Info { id, .. }
            | Event::Progress { id, .. }
            | Event::Warning { id, .. }
            | Event::OperationFinished { id, .. } => *id,
            Event::Output(output) => output.operation,
        }
    }
}
