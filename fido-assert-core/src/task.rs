//! Per-device assertion task.
//!
//! An [`AssertionTask`] drives one device through a sign operation:
//!
//! ```text
//! Idle -> ProbingProtocol -> ModernAttempt -> LegacyFallback -> Completed
//!                         \__________________/
//! ```
//!
//! Modern is always tried first. A modern `ProtocolMismatch` or
//! `UnsupportedOption` falls back to exactly one legacy exchange; every
//! other failure is terminal. Transitions are computed by the pure
//! [`next`] function; the spawned driver only performs I/O and applies
//! them.
//!
//! The terminal outcome is sent to the owner as a [`TaskReport`] and only
//! becomes the task's state once the owner [accepts](TaskReport::accept)
//! it. A task cancelled in between stays `Cancelled` and its report is
//! discarded.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::device::{Capability, DeviceHandle, DeviceId, ProtocolVersion, ResponseCode};
use crate::operation::SignOperation;
use crate::request::AssertionRequest;
use crate::response::AssertionResponse;

/// Device-local reason a task failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskFailure {
    #[error("user action timeout")]
    UserActionTimeout,

    #[error("unsupported option")]
    UnsupportedOption,

    #[error("no matching credential on device")]
    InvalidCredential,

    #[error("protocol mismatch")]
    ProtocolMismatch,

    #[error("transport error")]
    TransportError,

    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("task already started")]
    AlreadyStarted,
}

impl TaskFailure {
    /// Failure reason for a response code; `None` for `Success`.
    pub fn from_code(code: ResponseCode) -> Option<Self> {
        match code {
            ResponseCode::Success => None,
            ResponseCode::UserActionTimeout => Some(Self::UserActionTimeout),
            ResponseCode::UnsupportedOption => Some(Self::UnsupportedOption),
            ResponseCode::InvalidCredential => Some(Self::InvalidCredential),
            ResponseCode::ProtocolMismatch => Some(Self::ProtocolMismatch),
            ResponseCode::TransportError => Some(Self::TransportError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure(TaskFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    ProbingProtocol,
    ModernAttempt,
    LegacyFallback,
    Completed(Completion),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    CapabilityKnown(Capability),
    ProbeFailed,
    Reply(ResponseCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enter(TaskState),
    Finish(Completion),
    /// The event has no meaning in this state.
    Ignore,
}

/// Transition table of the assertion task.
pub fn next(state: &TaskState, event: TaskEvent) -> Transition {
    use TaskEvent::*;
    use TaskState::*;

    match (state, event) {
        (Idle, Start) => Transition::Enter(ProbingProtocol),

        (ProbingProtocol, CapabilityKnown(Capability::SupportsModernProtocol)) => {
            Transition::Enter(ModernAttempt)
        }
        (ProbingProtocol, CapabilityKnown(Capability::LegacyOnly)) => {
            Transition::Enter(LegacyFallback)
        }
        (ProbingProtocol, ProbeFailed) => {
            Transition::Finish(Completion::Failure(TaskFailure::TransportError))
        }

        (
            ModernAttempt,
            Reply(ResponseCode::ProtocolMismatch | ResponseCode::UnsupportedOption),
        ) => Transition::Enter(LegacyFallback),
        (ModernAttempt | LegacyFallback, Reply(code)) => Transition::Finish(
            TaskFailure::from_code(code).map_or(Completion::Success, Completion::Failure),
        ),

        _ => Transition::Ignore,
    }
}

/// Terminal result carried by a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(AssertionResponse),
    Failure(TaskFailure),
}

impl TaskOutcome {
    fn completion(&self) -> Completion {
        match self {
            Self::Success(_) => Completion::Success,
            Self::Failure(reason) => Completion::Failure(*reason),
        }
    }
}

/// One exchange made by a task, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub protocol: ProtocolVersion,
    pub code: ResponseCode,
}

struct TaskInner {
    state: TaskState,
    /// Held until the driver takes it on start.
    device: Option<DeviceHandle>,
}

struct TaskShared {
    id: DeviceId,
    inner: Mutex<TaskInner>,
}

impl TaskShared {
    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Terminal notification from a task to its owner.
pub struct TaskReport {
    shared: Arc<TaskShared>,
    outcome: TaskOutcome,
    attempts: Vec<Attempt>,
    device: Option<DeviceHandle>,
    /// The task state already records this outcome.
    settled: bool,
}

/// A report the owner has accepted as the task's terminal event.
#[derive(Debug)]
pub struct AcceptedReport {
    pub device_id: DeviceId,
    pub outcome: TaskOutcome,
    pub attempts: Vec<Attempt>,
    /// Returned to the owner when the driver still held it.
    pub device: Option<DeviceHandle>,
}

impl TaskReport {
    pub fn device_id(&self) -> &DeviceId {
        &self.shared.id
    }

    pub fn outcome(&self) -> &TaskOutcome {
        &self.outcome
    }

    /// Whether this report was produced by `task`.
    pub fn is_from(&self, task: &AssertionTask) -> bool {
        Arc::ptr_eq(&self.shared, &task.shared)
    }

    /// Record the outcome as the task's terminal state.
    ///
    /// Returns `None` when the task was cancelled or otherwise finished
    /// after the report was sent; the report must then be ignored.
    pub fn accept(self) -> Option<AcceptedReport> {
        {
            let mut inner = self.shared.lock();
            match inner.state {
                TaskState::Cancelled => return None,
                TaskState::Completed(_) if !self.settled => return None,
                TaskState::Completed(_) => {}
                _ => inner.state = TaskState::Completed(self.outcome.completion()),
            }
        }

        Some(AcceptedReport {
            device_id: self.shared.id.clone(),
            outcome: self.outcome,
            attempts: self.attempts,
            device: self.device,
        })
    }
}

impl std::fmt::Debug for TaskReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReport")
            .field("device_id", &self.shared.id)
            .field("outcome", &self.outcome)
            .field("attempts", &self.attempts)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Sign operation against one device.
pub struct AssertionTask {
    shared: Arc<TaskShared>,
    reports: mpsc::UnboundedSender<TaskReport>,
}

impl AssertionTask {
    /// Create an idle task that will send its terminal report to `reports`.
    pub fn new(device: DeviceHandle, reports: mpsc::UnboundedSender<TaskReport>) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: device.id().clone(),
                inner: Mutex::new(TaskInner {
                    state: TaskState::Idle,
                    device: Some(device),
                }),
            }),
            reports,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    /// Begin execution on the current tokio runtime.
    ///
    /// A second call while the task is running fails the task with
    /// [`TaskFailure::AlreadyStarted`]. Calls after a terminal state have
    /// no effect.
    pub fn start(&self, request: Arc<AssertionRequest>) {
        let mut inner = self.shared.lock();

        if let Transition::Enter(state) = next(&inner.state, TaskEvent::Start) {
            if let Some(device) = inner.device.take() {
                inner.state = state;
                let span = tracing::info_span!("assertion_task", device = %self.shared.id);
                let driver = Driver {
                    shared: Arc::clone(&self.shared),
                    reports: self.reports.clone(),
                    request,
                    device,
                    attempts: Vec::new(),
                };
                tokio::spawn(driver.run().instrument(span));
                return;
            }
        }

        if inner.state.is_terminal() {
            debug!(device = %self.shared.id, "Start ignored on finished task");
            return;
        }

        warn!(device = %self.shared.id, "Task started twice");
        self.finish_now(&mut inner, TaskFailure::AlreadyStarted);
    }

    /// Abandon the task. In-flight I/O runs to completion but its result is
    /// discarded. Idempotent.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = TaskState::Cancelled;
        inner.device = None;
        debug!(device = %self.shared.id, "Task cancelled");
    }

    /// The device went away: fail with [`TaskFailure::DeviceDisconnected`].
    ///
    /// Returns `false` if the task had already finished.
    pub fn disconnect(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state.is_terminal() {
            return false;
        }
        info!(device = %self.shared.id, "Device disconnected");
        self.finish_now(&mut inner, TaskFailure::DeviceDisconnected);
        true
    }

    /// Enter a failed terminal state immediately and report it.
    ///
    /// Only reachable from a non-terminal state, so it runs at most once. A
    /// driver report already in flight is refused by [`TaskReport::accept`].
    fn finish_now(&self, inner: &mut TaskInner, reason: TaskFailure) {
        inner.state = TaskState::Completed(Completion::Failure(reason));
        inner.device = None;

        let report = TaskReport {
            shared: Arc::clone(&self.shared),
            outcome: TaskOutcome::Failure(reason),
            attempts: Vec::new(),
            device: None,
            settled: true,
        };
        if self.reports.send(report).is_err() {
            debug!(device = %self.shared.id, "Report receiver gone");
        }
    }
}

impl std::fmt::Debug for AssertionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionTask")
            .field("device_id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Spawned half of a task. Owns the device while it runs.
struct Driver {
    shared: Arc<TaskShared>,
    reports: mpsc::UnboundedSender<TaskReport>,
    request: Arc<AssertionRequest>,
    device: DeviceHandle,
    attempts: Vec<Attempt>,
}

impl Driver {
    async fn run(mut self) {
        let mut state = TaskState::ProbingProtocol;
        let mut response = None;

        loop {
            let event = match state {
                TaskState::ProbingProtocol => self.probe().await,
                TaskState::ModernAttempt => {
                    let (event, resp) = self.attempt(ProtocolVersion::Modern).await;
                    response = resp;
                    event
                }
                TaskState::LegacyFallback => {
                    let (event, resp) = self.attempt(ProtocolVersion::Legacy).await;
                    response = resp;
                    event
                }
                _ => return,
            };

            let transition = {
                let mut inner = self.shared.lock();
                if inner.state.is_terminal() {
                    debug!(state = ?inner.state, "Result discarded");
                    return;
                }

                let transition = match next(&inner.state, event) {
                    Transition::Ignore => {
                        warn!(state = ?inner.state, event = ?event, "Unexpected event");
                        Transition::Finish(Completion::Failure(TaskFailure::TransportError))
                    }
                    transition => transition,
                };
                if let Transition::Enter(next_state) = transition {
                    inner.state = next_state;
                }
                transition
            };

            match transition {
                Transition::Enter(next_state) => {
                    debug!(from = ?state, to = ?next_state, "Task transition");
                    state = next_state;
                }
                Transition::Finish(completion) => {
                    let outcome = match (completion, response.take()) {
                        (Completion::Success, Some(response)) => TaskOutcome::Success(response),
                        (Completion::Success, None) => {
                            TaskOutcome::Failure(TaskFailure::TransportError)
                        }
                        (Completion::Failure(reason), _) => TaskOutcome::Failure(reason),
                    };
                    self.report(outcome);
                    return;
                }
                Transition::Ignore => return,
            }
        }
    }

    async fn probe(&mut self) -> TaskEvent {
        if let Some(capability) = self.device.capability() {
            return TaskEvent::CapabilityKnown(capability);
        }

        match self.device.transport().probe_capability().await {
            Ok(capability) => {
                debug!(capability = ?capability, "Capability probed");
                self.device.remember_capability(capability);
                TaskEvent::CapabilityKnown(capability)
            }
            Err(e) => {
                warn!(error = %e, "Capability probe failed");
                TaskEvent::ProbeFailed
            }
        }
    }

    async fn attempt(
        &mut self,
        protocol: ProtocolVersion,
    ) -> (TaskEvent, Option<AssertionResponse>) {
        let reply = SignOperation::new(&self.device, protocol)
            .execute(&self.request)
            .await;
        self.attempts.push(Attempt {
            protocol,
            code: reply.code,
        });
        (TaskEvent::Reply(reply.code), reply.response)
    }

    fn report(self, outcome: TaskOutcome) {
        match &outcome {
            TaskOutcome::Success(_) => info!(attempts = self.attempts.len(), "Assertion obtained"),
            TaskOutcome::Failure(reason) => {
                warn!(reason = %reason, attempts = ?self.attempts, "Task failed")
            }
        }

        let report = TaskReport {
            shared: self.shared,
            outcome,
            attempts: self.attempts,
            device: Some(self.device),
            settled: false,
        };
        if self.reports.send(report).is_err() {
            debug!("Report receiver gone");
        }
    }
}
