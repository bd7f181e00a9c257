//! Multi-device race coordinator.
//!
//! [`AssertionRace::submit`] starts one [`AssertionTask`] per device and
//! resolves with the first success. Before the winner is delivered every
//! other task is cancelled, so late successes are discarded.
//!
//! ## Features
//!
//! - **Hot-plug**: devices attached through a [`RaceController`] join the
//!   running race; detached devices fail with `DeviceDisconnected`
//! - **Transport retry**: a device failing with `TransportError` is
//!   re-run with exponential backoff, up to `transport_retries` times
//! - **Deadline**: optional aggregate timeout resolving `Timeout`
//!
//! All resolution decisions live in the synchronous `RaceState`; the async
//! loop only feeds it events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::env_parse;
use crate::device::{DeviceHandle, DeviceId};
use crate::error::RequestError;
use crate::request::AssertionRequest;
use crate::response::AssertionResponse;
use crate::task::{AcceptedReport, AssertionTask, TaskFailure, TaskOutcome, TaskReport};

/// Caller-visible result of a race.
pub type RaceResult = std::result::Result<AssertionResponse, RequestError>;

/// Race coordinator settings.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Aggregate deadline for the whole race; `None` waits indefinitely.
    pub deadline: Option<Duration>,
    /// Re-runs allowed per device after a transport error.
    pub transport_retries: u32,
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            deadline: None,
            transport_retries: 0,
            retry_initial_interval: Duration::from_millis(100),
            retry_max_interval: Duration::from_secs(2),
        }
    }
}

impl RaceConfig {
    /// Load from `FIDO_RACE_DEADLINE_SECS`, `FIDO_TRANSPORT_RETRIES`,
    /// `FIDO_RETRY_INITIAL_MS` and `FIDO_RETRY_MAX_MS`. Missing or
    /// unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            deadline: env_parse::<u64>("FIDO_RACE_DEADLINE_SECS")
                .map(Duration::from_secs)
                .or(defaults.deadline),
            transport_retries: env_parse("FIDO_TRANSPORT_RETRIES")
                .unwrap_or(defaults.transport_retries),
            retry_initial_interval: env_parse("FIDO_RETRY_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_interval),
            retry_max_interval: env_parse("FIDO_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_interval),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// Entry point for running sign requests against a set of devices.
#[derive(Debug, Clone, Default)]
pub struct AssertionRace {
    config: RaceConfig,
}

impl AssertionRace {
    pub fn new(config: RaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    /// Start a race for `request` over `devices`.
    ///
    /// Must be called from within a tokio runtime. With no devices the race
    /// stays pending until one is attached, the deadline passes or it is
    /// cancelled.
    pub fn submit(
        &self,
        request: AssertionRequest,
        devices: Vec<DeviceHandle>,
    ) -> PendingAssertion {
        let request_id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (mut state, reports_rx) = RaceState::new(self.config.clone(), Arc::new(request));

        let span = tracing::info_span!(
            "assertion_race",
            request_id = %request_id,
            rp_id = %state.request.rp_id()
        );
        span.in_scope(|| {
            info!(devices = devices.len(), "Race submitted");
            for device in devices {
                state.attach(device);
            }
        });

        let deadline = self.config.deadline;
        tokio::spawn(
            run_race(state, reports_rx, commands_rx, result_tx, deadline).instrument(span),
        );

        PendingAssertion {
            request_id,
            controller: RaceController {
                commands: commands_tx,
            },
            result: result_rx,
        }
    }
}

enum RaceCommand {
    Attach(DeviceHandle),
    Detach(DeviceId),
    CancelAll,
}

/// Handle for changing a running race. Cheap to clone.
#[derive(Clone)]
pub struct RaceController {
    commands: mpsc::UnboundedSender<RaceCommand>,
}

impl RaceController {
    /// Add a hot-plugged device. Ignored once the race has resolved.
    pub fn attach(&self, device: DeviceHandle) {
        self.send(RaceCommand::Attach(device));
    }

    /// Report that a device was removed.
    pub fn detach(&self, device: impl Into<DeviceId>) {
        self.send(RaceCommand::Detach(device.into()));
    }

    /// Cancel every task and resolve with [`RequestError::UserCancelled`].
    pub fn cancel_all(&self) {
        self.send(RaceCommand::CancelAll);
    }

    fn send(&self, command: RaceCommand) {
        if self.commands.send(command).is_err() {
            debug!("Race already finished");
        }
    }
}

/// A submitted race that has not been awaited yet.
pub struct PendingAssertion {
    request_id: Uuid,
    controller: RaceController,
    result: oneshot::Receiver<RaceResult>,
}

impl PendingAssertion {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn controller(&self) -> RaceController {
        self.controller.clone()
    }

    pub fn cancel_all(&self) {
        self.controller.cancel_all();
    }

    /// Wait for the race to resolve.
    pub async fn wait(self) -> RaceResult {
        self.result
            .await
            .unwrap_or(Err(RequestError::AllDevicesFailed))
    }
}

struct Slot {
    task: AssertionTask,
    retries: u32,
    backoff: ExponentialBackoff,
    /// Device waiting out a retry delay.
    parked: Option<DeviceHandle>,
    /// Final failure, once the device is out of the race.
    failure: Option<TaskFailure>,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.failure.is_none()
    }
}

/// What the event loop must do next.
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    Retry { device: DeviceId, delay: Duration },
    Resolve(RaceResult),
}

/// Resolution logic of one race. Sole owner of its tasks.
pub(crate) struct RaceState {
    config: RaceConfig,
    request: Arc<AssertionRequest>,
    reports: mpsc::UnboundedSender<TaskReport>,
    slots: BTreeMap<DeviceId, Slot>,
    resolved: bool,
}

impl RaceState {
    pub(crate) fn new(
        config: RaceConfig,
        request: Arc<AssertionRequest>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskReport>) {
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let state = Self {
            config,
            request,
            reports,
            slots: BTreeMap::new(),
            resolved: false,
        };
        (state, reports_rx)
    }

    fn spawn_task(&self, device: DeviceHandle) -> AssertionTask {
        let task = AssertionTask::new(device, self.reports.clone());
        task.start(Arc::clone(&self.request));
        task
    }

    pub(crate) fn attach(&mut self, device: DeviceHandle) -> Step {
        let id = device.id().clone();
        if self.resolved {
            debug!(device = %id, "Attach after resolution ignored");
            return Step::Continue;
        }
        if self.slots.get(&id).is_some_and(Slot::is_live) {
            warn!(device = %id, "Device already in race");
            return Step::Continue;
        }

        info!(device = %id, "Device attached");
        let task = self.spawn_task(device);
        self.slots.insert(
            id,
            Slot {
                task,
                retries: 0,
                backoff: self.config.backoff(),
                parked: None,
                failure: None,
            },
        );
        Step::Continue
    }

    pub(crate) fn on_report(&mut self, report: TaskReport) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        let Some(slot) = self.slots.get_mut(report.device_id()) else {
            return Step::Continue;
        };
        if !report.is_from(&slot.task) {
            debug!(device = %report.device_id(), "Report from replaced task ignored");
            return Step::Continue;
        }
        let Some(AcceptedReport {
            device_id,
            outcome,
            attempts,
            device,
        }) = report.accept()
        else {
            return Step::Continue;
        };

        match outcome {
            TaskOutcome::Success(response) => {
                info!(
                    device = %device_id,
                    credential = %hex::encode(&response.credential_id),
                    attempts = attempts.len(),
                    "Race won"
                );
                self.resolved = true;
                self.cancel_others(&device_id);
                Step::Resolve(Ok(response))
            }
            TaskOutcome::Failure(TaskFailure::TransportError)
                if slot.retries < self.config.transport_retries && device.is_some() =>
            {
                slot.retries += 1;
                slot.parked = device;
                let delay = slot
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.config.retry_max_interval);
                warn!(
                    device = %device_id,
                    retry = slot.retries,
                    retry_after_ms = delay.as_millis() as u64,
                    "Transport error, retry scheduled"
                );
                Step::Retry {
                    device: device_id,
                    delay,
                }
            }
            TaskOutcome::Failure(reason) => {
                warn!(
                    device = %device_id,
                    reason = %reason,
                    attempts = ?attempts,
                    "Device failed"
                );
                slot.failure = Some(reason);
                self.check_exhausted()
            }
        }
    }

    pub(crate) fn on_retry(&mut self, id: &DeviceId) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        let Some(device) = self.slots.get_mut(id).and_then(|slot| slot.parked.take()) else {
            return Step::Continue;
        };

        debug!(device = %id, "Retrying device");
        let task = self.spawn_task(device);
        if let Some(slot) = self.slots.get_mut(id) {
            slot.task = task;
        }
        Step::Continue
    }

    pub(crate) fn detach(&mut self, id: &DeviceId) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        let Some(slot) = self.slots.get_mut(id) else {
            return Step::Continue;
        };

        if slot.parked.take().is_some() {
            info!(device = %id, "Device disconnected during retry delay");
            slot.failure = Some(TaskFailure::DeviceDisconnected);
            return self.check_exhausted();
        }
        // The task reports the disconnect like any other outcome.
        slot.task.disconnect();
        Step::Continue
    }

    pub(crate) fn cancel_all(&mut self) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        info!("Race cancelled by caller");
        self.abort();
        Step::Resolve(Err(RequestError::UserCancelled))
    }

    pub(crate) fn expire(&mut self) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        warn!("Race deadline exceeded");
        self.abort();
        Step::Resolve(Err(RequestError::Timeout))
    }

    fn abort(&mut self) {
        self.resolved = true;
        for slot in self.slots.values_mut() {
            slot.parked = None;
            slot.task.cancel();
        }
    }

    fn cancel_others(&mut self, winner: &DeviceId) {
        for (id, slot) in self.slots.iter_mut() {
            if id != winner {
                slot.parked = None;
                slot.task.cancel();
            }
        }
    }

    /// Resolve once no device is left in the race.
    fn check_exhausted(&mut self) -> Step {
        if self.slots.is_empty() || self.slots.values().any(Slot::is_live) {
            return Step::Continue;
        }

        self.resolved = true;
        let error = if self
            .slots
            .values()
            .all(|slot| slot.failure == Some(TaskFailure::InvalidCredential))
        {
            RequestError::NoEligibleDevice
        } else {
            RequestError::AllDevicesFailed
        };
        info!(error = %error, devices = self.slots.len(), "Race exhausted");
        Step::Resolve(Err(error))
    }
}

async fn run_race(
    mut state: RaceState,
    mut reports: mpsc::UnboundedReceiver<TaskReport>,
    mut commands: mpsc::UnboundedReceiver<RaceCommand>,
    mut result_tx: oneshot::Sender<RaceResult>,
    deadline: Option<Duration>,
) {
    let (retry_tx, mut retries) = mpsc::unbounded_channel::<DeviceId>();
    let sleep = tokio::time::sleep(deadline.unwrap_or(Duration::MAX));
    tokio::pin!(sleep);
    let mut commands_open = true;

    let result = loop {
        let step = tokio::select! {
            Some(report) = reports.recv() => state.on_report(report),
            command = commands.recv(), if commands_open => match command {
                Some(RaceCommand::Attach(device)) => state.attach(device),
                Some(RaceCommand::Detach(id)) => state.detach(&id),
                Some(RaceCommand::CancelAll) => state.cancel_all(),
                None => {
                    commands_open = false;
                    Step::Continue
                }
            },
            Some(id) = retries.recv() => state.on_retry(&id),
            () = &mut sleep, if deadline.is_some() => state.expire(),
            () = result_tx.closed() => {
                debug!("Caller dropped the pending assertion");
                state.abort();
                return;
            }
        };

        match step {
            Step::Continue => {}
            Step::Retry { device, delay } => {
                let retry_tx = retry_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send(device);
                });
            }
            Step::Resolve(result) => break result,
        }
    };

    if result_tx.send(result).is_err() {
        debug!("Caller dropped the pending assertion");
    }
}
