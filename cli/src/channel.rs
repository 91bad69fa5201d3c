//! Task completion tracking.
//!
//! Every tracked task runs a status poller and, when a push transport is
//! configured, a push listener. Both report into one observation queue that a
//! single reconciler drains. The reconciler is the only owner of the task
//! state and applies the first terminal outcome it sees; everything after that
//! is dropped.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::StatusApi;
use crate::error::ApiError;
use crate::push::PushTransport;
use crate::types::{PushEvent, RemoteResult, TaskState, TaskStatusResponse};

const OBSERVATION_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub push_backoff_initial: Duration,
    pub push_backoff_max: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            task_timeout: Duration::from_secs(30 * 60),
            push_backoff_initial: Duration::from_secs(1),
            push_backoff_max: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub reason: String,
    pub detail: Option<String>,
}

/// Client-side view of one remote task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub status: TaskState,
    pub progress: f32,
    pub message: String,
    pub result: Option<RemoteResult>,
    pub error: Option<TaskFailure>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: TaskState::Pending,
            progress: 0.0,
            message: String::new(),
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Push,
    Poll,
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// `None` fields keep the current value. `state` is pending or running.
    Progress { state: TaskState, progress: Option<f32>, message: Option<String> },
    Completed(Option<RemoteResult>),
    Failed { reason: String, detail: Option<String> },
}

impl Observation {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    fn terminal_state(&self) -> Option<TaskState> {
        match self {
            Self::Progress { .. } => None,
            Self::Completed(_) => Some(TaskState::Completed),
            Self::Failed { .. } => Some(TaskState::Error),
        }
    }

    pub fn from_status(status: TaskStatusResponse) -> Self {
        match status.status {
            TaskState::Completed => Self::Completed(status.result),
            TaskState::Error => {
                let reason = status
                    .error
                    .filter(|err| !err.trim().is_empty())
                    .or_else(|| Some(status.message).filter(|msg| !msg.trim().is_empty()))
                    .unwrap_or_else(|| "task failed".to_string());
                Self::Failed { reason, detail: None }
            }
            state @ (TaskState::Pending | TaskState::Running) => Self::Progress {
                state,
                progress: Some(status.progress),
                message: Some(status.message).filter(|msg| !msg.is_empty()),
            },
        }
    }

    /// A `status` snapshot never resolves a task, even if it names a
    /// terminal state; it has no result attached.
    pub fn from_push(event: PushEvent) -> Self {
        match event {
            PushEvent::Progress { progress, message, .. } => Self::Progress {
                state: TaskState::Running,
                progress: Some(progress),
                message: Some(message).filter(|msg| !msg.is_empty()),
            },
            PushEvent::Status { status, progress, message, .. } => Self::Progress {
                state: if status == TaskState::Pending { status } else { TaskState::Running },
                progress,
                message,
            },
            PushEvent::Completed { result, .. } => Self::Completed(result),
            PushEvent::Error { error, error_detail, .. } => Self::Failed {
                reason: if error.trim().is_empty() { "task failed".to_string() } else { error },
                detail: error_detail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Completed(Option<RemoteResult>),
    Error { reason: String, detail: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress { progress: f32, message: String },
    Terminal(TerminalOutcome),
}

/// Owns the task state and turns observations into subscriber events.
#[derive(Debug)]
pub struct Reconciler {
    task: Task,
}

impl Reconciler {
    pub fn new(task_id: &str) -> Self {
        Self { task: Task::new(task_id) }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn is_resolved(&self) -> bool {
        self.task.status.is_terminal()
    }

    /// Applies one observation. Returns the event to forward, or `None` when
    /// the observation changed nothing.
    pub fn apply(&mut self, origin: Origin, observation: Observation) -> Option<TaskEvent> {
        if self.is_resolved() {
            match observation.terminal_state() {
                Some(state) if state == self.task.status => {
                    debug!("task {}: duplicate {state:?} from {origin:?} ignored", self.task.id);
                }
                Some(state) => {
                    warn!(
                        "task {}: conflicting {state:?} from {origin:?} after {:?}, dropped",
                        self.task.id, self.task.status
                    );
                }
                None => {}
            }
            return None;
        }

        self.task.updated_at = Utc::now();
        match observation {
            Observation::Progress { state, progress, message } => {
                if let Some(progress) = progress.filter(|value| !value.is_nan()) {
                    self.task.progress = progress.clamp(0.0, 1.0);
                }
                if let Some(message) = message {
                    self.task.message = message;
                }
                // A task never goes back to pending once it has started.
                self.task.status = match state {
                    TaskState::Pending if self.task.status != TaskState::Running => {
                        TaskState::Pending
                    }
                    _ => TaskState::Running,
                };
                debug!(
                    "task {}: {:.0}% {}",
                    self.task.id,
                    self.task.progress * 100.0,
                    self.task.message
                );
                Some(TaskEvent::Progress {
                    progress: self.task.progress,
                    message: self.task.message.clone(),
                })
            }
            Observation::Completed(result) => {
                self.task.status = TaskState::Completed;
                self.task.progress = 1.0;
                self.task.result = result.clone();
                info!("task {} completed via {origin:?}", self.task.id);
                Some(TaskEvent::Terminal(TerminalOutcome::Completed(result)))
            }
            Observation::Failed { reason, detail } => {
                self.task.status = TaskState::Error;
                self.task.error =
                    Some(TaskFailure { reason: reason.clone(), detail: detail.clone() });
                info!("task {} failed via {origin:?}: {reason}", self.task.id);
                Some(TaskEvent::Terminal(TerminalOutcome::Error { reason, detail }))
            }
        }
    }
}

/// Starts and owns tracking activities. Shutting the channel down stops every
/// task it is tracking.
pub struct TaskChannel {
    status: Arc<dyn StatusApi>,
    push: Option<Arc<dyn PushTransport>>,
    config: ChannelConfig,
    root: CancellationToken,
}

impl TaskChannel {
    pub fn new(
        status: Arc<dyn StatusApi>,
        push: Option<Arc<dyn PushTransport>>,
        config: ChannelConfig,
    ) -> Self {
        Self { status, push, config, root: CancellationToken::new() }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Must be called from within a tokio runtime.
    pub fn track(&self, task_id: impl Into<String>) -> TaskHandle {
        let task_id = task_id.into();
        let token = self.root.child_token();
        let (observation_tx, observation_rx) = mpsc::channel(OBSERVATION_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(&task_id);
        let (snapshot_tx, snapshot_rx) = watch::channel(reconciler.task().clone());

        tokio::spawn(poll_loop(
            self.status.clone(),
            task_id.clone(),
            self.config.poll_interval,
            observation_tx.clone(),
            token.clone(),
        ));
        if let Some(push) = &self.push {
            tokio::spawn(push_loop(
                push.clone(),
                task_id.clone(),
                self.config.clone(),
                observation_tx,
                token.clone(),
            ));
        }
        tokio::spawn(reconcile(
            reconciler,
            observation_rx,
            event_tx,
            snapshot_tx,
            token.clone(),
            self.config.task_timeout,
        ));

        info!(
            "tracking task {task_id} (push {})",
            if self.push.is_some() { "on" } else { "off" }
        );
        TaskHandle { task_id, events: event_rx, snapshot: snapshot_rx, token }
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Drop for TaskChannel {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Subscriber side of one tracked task. Dropping the handle stops tracking;
/// the remote task keeps running.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    snapshot: watch::Receiver<Task>,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// `None` once tracking has ended and every event has been delivered.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    pub fn snapshot(&self) -> Task {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Task> {
        self.snapshot.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

type Observed = (Origin, Observation);

async fn reconcile(
    mut reconciler: Reconciler,
    mut observations: mpsc::Receiver<Observed>,
    events: mpsc::UnboundedSender<TaskEvent>,
    snapshot: watch::Sender<Task>,
    token: CancellationToken,
    timeout: Duration,
) {
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let (origin, observation) = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = observations.recv() => match received {
                Some(observed) => observed,
                None => break,
            },
            _ = &mut deadline => (
                Origin::Timeout,
                Observation::Failed {
                    reason: format!("timed out after {}s without a result", timeout.as_secs()),
                    detail: None,
                },
            ),
        };

        let Some(event) = reconciler.apply(origin, observation) else {
            continue;
        };
        snapshot.send_replace(reconciler.task().clone());
        let resolved = matches!(event, TaskEvent::Terminal(_));
        let _ = events.send(event);
        if resolved {
            token.cancel();
            break;
        }
    }

    // Anything already queued is still run through the reconciler so late
    // outcomes are accounted for.
    while let Ok((origin, observation)) = observations.try_recv() {
        reconciler.apply(origin, observation);
    }
}

async fn poll_loop(
    api: Arc<dyn StatusApi>,
    task_id: String,
    interval: Duration,
    observations: mpsc::Sender<Observed>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(interval) => {}
        }
        let response = tokio::select! {
            _ = token.cancelled() => return,
            response = api.task_status(&task_id) => response,
        };
        let observation = match response {
            Ok(status) => Observation::from_status(status),
            Err(err) if err.is_task_missing() => Observation::Failed {
                reason: format!("task {task_id} not found"),
                detail: None,
            },
            Err(err) => {
                debug!("status poll for {task_id} failed: {err}");
                continue;
            }
        };
        let terminal = observation.is_terminal();
        if observations.send((Origin::Poll, observation)).await.is_err() || terminal {
            return;
        }
    }
}

async fn push_loop(
    transport: Arc<dyn PushTransport>,
    task_id: String,
    config: ChannelConfig,
    observations: mpsc::Sender<Observed>,
    token: CancellationToken,
) {
    let mut backoff = config.push_backoff_initial;
    loop {
        let subscribed = tokio::select! {
            _ = token.cancelled() => return,
            subscribed = transport.subscribe(&task_id) => subscribed,
        };
        match subscribed {
            Ok(mut stream) => {
                backoff = config.push_backoff_initial;
                loop {
                    let frame = tokio::select! {
                        _ = token.cancelled() => return,
                        frame = stream.next() => frame,
                    };
                    match frame {
                        Some(Ok(event)) => {
                            let observation = Observation::from_push(event);
                            let terminal = observation.is_terminal();
                            if observations.send((Origin::Push, observation)).await.is_err()
                                || terminal
                            {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            warn!("push channel for {task_id} dropped: {err}");
                            break;
                        }
                        None => {
                            debug!("push channel for {task_id} closed");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!("push connect for {task_id} failed: {err}"),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, config.push_backoff_max);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
