//! Delayed task queue.
//!
//! Scheduled work sleeps on its own timer, then lands on an mpsc channel. The
//! worker loop runs each task on a fresh tokio task and re-enqueues it with a
//! linear backoff when the handler reports a `TransitionError`. Nothing is
//! ever cancelled: a task whose moment has passed finds its precondition gone
//! and does nothing.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::QueueSettings;
use crate::error::TransitionError;
use crate::model::{is_valid_stage, LAST_STAGE};

// ---------------------------------------------------------------------------
// Task vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    Start(u8),
    Complete(u8),
    EvaluateFinal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledTask {
    Stage { process_id: i64, action: StageAction },
    OfflineCheck { serial: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stage action '{0}'")]
pub struct UnknownAction(pub String);

impl fmt::Display for StageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(n) => write!(f, "start_stage_{n}"),
            Self::Complete(n) => write!(f, "complete_stage_{n}"),
            Self::EvaluateFinal => write!(f, "evaluate_stage_{LAST_STAGE}"),
        }
    }
}

impl FromStr for StageAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stage = |n: &str| n.parse::<u8>().ok().filter(|n| is_valid_stage(*n));

        let action = if s == format!("evaluate_stage_{LAST_STAGE}") {
            Some(Self::EvaluateFinal)
        } else if let Some(n) = s.strip_prefix("start_stage_") {
            stage(n).map(Self::Start)
        } else if let Some(n) = s.strip_prefix("complete_stage_") {
            stage(n).map(Self::Complete)
        } else {
            None
        };
        action.ok_or_else(|| UnknownAction(s.to_string()))
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage { process_id, action } => write!(f, "{action}(process={process_id})"),
            Self::OfflineCheck { serial } => write!(f, "offline_check({serial})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Enqueue `task` to run no earlier than `delay` from now.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: ScheduledTask, delay: Duration);
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &ScheduledTask) -> Result<(), TransitionError>;
}

// ---------------------------------------------------------------------------
// Tokio implementation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Envelope {
    task: ScheduledTask,
    attempt: u32,
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

pub struct TaskReceiver(mpsc::UnboundedReceiver<Envelope>);

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver(rx))
    }

    fn enqueue_after(&self, envelope: Envelope, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = tx.send(envelope) {
                warn!(task = %e.0.task, "task queue closed, dropping task");
            }
        });
    }
}

impl TaskScheduler for TaskQueue {
    fn schedule(&self, task: ScheduledTask, delay: Duration) {
        debug!(task = %task, delay_sec = delay.as_secs(), "task scheduled");
        self.enqueue_after(Envelope { task, attempt: 1 }, delay);
    }
}

/// Worker loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run<H: TaskHandler>(
    queue: TaskQueue,
    mut rx: TaskReceiver,
    handler: Arc<H>,
    settings: QueueSettings,
) {
    while let Some(envelope) = rx.0.recv().await {
        let handler = Arc::clone(&handler);
        let queue = queue.clone();
        let max_attempts = settings.max_attempts;
        let backoff = Duration::from_secs(settings.backoff_sec);

        tokio::spawn(async move {
            let Envelope { task, attempt } = envelope;
            match handler.handle(&task).await {
                Ok(()) => {}
                Err(e) if attempt < max_attempts => {
                    warn!(task = %task, attempt, error = %e, "task failed, retrying");
                    queue.enqueue_after(
                        Envelope {
                            task,
                            attempt: attempt + 1,
                        },
                        backoff * attempt,
                    );
                }
                Err(e) => {
                    error!(task = %task, attempt, error = %e, "task failed, giving up");
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use recording::RecordingScheduler;

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Collects scheduled tasks instead of running them.
    #[derive(Default)]
    pub(crate) struct RecordingScheduler(Mutex<Vec<(ScheduledTask, Duration)>>);

    impl RecordingScheduler {
        pub(crate) fn take(&self) -> Vec<(ScheduledTask, Duration)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl TaskScheduler for RecordingScheduler {
        fn schedule(&self, task: ScheduledTask, delay: Duration) {
            self.0.lock().unwrap().push((task, delay));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
