use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::TransitionError;
use crate::filtration::{FiltrationService, Outcome};
use crate::monitor::HeartbeatMonitor;
use crate::queue::{ScheduledTask, StageAction, TaskHandler};

/// Dispatches queued tasks to the state machine and the heartbeat monitor.
pub struct JobRunner {
    filtration: Arc<FiltrationService>,
    monitor: Arc<HeartbeatMonitor>,
}

impl JobRunner {
    pub fn new(filtration: Arc<FiltrationService>, monitor: Arc<HeartbeatMonitor>) -> Self {
        Self {
            filtration,
            monitor,
        }
    }
}

/// Run one stage action against a process.
pub async fn run_stage_action(
    filtration: &FiltrationService,
    process_id: i64,
    action: StageAction,
) -> Result<Outcome, TransitionError> {
    match action {
        StageAction::Start(n) => filtration.start_stage(process_id, n).await,
        StageAction::Complete(n) => filtration.complete_stage(process_id, n).await,
        StageAction::EvaluateFinal => filtration.evaluate_stage4(process_id).await,
    }
}

#[async_trait]
impl TaskHandler for JobRunner {
    async fn handle(&self, task: &ScheduledTask) -> Result<(), TransitionError> {
        info!(task = %task, "executing task");

        let res = match task {
            ScheduledTask::Stage { process_id, action } => {
                run_stage_action(&self.filtration, *process_id, *action)
                    .await
                    .map(|outcome| format!("{outcome:?}"))
            }
            ScheduledTask::OfflineCheck { serial } => self
                .monitor
                .run_offline_check(serial)
                .await
                .map(|result| format!("{result:?}")),
        };

        match res {
            Ok(result) => {
                info!(task = %task, result = %result, "task completed");
                Ok(())
            }
            Err(e) => {
                error!(task = %task, error = %format!("{e:#}"), "task failed");
                Err(e)
            }
        }
    }
}
