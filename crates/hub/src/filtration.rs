//! Filtration process state machine.
//!
//! One run walks four stages in order:
//!
//! ```text
//! ack(pump 3) ─▶ stage 1 active ──[valve 1 closed | timeout]──▶ stage 1 completed
//!                    ─[gap]─▶ stage 2 active ─[duration]─▶ completed
//!                    ─[gap]─▶ stage 3 active ─[duration]─▶ completed
//!                    ─[gap]─▶ stage 4 active ─[window]──▶ evaluate
//!                                                         ├─ good ─▶ process completed
//!                                                         └─ bad ──▶ stage 4 failed, await restart
//! restart ack ─▶ entry stage active again (restart_count + 1)
//! device offline + valve 1 open too long ─▶ paused ─[device back]─▶ active
//! ```
//!
//! Every transition opens a transaction whose first statement is a
//! compare-and-swap on the process status. Losing the swap means the trigger
//! is stale and nothing is written. Outbound MQTT and follow-up scheduling
//! happen only after commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{AutoValveSettings, Config, FiltrationSettings, OfflinePauseSettings};
use crate::db::{self, Db};
use crate::error::TransitionError;
use crate::model::{
    is_valid_stage, Device, FiltrationProcess, ProcessStatus, ReportStatus, StageRecord,
    StageStatus, CLEAN_WATER, DIRTY_WATER, FIRST_STAGE, LAST_STAGE,
};
use crate::mqtt::{self, Publisher};
use crate::queue::{ScheduledTask, StageAction, TaskScheduler};
use crate::state::SharedState;

/// Window used for stage-4 evaluation when the stage has no start time.
const EVALUATION_FALLBACK_SEC: i64 = 30 * 60;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Skipped(Skip),
}

/// Why a trigger changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    DeviceMissing,
    ProcessMissing,
    NoActiveProcess,
    NotExecuted,
    InvalidStage(u8),
    ProcessNotActive(ProcessStatus),
    StageNotReady { stage: u8, status: StageStatus },
    PreviousStageIncomplete { stage: u8 },
    AlreadyRunning,
    WithinTolerance,
    NothingToDo,
}

impl Skip {
    /// Missing entities are worth a warning; everything else is a benign race.
    fn is_missing(&self) -> bool {
        matches!(self, Skip::DeviceMissing | Skip::ProcessMissing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveSignal {
    /// The device executed the last OPEN/CLOSE; the new state is the opposite
    /// of the recorded one.
    Ack,
    /// The device reports its actual state.
    State(bool),
}

#[derive(Debug, Clone)]
pub struct StateMachineSettings {
    pub filtration: FiltrationSettings,
    pub offline_pause: OfflinePauseSettings,
    pub auto_valve: AutoValveSettings,
}

impl From<&Config> for StateMachineSettings {
    fn from(c: &Config) -> Self {
        Self {
            filtration: c.filtration.clone(),
            offline_pause: c.offline_pause.clone(),
            auto_valve: c.auto_valve.clone(),
        }
    }
}

/// Side effects collected inside a transaction, released after commit.
#[derive(Default)]
struct Effects {
    publish: Vec<(String, String)>,
    schedule: Vec<(ScheduledTask, Duration)>,
    note: Option<String>,
}

impl Effects {
    fn stage_state(&mut self, serial: &str, stage: u8, status: StageStatus) {
        self.publish
            .push((mqtt::stage_state_topic(serial, stage), status.as_str().to_string()));
    }

    fn command(&mut self, topic: String, payload: &str) {
        self.publish.push((topic, payload.to_string()));
    }

    fn after(&mut self, process_id: i64, action: StageAction, delay: Duration) {
        self.schedule
            .push((ScheduledTask::Stage { process_id, action }, delay));
    }
}

/// A transition written inside someone else's transaction. Its effects go
/// out through [`FiltrationService::release`] once that transaction commits.
#[must_use]
pub struct Deferred {
    outcome: Outcome,
    fx: Effects,
}

impl Deferred {
    fn skipped(outcome: Outcome) -> Self {
        Self {
            outcome,
            fx: Effects::default(),
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
}

/// Last auto-valve command sent for a run and still waiting for feedback.
#[derive(Debug, Clone, Copy)]
struct PendingValveCommand {
    open: bool,
    sent_at: i64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct FiltrationService {
    db: Db,
    publisher: Arc<dyn Publisher>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    shared: SharedState,
    settings: StateMachineSettings,
    pending_valve_1: Mutex<HashMap<i64, PendingValveCommand>>,
}

impl FiltrationService {
    pub fn new(
        db: Db,
        publisher: Arc<dyn Publisher>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        shared: SharedState,
        settings: StateMachineSettings,
    ) -> Self {
        Self {
            db,
            publisher,
            scheduler,
            clock,
            shared,
            settings,
            pending_valve_1: Mutex::new(HashMap::new()),
        }
    }

    // -- Run lifecycle ------------------------------------------------------

    /// Pump 3 acknowledged: open a new run and put stage 1 in motion.
    pub async fn handle_start_ack(
        &self,
        serial: &str,
        executed: bool,
    ) -> Result<Outcome, TransitionError> {
        if !executed {
            return Ok(skipped("start_ack", serial, Skip::NotExecuted));
        }
        let Some(device) = self.db.device_by_serial(serial).await? else {
            return Ok(skipped("start_ack", serial, Skip::DeviceMissing));
        };

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        if db::count_live_runs(&mut tx, device.id).await? > 0 {
            return Ok(skipped("start_ack", serial, Skip::AlreadyRunning));
        }
        let process_id = match db::insert_run(&mut tx, device.id, now).await {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                return Ok(skipped("start_ack", serial, Skip::AlreadyRunning));
            }
            Err(e) => return Err(e.into()),
        };
        db::activate_stage(&mut tx, process_id, FIRST_STAGE, now).await?;
        tx.commit().await?;

        info!(serial = %serial, process_id, "filtration run started");

        let mut fx = Effects::default();
        fx.stage_state(serial, FIRST_STAGE, StageStatus::Active);
        self.schedule_stage_end(&mut fx, process_id, FIRST_STAGE, None);
        fx.note = Some(format!("{serial}: run {process_id} started"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Mark `stage` active. Requires the process to be active, the stage
    /// pending and its predecessor completed.
    pub async fn start_stage(
        &self,
        process_id: i64,
        stage: u8,
    ) -> Result<Outcome, TransitionError> {
        let op = "start_stage";
        if !is_valid_stage(stage) {
            return Ok(skipped(op, process_id, Skip::InvalidStage(stage)));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process_id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, process_id, skip)),
        };

        if let Some(skip) = stage_not_in(&mut tx, process_id, stage, StageStatus::Pending).await? {
            return Ok(skipped(op, process_id, skip));
        }
        if stage > FIRST_STAGE
            && stage_not_in(&mut tx, process_id, stage - 1, StageStatus::Completed)
                .await?
                .is_some()
        {
            return Ok(skipped(
                op,
                process_id,
                Skip::PreviousStageIncomplete { stage: stage - 1 },
            ));
        }

        db::activate_stage(&mut tx, process_id, stage, now).await?;
        let serial = serial_of(&mut tx, &process).await?;
        tx.commit().await?;

        info!(process_id, stage, "stage started");

        let mut fx = Effects::default();
        fx.stage_state(&serial, stage, StageStatus::Active);
        self.schedule_stage_end(&mut fx, process_id, stage, None);
        fx.note = Some(format!("{serial}: stage {stage} active"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Mark an active `stage` completed and queue the next one. Completing
    /// the last stage means evaluating it.
    pub async fn complete_stage(
        &self,
        process_id: i64,
        stage: u8,
    ) -> Result<Outcome, TransitionError> {
        let op = "complete_stage";
        if !is_valid_stage(stage) {
            return Ok(skipped(op, process_id, Skip::InvalidStage(stage)));
        }
        if stage == LAST_STAGE {
            return self.evaluate_stage4(process_id).await;
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process_id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, process_id, skip)),
        };
        if let Some(skip) = stage_not_in(&mut tx, process_id, stage, StageStatus::Active).await? {
            return Ok(skipped(op, process_id, skip));
        }

        db::finish_stage(&mut tx, process_id, stage, StageStatus::Completed, now).await?;
        let serial = serial_of(&mut tx, &process).await?;
        tx.commit().await?;

        info!(process_id, stage, "stage completed");

        let mut fx = Effects::default();
        fx.stage_state(&serial, stage, StageStatus::Completed);
        fx.after(
            process_id,
            StageAction::Start(stage + 1),
            self.settings.filtration.stage_gap(),
        );
        fx.note = Some(format!("{serial}: stage {stage} completed"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Terminal check on stage 4: majority-bad clean-water classifications
    /// since the stage started fail it and ask the device for a restart;
    /// anything else (including no data) completes the run.
    pub async fn evaluate_stage4(&self, process_id: i64) -> Result<Outcome, TransitionError> {
        let op = "evaluate_stage_4";
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process_id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, process_id, skip)),
        };
        let Some(stage4) = db::fetch_stage(&mut tx, process_id, LAST_STAGE).await? else {
            return Ok(skipped(op, process_id, Skip::ProcessMissing));
        };
        if stage4.status != StageStatus::Active {
            return Ok(skipped(
                op,
                process_id,
                Skip::StageNotReady {
                    stage: LAST_STAGE,
                    status: stage4.status,
                },
            ));
        }

        let since = stage4.started_at.unwrap_or_else(|| {
            warn!(process_id, "stage 4 has no start time, using fallback window");
            now - EVALUATION_FALLBACK_SEC
        });
        let (good, bad) =
            db::classification_counts(&mut tx, process.device_id, CLEAN_WATER, since, now).await?;
        let serial = serial_of(&mut tx, &process).await?;
        let mut fx = Effects::default();

        if good + bad > 0 && bad > good {
            db::finish_stage(&mut tx, process_id, LAST_STAGE, StageStatus::Failed, now).await?;
            tx.commit().await?;

            info!(process_id, good, bad, "stage 4 rejected, requesting restart");
            fx.stage_state(&serial, LAST_STAGE, StageStatus::Failed);
            fx.command(mqtt::restart_topic(&serial), "1");
            fx.note = Some(format!("{serial}: stage 4 failed ({bad} bad / {good} good)"));
        } else {
            let cycles = process.restart_count + 1;
            db::finish_stage(&mut tx, process_id, LAST_STAGE, StageStatus::Completed, now)
                .await?;
            db::close_report(
                &mut tx,
                process.treatment_report_id,
                ReportStatus::Success,
                now,
                Some(cycles),
            )
            .await?;
            db::set_process_status(&mut tx, process_id, ProcessStatus::Completed, now).await?;
            tx.commit().await?;

            info!(process_id, good, bad, cycles, "treatment completed");
            for stage in 2..=LAST_STAGE {
                fx.stage_state(&serial, stage, StageStatus::Completed);
            }
            if process.restart_count > 0 {
                fx.command(mqtt::restart_topic(&serial), mqtt::CLOSE);
                fx.command(mqtt::reservoir_pump_topic(&serial), mqtt::CLOSE);
            }
            fx.note = Some(format!("{serial}: run {process_id} completed"));
        }

        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Reservoir pump acknowledged a restart: rewind to the entry stage.
    pub async fn handle_restart_ack(
        &self,
        serial: &str,
        executed: bool,
    ) -> Result<Outcome, TransitionError> {
        let op = "restart_ack";
        if !executed {
            return Ok(skipped(op, serial, Skip::NotExecuted));
        }
        let process = match self.find_process(serial, ProcessStatus::Active).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };

        let entry = self.settings.filtration.restart_entry_stage;
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process.id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };

        db::reset_stages_from(&mut tx, process.id, entry).await?;
        db::increment_restart_count(&mut tx, process.id).await?;
        db::activate_stage(&mut tx, process.id, entry, now).await?;
        tx.commit().await?;

        info!(
            serial = %serial,
            process_id = process.id,
            restart_count = process.restart_count + 1,
            entry_stage = entry,
            "run restarted"
        );

        let mut fx = Effects::default();
        for stage in (entry + 1)..=LAST_STAGE {
            fx.stage_state(serial, stage, StageStatus::Pending);
        }
        fx.stage_state(serial, entry, StageStatus::Active);
        self.schedule_stage_end(&mut fx, process.id, entry, None);
        fx.note = Some(format!("{serial}: restarted at stage {entry}"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Operator abort: the run ends, unfinished stages are skipped and the
    /// report fails.
    pub async fn abort(&self, process_id: i64) -> Result<Outcome, TransitionError> {
        let op = "abort";
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        let mut claimed = claim(&mut tx, process_id, ProcessStatus::Active, now).await?;
        if claimed.is_err() {
            claimed = claim(&mut tx, process_id, ProcessStatus::Paused, now).await?;
        }
        let process = match claimed {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, process_id, skip)),
        };

        db::skip_unfinished_stages(&mut tx, process_id, now).await?;
        db::close_report(
            &mut tx,
            process.treatment_report_id,
            ReportStatus::Failed,
            now,
            Some(process.restart_count + 1),
        )
        .await?;
        db::set_process_status(&mut tx, process_id, ProcessStatus::Aborted, now).await?;
        db::set_valve_1(&mut tx, process_id, false, None).await?;
        let serial = serial_of(&mut tx, &process).await?;
        tx.commit().await?;

        info!(process_id, serial = %serial, "run aborted");

        let mut fx = Effects::default();
        fx.command(mqtt::pump_3_topic(&serial), mqtt::CLOSE);
        fx.command(mqtt::valve_1_topic(&serial), mqtt::CLOSE);
        fx.note = Some(format!("{serial}: run {process_id} aborted"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    // -- Actuator feedback --------------------------------------------------

    /// Valve 1 feedback. Closing it while stage 1 is active completes stage 1.
    pub async fn handle_valve_1(
        &self,
        serial: &str,
        signal: ValveSignal,
    ) -> Result<Outcome, TransitionError> {
        let op = "valve_1";
        let process = match self.find_process(serial, ProcessStatus::Active).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process.id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };
        let stage_1 = db::fetch_stage(&mut tx, process.id, FIRST_STAGE)
            .await?
            .map(|s| s.status);
        let stage_1_running = stage_1 == Some(StageStatus::Active);

        let open = match signal {
            // an "open" ack arriving after stage 1 finished is late; keep it closed
            ValveSignal::Ack => !process.valve_1_state && stage_1 != Some(StageStatus::Completed),
            ValveSignal::State(open) => open,
        };
        let opened_at = match (open, process.valve_1_state) {
            (true, true) => process.valve_1_opened_at.or(Some(now)),
            (true, false) => Some(now),
            (false, _) => None,
        };
        db::set_valve_1(&mut tx, process.id, open, opened_at).await?;

        let completes_stage_1 = !open && stage_1_running;
        if completes_stage_1 {
            db::finish_stage(&mut tx, process.id, FIRST_STAGE, StageStatus::Completed, now)
                .await?;
        }
        tx.commit().await?;
        self.forget_valve_command(process.id);

        info!(serial = %serial, process_id = process.id, open, "valve 1 recorded");

        let mut fx = Effects::default();
        if signal == ValveSignal::Ack {
            fx.command(
                mqtt::state_topic(&mqtt::valve_1_topic(serial)),
                if open { "1" } else { "0" },
            );
        }
        if completes_stage_1 {
            info!(process_id = process.id, stage = FIRST_STAGE, "stage completed by valve close");
            fx.stage_state(serial, FIRST_STAGE, StageStatus::Completed);
            fx.after(
                process.id,
                StageAction::Start(FIRST_STAGE + 1),
                self.settings.filtration.stage_gap(),
            );
            fx.note = Some(format!("{serial}: stage 1 completed (valve 1 closed)"));
        }
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// Drain valve feedback. Recorded and echoed, no stage effect.
    pub async fn handle_valve_2(
        &self,
        serial: &str,
        signal: ValveSignal,
    ) -> Result<Outcome, TransitionError> {
        let op = "valve_2";
        let process = match self.find_process(serial, ProcessStatus::Active).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let process = match claim(&mut tx, process.id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(skipped(op, serial, skip)),
        };
        let open = match signal {
            ValveSignal::Ack => !process.valve_2_state,
            ValveSignal::State(open) => open,
        };
        db::set_valve_2(&mut tx, process.id, open).await?;
        tx.commit().await?;

        let mut fx = Effects::default();
        if signal == ValveSignal::Ack {
            fx.command(
                mqtt::state_topic(&mqtt::valve_2_topic(serial)),
                if open { "1" } else { "0" },
            );
        }
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    /// The device reports that it finished `stage` on its own.
    pub async fn handle_stage_ack(
        &self,
        serial: &str,
        stage: u8,
        executed: bool,
    ) -> Result<Outcome, TransitionError> {
        if !executed {
            return Ok(skipped("stage_ack", serial, Skip::NotExecuted));
        }
        match self.find_process(serial, ProcessStatus::Active).await? {
            Ok(p) => self.complete_stage(p.id, stage).await,
            Err(skip) => Ok(skipped("stage_ack", serial, skip)),
        }
    }

    // -- Connectivity -------------------------------------------------------

    /// Offline pause on its own transaction.
    #[cfg(test)]
    pub async fn on_device_offline(&self, device: &Device) -> Result<Outcome, TransitionError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let deferred = self.pause_for_offline(&mut tx, device, now).await?;
        tx.commit().await?;
        Ok(self.release(deferred).await)
    }

    /// Device went silent. Pause the run only when valve 1 has been open long
    /// enough and the dirty-water tank is above the safety level; shorter
    /// outages are tolerated. Written on the caller's transaction so it
    /// commits or rolls back together with the device's status flip.
    pub async fn pause_for_offline(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        now: i64,
    ) -> Result<Deferred, TransitionError> {
        let op = "device_offline";
        let serial = device.serial_number.as_str();
        let Some(process) =
            db::fetch_process_with_status(conn, device.id, ProcessStatus::Active).await?
        else {
            return Ok(Deferred::skipped(skipped(op, serial, Skip::NoActiveProcess)));
        };
        if !self.valve_1_open_too_long(&process, now) {
            return Ok(Deferred::skipped(skipped(op, serial, Skip::WithinTolerance)));
        }

        // unknown level counts as above the threshold
        let level = db::fetch_latest_water_level(conn, device.id, DIRTY_WATER).await?;
        if level.is_some_and(|l| l <= self.settings.offline_pause.dirty_water_min_level) {
            return Ok(Deferred::skipped(skipped(op, serial, Skip::WithinTolerance)));
        }

        let process = match claim(conn, process.id, ProcessStatus::Active, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(Deferred::skipped(skipped(op, serial, skip))),
        };
        if !self.valve_1_open_too_long(&process, now) {
            return Ok(Deferred::skipped(skipped(op, serial, Skip::WithinTolerance)));
        }
        db::set_process_status(conn, process.id, ProcessStatus::Paused, now).await?;
        db::set_valve_1(conn, process.id, false, None).await?;
        self.forget_valve_command(process.id);

        warn!(
            serial = %serial,
            process_id = process.id,
            level = ?level,
            "device offline with valve 1 open, pausing run"
        );

        let mut fx = Effects::default();
        fx.command(mqtt::valve_1_topic(serial), mqtt::CLOSE);
        fx.note = Some(format!("{serial}: run {} paused (device offline)", process.id));
        Ok(Deferred {
            outcome: Outcome::Applied,
            fx,
        })
    }

    /// Online resume on its own transaction.
    #[cfg(test)]
    pub async fn on_device_online(&self, device: &Device) -> Result<Outcome, TransitionError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let deferred = self.resume_after_offline(&mut tx, device, now).await?;
        tx.commit().await?;
        Ok(self.release(deferred).await)
    }

    /// Device is back. A paused run resumes, valve 1 re-opens if the tank
    /// still needs draining, and the running stage's timer is re-armed with
    /// what is left of it. Without a paused run this is a silent no-op, so it
    /// runs on every heartbeat, on the caller's transaction.
    pub async fn resume_after_offline(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        now: i64,
    ) -> Result<Deferred, TransitionError> {
        let op = "device_online";
        let serial = device.serial_number.as_str();
        let Some(process) =
            db::fetch_process_with_status(conn, device.id, ProcessStatus::Paused).await?
        else {
            return Ok(Deferred::skipped(Outcome::Skipped(Skip::NothingToDo)));
        };
        let level = db::fetch_latest_water_level(conn, device.id, DIRTY_WATER).await?;

        let process = match claim(conn, process.id, ProcessStatus::Paused, now).await? {
            Ok(p) => p,
            Err(skip) => return Ok(Deferred::skipped(skipped(op, serial, skip))),
        };
        db::set_process_status(conn, process.id, ProcessStatus::Active, now).await?;

        let current = process.current_stage as u8;
        let current_stage = db::fetch_stage(conn, process.id, current).await?;

        info!(serial = %serial, process_id = process.id, stage = current, "resuming run");

        let mut fx = Effects::default();
        let stage_status = current_stage.as_ref().map(|s| s.status);
        let needs_drain = level.is_some_and(|l| l > self.settings.offline_pause.dirty_water_min_level);
        if current == FIRST_STAGE && stage_status == Some(StageStatus::Active) && needs_drain {
            fx.command(mqtt::valve_1_topic(serial), mqtt::OPEN);
        }
        if let Some(stage) = &current_stage {
            self.rearm(&mut fx, process.id, stage, now);
        }
        fx.note = Some(format!("{serial}: run {} resumed", process.id));
        Ok(Deferred {
            outcome: Outcome::Applied,
            fx,
        })
    }

    /// Send out what a [`Deferred`] transition collected. Call only after the
    /// transaction it was written on has committed.
    pub async fn release(&self, deferred: Deferred) -> Outcome {
        self.flush(deferred.fx).await;
        deferred.outcome
    }

    /// Re-arm the timer of every active run. Queued tasks live in memory, so
    /// a hub restart loses them.
    pub async fn recover(&self) -> Result<usize, TransitionError> {
        let now = self.clock.now();
        let mut fx = Effects::default();
        let processes = self.db.processes_with_status(ProcessStatus::Active).await?;
        for process in &processes {
            let current = process.current_stage as u8;
            if let Some(stage) = self.db.stage(process.id, current).await? {
                self.rearm(&mut fx, process.id, &stage, now);
            }
        }
        if !fx.schedule.is_empty() {
            info!(runs = fx.schedule.len(), "re-armed stage timers");
        }
        self.flush(fx).await;
        Ok(processes.len())
    }

    // -- Readings -----------------------------------------------------------

    /// Dirty-water level rules for valve 1. Only commands are sent; the
    /// recorded valve state changes when the device acknowledges.
    pub async fn check_auto_valve(
        &self,
        device: &Device,
        water_level: Option<f64>,
        electric_current: Option<f64>,
    ) -> Result<Outcome, TransitionError> {
        let op = "auto_valve";
        let serial = device.serial_number.as_str();
        let Some(level) = water_level else {
            return Ok(Outcome::Skipped(Skip::NothingToDo));
        };
        let Some(process) = self
            .db
            .process_with_status(device.id, ProcessStatus::Active)
            .await?
        else {
            return Ok(Outcome::Skipped(Skip::NoActiveProcess));
        };
        let rules = &self.settings.auto_valve;
        let now = self.clock.now();

        let mut want = None;
        if !process.valve_1_state && level >= rules.open_level {
            let current_ok = electric_current.is_some_and(|c| c < rules.max_electric_current);
            let stage_1_started = self
                .db
                .stage(process.id, FIRST_STAGE)
                .await?
                .and_then(|s| s.started_at)
                .unwrap_or(process.started_at);
            let old_enough = now - stage_1_started >= rules.min_stage_1_age_hours * 3600;
            if current_ok && old_enough {
                want = Some(true);
            }
        }
        if process.valve_1_state && level < rules.close_level {
            want = Some(false);
        }
        let Some(open) = want else {
            return Ok(Outcome::Skipped(Skip::NothingToDo));
        };
        if !self.note_valve_command(process.id, open, now) {
            debug!(serial = %serial, open, "auto-valve command already pending");
            return Ok(Outcome::Skipped(Skip::AlreadyRunning));
        }

        if open {
            info!(serial = %serial, level, current = ?electric_current, "auto-opening valve 1");
        } else {
            info!(serial = %serial, level, "auto-closing valve 1");
        }
        let mut fx = Effects::default();
        fx.command(
            mqtt::valve_1_topic(serial),
            if open { mqtt::OPEN } else { mqtt::CLOSE },
        );
        fx.note = Some(format!("{serial}: {op} at level {level}"));
        self.flush(fx).await;
        Ok(Outcome::Applied)
    }

    // -- Helpers ------------------------------------------------------------

    async fn find_process(
        &self,
        serial: &str,
        status: ProcessStatus,
    ) -> Result<Result<FiltrationProcess, Skip>, TransitionError> {
        let Some(device) = self.db.device_by_serial(serial).await? else {
            return Ok(Err(Skip::DeviceMissing));
        };
        Ok(self
            .db
            .process_with_status(device.id, status)
            .await?
            .ok_or(Skip::NoActiveProcess))
    }

    /// Records an auto-valve command about to be sent. False while the same
    /// command is still waiting for feedback and not yet due for a resend.
    fn note_valve_command(&self, process_id: i64, open: bool, now: i64) -> bool {
        let resend_after = self.settings.auto_valve.command_resend_sec;
        let mut pending = self
            .pending_valve_1
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(p) = pending.get(&process_id) {
            if p.open == open && now - p.sent_at < resend_after {
                return false;
            }
        }
        pending.insert(process_id, PendingValveCommand { open, sent_at: now });
        true
    }

    fn forget_valve_command(&self, process_id: i64) {
        self.pending_valve_1
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&process_id);
    }

    fn valve_1_open_too_long(&self, process: &FiltrationProcess, now: i64) -> bool {
        let min_open = self.settings.offline_pause.valve_1_open_min_sec;
        process.valve_1_state
            && process
                .valve_1_opened_at
                .map_or(true, |opened| now - opened >= min_open)
    }

    /// Queue whatever ends `stage`: its completion, or the evaluation for the
    /// last stage. `elapsed` shortens the delay when re-arming after a pause.
    fn schedule_stage_end(
        &self,
        fx: &mut Effects,
        process_id: i64,
        stage: u8,
        elapsed: Option<i64>,
    ) {
        let Some(duration) = self.settings.filtration.stage_duration(stage) else {
            return;
        };
        let remaining = match elapsed {
            Some(secs) if secs > 0 => duration.saturating_sub(Duration::from_secs(secs as u64)),
            _ => duration,
        };
        let action = if stage == LAST_STAGE {
            StageAction::EvaluateFinal
        } else {
            StageAction::Complete(stage)
        };
        fx.after(process_id, action, remaining);
    }

    /// Schedule whatever the run is waiting on: the end of a running stage
    /// (shortened by the time already spent), or the next stage when it sits
    /// in the gap after a completed one.
    fn rearm(&self, fx: &mut Effects, process_id: i64, stage: &StageRecord, now: i64) {
        let number = stage.stage_number as u8;
        match stage.status {
            StageStatus::Active => {
                self.schedule_stage_end(fx, process_id, number, stage.started_at.map(|t| now - t));
            }
            StageStatus::Completed if number < LAST_STAGE => {
                fx.after(process_id, StageAction::Start(number + 1), Duration::ZERO);
            }
            _ => {}
        }
    }

    async fn flush(&self, fx: Effects) {
        for (topic, payload) in &fx.publish {
            if let Err(e) = self.publisher.publish(topic, payload).await {
                warn!(topic = %topic, error = %format!("{e:#}"), "publish failed after commit");
                self.shared
                    .write()
                    .await
                    .record_error(format!("publish {topic} failed: {e}"));
            }
        }
        for (task, delay) in fx.schedule {
            self.scheduler.schedule(task, delay);
        }

        let mut st = self.shared.write().await;
        for (topic, payload) in &fx.publish {
            st.record_publish(topic, payload);
        }
        if let Some(note) = fx.note {
            st.record_transition(note);
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Compare-and-swap on the process status; on failure, tells a missing
/// process apart from one that already moved on.
async fn claim(
    conn: &mut SqliteConnection,
    process_id: i64,
    expected: ProcessStatus,
    now: i64,
) -> Result<Result<FiltrationProcess, Skip>, TransitionError> {
    if let Some(p) = db::claim_process(conn, process_id, expected, now).await? {
        return Ok(Ok(p));
    }
    Ok(Err(match db::fetch_process(conn, process_id).await? {
        None => Skip::ProcessMissing,
        Some(p) => Skip::ProcessNotActive(p.status),
    }))
}

/// `Some(skip)` unless `stage` currently has `expected` status.
async fn stage_not_in(
    conn: &mut SqliteConnection,
    process_id: i64,
    stage: u8,
    expected: StageStatus,
) -> Result<Option<Skip>, TransitionError> {
    Ok(match db::fetch_stage(conn, process_id, stage).await? {
        None => Some(Skip::ProcessMissing),
        Some(s) if s.status != expected => Some(Skip::StageNotReady {
            stage,
            status: s.status,
        }),
        Some(_) => None,
    })
}

async fn serial_of(
    conn: &mut SqliteConnection,
    process: &FiltrationProcess,
) -> Result<String, TransitionError> {
    db::device_serial(conn, process.device_id)
        .await?
        .ok_or_else(|| {
            TransitionError::Unexpected(anyhow::anyhow!(
                "process {} references missing device {}",
                process.id,
                process.device_id
            ))
        })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|d| d.is_unique_violation())
}

fn skipped(op: &str, target: impl std::fmt::Display, skip: Skip) -> Outcome {
    if skip.is_missing() {
        warn!(op, target = %target, reason = ?skip, "transition skipped");
    } else {
        info!(op, target = %target, reason = ?skip, "transition skipped");
    }
    Outcome::Skipped(skip)
}

// ===========================================================================
// Tests
// ===========================================================================
