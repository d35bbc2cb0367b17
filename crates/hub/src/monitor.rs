//! Heartbeat monitor.
//!
//! Every heartbeat schedules an offline check one window later. The check
//! compares against the freshest heartbeat, so older checks fall through
//! without effect and nothing ever has to be cancelled. A periodic sweep
//! covers checks lost across a hub restart.
//!
//! A status flip and the pause or resume it triggers share one transaction.
//! If the state machine fails, the flip rolls back with it and the retried
//! check (or the next heartbeat) runs both again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::HeartbeatSettings;
use crate::db::{self, Db};
use crate::error::TransitionError;
use crate::filtration::FiltrationService;
use crate::model::{is_valid_serial, DeviceStatus};
use crate::queue::{ScheduledTask, TaskScheduler};
use crate::state::SharedState;

/// Result of one offline check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    StillOnline,
    AlreadyOffline,
    WentOffline,
    DeviceMissing,
}

pub struct HeartbeatMonitor {
    db: Db,
    filtration: Arc<FiltrationService>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    shared: SharedState,
    settings: HeartbeatSettings,
}

impl HeartbeatMonitor {
    pub fn new(
        db: Db,
        filtration: Arc<FiltrationService>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        shared: SharedState,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            db,
            filtration,
            scheduler,
            clock,
            shared,
            settings,
        }
    }

    /// Record a heartbeat and schedule the matching offline check. A paused
    /// run resumes on any heartbeat, not only the one that ends an outage,
    /// so a failed resume is retried by the next beat.
    pub async fn record_heartbeat(&self, serial: &str) -> Result<(), TransitionError> {
        if !is_valid_serial(serial) {
            warn!(serial = %serial, "heartbeat with malformed serial ignored");
            return Ok(());
        }

        let now = self.clock.now();
        let device = self.db.ensure_device(serial, now).await?;

        let mut tx = self.db.begin().await?;
        let was_offline = db::fetch_device(&mut tx, device.id)
            .await?
            .is_some_and(|d| d.status == DeviceStatus::Offline);
        db::record_heartbeat(&mut tx, device.id, now).await?;
        let resumed = self
            .filtration
            .resume_after_offline(&mut tx, &device, now)
            .await?;
        tx.commit().await?;

        self.shared.write().await.record_heartbeat(serial, now);
        self.schedule_offline_check(serial);

        if was_offline {
            info!(serial = %serial, "device back online");
        }
        self.filtration.release(resumed).await;
        Ok(())
    }

    pub fn schedule_offline_check(&self, serial: &str) {
        self.scheduler.schedule(
            ScheduledTask::OfflineCheck {
                serial: serial.to_string(),
            },
            self.settings.window(),
        );
    }

    /// Mark the device offline unless a heartbeat arrived within the window.
    /// Only the call that flips the status triggers the state machine.
    pub async fn run_offline_check(&self, serial: &str) -> Result<CheckResult, TransitionError> {
        let Some(device) = self.db.device_by_serial(serial).await? else {
            warn!(serial = %serial, "offline check for unknown device");
            return Ok(CheckResult::DeviceMissing);
        };
        if device.status == DeviceStatus::Offline {
            return Ok(CheckResult::AlreadyOffline);
        }

        let now = self.clock.now();
        let cutoff = now - self.settings.offline_after_sec;
        if device.last_heartbeat_at.is_some_and(|last| last > cutoff) {
            debug!(serial = %serial, "heartbeat still fresh");
            return Ok(CheckResult::StillOnline);
        }

        let mut tx = self.db.begin().await?;
        if !db::mark_offline(&mut tx, device.id, cutoff).await? {
            // another check or a newer heartbeat got there first
            let current = db::fetch_device(&mut tx, device.id).await?;
            return Ok(match current.map(|d| d.status) {
                None => CheckResult::DeviceMissing,
                Some(DeviceStatus::Offline) => CheckResult::AlreadyOffline,
                Some(_) => CheckResult::StillOnline,
            });
        }
        let paused = self.filtration.pause_for_offline(&mut tx, &device, now).await?;
        tx.commit().await?;

        warn!(
            serial = %serial,
            last_heartbeat = ?device.last_heartbeat_at,
            outcome = ?paused.outcome(),
            "device offline"
        );
        self.shared.write().await.record_offline(serial);
        self.filtration.release(paused).await;
        Ok(CheckResult::WentOffline)
    }

    /// Check every device still flagged connected whose heartbeat is stale.
    /// Returns how many went offline.
    pub async fn sweep(&self) -> Result<usize, TransitionError> {
        let cutoff = self.clock.now() - self.settings.offline_after_sec;
        let mut flipped = 0;
        for device in self.db.stale_connected_devices(cutoff).await? {
            match self.run_offline_check(&device.serial_number).await {
                Ok(CheckResult::WentOffline) => flipped += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(serial = %device.serial_number, error = %e, "offline sweep failed");
                }
            }
        }
        Ok(flipped)
    }
}

/// Run the sweep once at startup, then every `every`. Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run_sweeper(monitor: Arc<HeartbeatMonitor>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match monitor.sweep().await {
            Ok(0) => {}
            Ok(n) => info!(devices = n, "offline sweep marked devices offline"),
            Err(e) => error!(error = %e, "offline sweep failed"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
