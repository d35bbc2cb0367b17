use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;

use crate::model::{
    stage_name, Device, FiltrationProcess, NewReading, ProcessStatus, ReportStatus, StageRecord,
    StageStatus, TreatmentReport, User, LAST_STAGE,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

const DEVICE_COLUMNS: &str = "id, serial_number, name, owner_id, status, last_heartbeat_at, \
                              archived_at, created_at";
const PROCESS_COLUMNS: &str = "id, device_id, treatment_report_id, status, current_stage, \
                               pump_3_state, valve_1_state, valve_1_opened_at, valve_2_state, \
                               restart_count, started_at, updated_at";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydronew/hydronew.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Each memory connection is its own database: pin exactly one and never
        // recycle it.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn begin(&self) -> sqlx::Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await
    }

    // ----------------------------
    // Users
    // ----------------------------

    pub async fn upsert_user(&self, name: &str, api_token: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (name, api_token) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET api_token = excluded.api_token
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(api_token)
        .fetch_one(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(id)
    }

    pub async fn user_by_token(&self, api_token: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, name, api_token FROM users WHERE api_token = ?")
            .bind(api_token)
            .fetch_optional(&self.pool)
            .await
            .context("user_by_token failed")
    }

    pub async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, name, api_token FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("user_by_name failed")
    }

    // ----------------------------
    // Devices
    // ----------------------------

    /// Admin provisioning. Leaves status, heartbeat and archive flags alone.
    pub async fn upsert_device(
        &self,
        serial: &str,
        name: &str,
        owner_id: Option<i64>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (serial_number, name, owner_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(serial_number) DO UPDATE SET
              name = excluded.name,
              owner_id = excluded.owner_id
            "#,
        )
        .bind(serial)
        .bind(name)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_device failed serial={serial}"))?;
        Ok(())
    }

    /// First-contact registration: returns the device, creating it if unknown.
    pub async fn ensure_device(&self, serial: &str, now: i64) -> Result<Device> {
        sqlx::query(
            r#"
            INSERT INTO devices (serial_number, created_at) VALUES (?, ?)
            ON CONFLICT(serial_number) DO NOTHING
            "#,
        )
        .bind(serial)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("ensure_device failed serial={serial}"))?;

        self.device_by_serial(serial)
            .await?
            .with_context(|| format!("device {serial} vanished after insert"))
    }

    pub async fn device(&self, id: i64) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("device failed")
    }

    pub async fn device_by_serial(&self, serial: &str) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?"
        ))
        .bind(serial)
        .fetch_optional(&self.pool)
        .await
        .context("device_by_serial failed")
    }

    pub async fn devices_for_owner(&self, owner_id: i64) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE owner_id = ? AND archived_at IS NULL ORDER BY id"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("devices_for_owner failed")
    }

    pub async fn owned_device(&self, owner_id: i64, serial: &str) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE owner_id = ? AND serial_number = ? AND archived_at IS NULL"
        ))
        .bind(owner_id)
        .bind(serial)
        .fetch_optional(&self.pool)
        .await
        .context("owned_device failed")
    }

    /// Claims an unowned, non-archived device. Returns false if someone else
    /// got there first.
    pub async fn pair_device(&self, device_id: i64, owner_id: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE devices SET owner_id = ?
            WHERE id = ? AND owner_id IS NULL AND archived_at IS NULL
            "#,
        )
        .bind(owner_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("pair_device failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn unpair_device(&self, device_id: i64, owner_id: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE devices SET owner_id = NULL, status = 'not connected'
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(device_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .context("unpair_device failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn archive_device(&self, device_id: i64, owner_id: i64, now: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE devices SET archived_at = ?, owner_id = NULL
            WHERE id = ? AND owner_id = ? AND archived_at IS NULL
            "#,
        )
        .bind(now)
        .bind(device_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .context("archive_device failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Devices still flagged connected whose last heartbeat is at or before
    /// `cutoff`.
    pub async fn stale_connected_devices(&self, cutoff: i64) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE status = 'connected' \
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at <= ?) \
             ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("stale_connected_devices failed")
    }

    // ----------------------------
    // Processes, stages, reports (read side)
    // ----------------------------

    pub async fn process(&self, id: i64) -> Result<Option<FiltrationProcess>> {
        sqlx::query_as::<_, FiltrationProcess>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM filtration_processes WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("process failed")
    }

    pub async fn process_with_status(
        &self,
        device_id: i64,
        status: ProcessStatus,
    ) -> Result<Option<FiltrationProcess>> {
        let mut conn = self.pool.acquire().await.context("process_with_status: acquire failed")?;
        fetch_process_with_status(&mut conn, device_id, status)
            .await
            .context("process_with_status failed")
    }

    pub async fn latest_process(&self, device_id: i64) -> Result<Option<FiltrationProcess>> {
        sqlx::query_as::<_, FiltrationProcess>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM filtration_processes \
             WHERE device_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_process failed")
    }

    pub async fn stages(&self, process_id: i64) -> Result<Vec<StageRecord>> {
        sqlx::query_as::<_, StageRecord>(
            r#"
            SELECT process_id, stage_number, name, status, started_at, completed_at
            FROM filtration_stages
            WHERE process_id = ?
            ORDER BY stage_number
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .context("stages failed")
    }

    pub async fn processes_with_status(&self, status: ProcessStatus) -> Result<Vec<FiltrationProcess>> {
        sqlx::query_as::<_, FiltrationProcess>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM filtration_processes WHERE status = ? ORDER BY id"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("processes_with_status failed")
    }

    pub async fn stage(&self, process_id: i64, stage: u8) -> Result<Option<StageRecord>> {
        let mut conn = self.pool.acquire().await.context("stage: acquire failed")?;
        fetch_stage(&mut conn, process_id, stage)
            .await
            .context("stage failed")
    }

    pub async fn report(&self, id: i64) -> Result<Option<TreatmentReport>> {
        sqlx::query_as::<_, TreatmentReport>(
            r#"
            SELECT id, device_id, start_time, end_time, final_status, total_cycles
            FROM treatment_reports WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("report failed")
    }

    pub async fn latest_report(&self, device_id: i64) -> Result<Option<TreatmentReport>> {
        sqlx::query_as::<_, TreatmentReport>(
            r#"
            SELECT id, device_id, start_time, end_time, final_status, total_cycles
            FROM treatment_reports
            WHERE device_id = ?
            ORDER BY start_time DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_report failed")
    }

    /// Process that produced a given report, if any.
    pub async fn process_for_report(&self, report_id: i64) -> Result<Option<FiltrationProcess>> {
        sqlx::query_as::<_, FiltrationProcess>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM filtration_processes \
             WHERE treatment_report_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .context("process_for_report failed")
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, device_id: i64, r: &NewReading, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (
              device_id, water_type, ph, tds, turbidity, water_level,
              electric_current, ai_classification, confidence, reading_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(&r.water_type)
        .bind(r.ph)
        .bind(r.tds)
        .bind(r.turbidity)
        .bind(r.water_level)
        .bind(r.electric_current)
        .bind(&r.ai_classification)
        .bind(r.confidence)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped writes. Every state-machine transition runs these on a
// single connection after winning the compare-and-swap on the process row.
// ---------------------------------------------------------------------------

/// Compare-and-swap guard: bumps `updated_at` only while the process is in
/// `expected`. The write takes the database lock, so the status cannot move
/// under the caller until the transaction ends.
pub(crate) async fn claim_process(
    conn: &mut SqliteConnection,
    process_id: i64,
    expected: ProcessStatus,
    now: i64,
) -> sqlx::Result<Option<FiltrationProcess>> {
    let res = sqlx::query("UPDATE filtration_processes SET updated_at = ? WHERE id = ? AND status = ?")
        .bind(now)
        .bind(process_id)
        .bind(expected)
        .execute(&mut *conn)
        .await?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_process(conn, process_id).await
}

pub(crate) async fn fetch_process(
    conn: &mut SqliteConnection,
    process_id: i64,
) -> sqlx::Result<Option<FiltrationProcess>> {
    sqlx::query_as::<_, FiltrationProcess>(&format!(
        "SELECT {PROCESS_COLUMNS} FROM filtration_processes WHERE id = ?"
    ))
    .bind(process_id)
    .fetch_optional(&mut *conn)
    .await
}

pub(crate) async fn set_process_status(
    conn: &mut SqliteConnection,
    process_id: i64,
    status: ProcessStatus,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE filtration_processes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(process_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn fetch_stage(
    conn: &mut SqliteConnection,
    process_id: i64,
    stage: u8,
) -> sqlx::Result<Option<StageRecord>> {
    sqlx::query_as::<_, StageRecord>(
        r#"
        SELECT process_id, stage_number, name, status, started_at, completed_at
        FROM filtration_stages
        WHERE process_id = ? AND stage_number = ?
        "#,
    )
    .bind(process_id)
    .bind(stage as i64)
    .fetch_optional(&mut *conn)
    .await
}

pub(crate) async fn activate_stage(
    conn: &mut SqliteConnection,
    process_id: i64,
    stage: u8,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE filtration_stages
        SET status = 'active', started_at = ?, completed_at = NULL
        WHERE process_id = ? AND stage_number = ?
        "#,
    )
    .bind(now)
    .bind(process_id)
    .bind(stage as i64)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE filtration_processes SET current_stage = ? WHERE id = ?")
        .bind(stage as i64)
        .bind(process_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Closes a stage with a terminal status (completed or failed).
pub(crate) async fn finish_stage(
    conn: &mut SqliteConnection,
    process_id: i64,
    stage: u8,
    status: StageStatus,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE filtration_stages SET status = ?, completed_at = ?
        WHERE process_id = ? AND stage_number = ?
        "#,
    )
    .bind(status)
    .bind(now)
    .bind(process_id)
    .bind(stage as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn reset_stages_from(
    conn: &mut SqliteConnection,
    process_id: i64,
    first: u8,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE filtration_stages
        SET status = 'pending', started_at = NULL, completed_at = NULL
        WHERE process_id = ? AND stage_number >= ?
        "#,
    )
    .bind(process_id)
    .bind(first as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn skip_unfinished_stages(
    conn: &mut SqliteConnection,
    process_id: i64,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE filtration_stages SET status = 'skipped', completed_at = ?
        WHERE process_id = ? AND status IN ('pending', 'active')
        "#,
    )
    .bind(now)
    .bind(process_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn count_live_runs(conn: &mut SqliteConnection, device_id: i64) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        SELECT
          (SELECT COUNT(*) FROM filtration_processes
             WHERE device_id = ? AND status IN ('active', 'paused'))
        + (SELECT COUNT(*) FROM treatment_reports
             WHERE device_id = ? AND final_status = 'pending')
        "#,
    )
    .bind(device_id)
    .bind(device_id)
    .fetch_one(&mut *conn)
    .await
}

/// Creates the report, the process and its four stage rows (all pending).
/// Returns the new process id.
pub(crate) async fn insert_run(
    conn: &mut SqliteConnection,
    device_id: i64,
    now: i64,
) -> sqlx::Result<i64> {
    let report_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO treatment_reports (device_id, start_time, final_status)
        VALUES (?, ?, 'pending')
        RETURNING id
        "#,
    )
    .bind(device_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let process_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO filtration_processes (
          device_id, treatment_report_id, status, current_stage, pump_3_state,
          started_at, updated_at
        ) VALUES (?, ?, 'active', 1, 1, ?, ?)
        RETURNING id
        "#,
    )
    .bind(device_id)
    .bind(report_id)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    for stage in 1..=LAST_STAGE {
        sqlx::query(
            r#"
            INSERT INTO filtration_stages (process_id, stage_number, name, status)
            VALUES (?, ?, ?, 'pending')
            "#,
        )
        .bind(process_id)
        .bind(stage as i64)
        .bind(stage_name(stage))
        .execute(&mut *conn)
        .await?;
    }

    Ok(process_id)
}

/// Closes a pending report. Returns false if it was already closed.
pub(crate) async fn close_report(
    conn: &mut SqliteConnection,
    report_id: i64,
    status: ReportStatus,
    end_time: i64,
    total_cycles: Option<i64>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE treatment_reports
        SET final_status = ?, end_time = ?, total_cycles = ?
        WHERE id = ? AND final_status = 'pending'
        "#,
    )
    .bind(status)
    .bind(end_time)
    .bind(total_cycles)
    .bind(report_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub(crate) async fn device_serial(
    conn: &mut SqliteConnection,
    device_id: i64,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar("SELECT serial_number FROM devices WHERE id = ?")
        .bind(device_id)
        .fetch_optional(&mut *conn)
        .await
}

/// (good, bad) AI classification counts in `[since, until]`.
pub(crate) async fn classification_counts(
    conn: &mut SqliteConnection,
    device_id: i64,
    water_type: &str,
    since: i64,
    until: i64,
) -> sqlx::Result<(i64, i64)> {
    sqlx::query_as(
        r#"
        SELECT
          COALESCE(SUM(CASE WHEN ai_classification = 'good' THEN 1 ELSE 0 END), 0),
          COALESCE(SUM(CASE WHEN ai_classification = 'bad' THEN 1 ELSE 0 END), 0)
        FROM sensor_readings
        WHERE device_id = ? AND water_type = ?
          AND reading_time >= ? AND reading_time <= ?
        "#,
    )
    .bind(device_id)
    .bind(water_type)
    .bind(since)
    .bind(until)
    .fetch_one(&mut *conn)
    .await
}

pub(crate) async fn set_valve_1(
    conn: &mut SqliteConnection,
    process_id: i64,
    open: bool,
    opened_at: Option<i64>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE filtration_processes SET valve_1_state = ?, valve_1_opened_at = ? WHERE id = ?",
    )
    .bind(open)
    .bind(opened_at)
    .bind(process_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn set_valve_2(
    conn: &mut SqliteConnection,
    process_id: i64,
    open: bool,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE filtration_processes SET valve_2_state = ? WHERE id = ?")
        .bind(open)
        .bind(process_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn increment_restart_count(
    conn: &mut SqliteConnection,
    process_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE filtration_processes SET restart_count = restart_count + 1 WHERE id = ?")
        .bind(process_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Device liveness. The heartbeat monitor runs these inside the same
// transaction as the pause or resume they trigger.
// ---------------------------------------------------------------------------

pub(crate) async fn fetch_device(
    conn: &mut SqliteConnection,
    device_id: i64,
) -> sqlx::Result<Option<Device>> {
    sqlx::query_as::<_, Device>(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
        .bind(device_id)
        .fetch_optional(&mut *conn)
        .await
}

pub(crate) async fn record_heartbeat(
    conn: &mut SqliteConnection,
    device_id: i64,
    ts: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE devices SET last_heartbeat_at = ?, status = 'connected' WHERE id = ?")
        .bind(ts)
        .bind(device_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Flags a device offline if its last heartbeat is at or before `cutoff`.
/// Returns true only for the call that flipped the status: a concurrent
/// check loses, and so does a check racing a newer heartbeat.
pub(crate) async fn mark_offline(
    conn: &mut SqliteConnection,
    device_id: i64,
    cutoff: i64,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE devices SET status = 'offline'
        WHERE id = ? AND status != 'offline'
          AND (last_heartbeat_at IS NULL OR last_heartbeat_at <= ?)
        "#,
    )
    .bind(device_id)
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub(crate) async fn fetch_process_with_status(
    conn: &mut SqliteConnection,
    device_id: i64,
    status: ProcessStatus,
) -> sqlx::Result<Option<FiltrationProcess>> {
    sqlx::query_as::<_, FiltrationProcess>(&format!(
        "SELECT {PROCESS_COLUMNS} FROM filtration_processes \
         WHERE device_id = ? AND status = ? ORDER BY id DESC LIMIT 1"
    ))
    .bind(device_id)
    .bind(status)
    .fetch_optional(&mut *conn)
    .await
}

pub(crate) async fn fetch_latest_water_level(
    conn: &mut SqliteConnection,
    device_id: i64,
    water_type: &str,
) -> sqlx::Result<Option<f64>> {
    let level: Option<Option<f64>> = sqlx::query_scalar(
        r#"
        SELECT water_level FROM sensor_readings
        WHERE device_id = ? AND water_type = ? AND water_level IS NOT NULL
        ORDER BY reading_time DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(device_id)
    .bind(water_type)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(level.flatten())
}

#[cfg(test)]
impl Db {
    pub(crate) async fn latest_water_level(
        &self,
        device_id: i64,
        water_type: &str,
    ) -> Result<Option<f64>> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_latest_water_level(&mut conn, device_id, water_type).await?)
    }

    /// Renames a table so queries against it fail until it is renamed back.
    pub(crate) async fn rename_table(&self, from: &str, to: &str) {
        sqlx::query(&format!("ALTER TABLE {from} RENAME TO {to}"))
            .execute(&self.pool)
            .await
            .expect("rename table");
    }
}
