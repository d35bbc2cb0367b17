//! TOML config file loading, validation, and database seeding for users,
//! devices, and the filtration timing knobs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::Db;
use crate::model::is_valid_serial;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub filtration: FiltrationSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub offline_pause: OfflinePauseSettings,
    #[serde(default)]
    pub auto_valve: AutoValveSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FiltrationSettings {
    /// 0 means stage 1 only ends on the valve-1 close acknowledgment.
    pub stage_1_timeout_sec: i64,
    pub stage_2_sec: i64,
    pub stage_3_sec: i64,
    /// Evaluation window for stage 4.
    pub stage_4_sec: i64,
    pub stage_gap_sec: i64,
    pub restart_entry_stage: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub offline_after_sec: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflinePauseSettings {
    pub valve_1_open_min_sec: i64,
    /// Percent.
    pub dirty_water_min_level: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoValveSettings {
    pub open_level: f64,
    pub max_electric_current: f64,
    pub min_stage_1_age_hours: i64,
    pub close_level: f64,
    /// An unacknowledged auto-valve command is not repeated sooner than this.
    pub command_resend_sec: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub api_token: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub serial_number: String,
    #[serde(default)]
    pub name: String,
    pub owner: Option<String>,
}

const MIN_TOKEN_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for FiltrationSettings {
    fn default() -> Self {
        Self {
            stage_1_timeout_sec: 0,
            stage_2_sec: 900,
            stage_3_sec: 360,
            stage_4_sec: 240,
            stage_gap_sec: 10,
            restart_entry_stage: 1,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            offline_after_sec: 90,
        }
    }
}

impl Default for OfflinePauseSettings {
    fn default() -> Self {
        Self {
            valve_1_open_min_sec: 60,
            dirty_water_min_level: 6.0,
        }
    }
}

impl Default for AutoValveSettings {
    fn default() -> Self {
        Self {
            open_level: 100.0,
            max_electric_current: 10.0,
            min_stage_1_age_hours: 24,
            close_level: 6.0,
            command_resend_sec: 60,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_sec: 5,
        }
    }
}

impl FiltrationSettings {
    /// How long a stage runs before its scheduled completion. `None` for a
    /// stage that waits on the device instead.
    pub fn stage_duration(&self, stage: u8) -> Option<Duration> {
        let secs = match stage {
            1 => self.stage_1_timeout_sec,
            2 => self.stage_2_sec,
            3 => self.stage_3_sec,
            4 => self.stage_4_sec,
            _ => 0,
        };
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    pub fn stage_gap(&self) -> Duration {
        Duration::from_secs(self.stage_gap_sec.max(0) as u64)
    }
}

impl HeartbeatSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.offline_after_sec.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_timing(&mut errors);
        self.validate_levels(&mut errors);
        self.validate_users(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let f = &self.filtration;

        if f.stage_1_timeout_sec < 0 {
            errors.push(format!(
                "filtration: stage_1_timeout_sec must not be negative, got {}",
                f.stage_1_timeout_sec
            ));
        }
        for (key, value) in [
            ("stage_2_sec", f.stage_2_sec),
            ("stage_3_sec", f.stage_3_sec),
            ("stage_4_sec", f.stage_4_sec),
        ] {
            if value <= 0 {
                errors.push(format!("filtration: {key} must be positive, got {value}"));
            }
        }
        if f.stage_gap_sec < 0 {
            errors.push(format!(
                "filtration: stage_gap_sec must not be negative, got {}",
                f.stage_gap_sec
            ));
        }
        if !matches!(f.restart_entry_stage, 1 | 2) {
            errors.push(format!(
                "filtration: restart_entry_stage must be 1 or 2, got {}",
                f.restart_entry_stage
            ));
        }

        if self.heartbeat.offline_after_sec <= 0 {
            errors.push(format!(
                "heartbeat: offline_after_sec must be positive, got {}",
                self.heartbeat.offline_after_sec
            ));
        }
        if self.offline_pause.valve_1_open_min_sec < 0 {
            errors.push(format!(
                "offline_pause: valve_1_open_min_sec must not be negative, got {}",
                self.offline_pause.valve_1_open_min_sec
            ));
        }
        if self.auto_valve.min_stage_1_age_hours < 0 {
            errors.push(format!(
                "auto_valve: min_stage_1_age_hours must not be negative, got {}",
                self.auto_valve.min_stage_1_age_hours
            ));
        }
        if self.auto_valve.command_resend_sec < 0 {
            errors.push(format!(
                "auto_valve: command_resend_sec must not be negative, got {}",
                self.auto_valve.command_resend_sec
            ));
        }
        if self.queue.max_attempts == 0 {
            errors.push("queue: max_attempts must be at least 1".to_string());
        }
    }

    fn validate_levels(&self, errors: &mut Vec<String>) {
        let a = &self.auto_valve;
        for (key, value) in [
            ("offline_pause.dirty_water_min_level", self.offline_pause.dirty_water_min_level),
            ("auto_valve.open_level", a.open_level),
            ("auto_valve.close_level", a.close_level),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("{key} {value} out of range [0, 100]"));
            }
        }
        if a.close_level >= a.open_level {
            errors.push(format!(
                "auto_valve: close_level ({}) must be below open_level ({})",
                a.close_level, a.open_level
            ));
        }
        if a.max_electric_current <= 0.0 {
            errors.push(format!(
                "auto_valve: max_electric_current must be positive, got {}",
                a.max_electric_current
            ));
        }
    }

    fn validate_users(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_tokens: HashSet<&str> = HashSet::new();

        for (i, u) in self.users.iter().enumerate() {
            let ctx = || {
                if u.name.is_empty() {
                    format!("users[{i}]")
                } else {
                    format!("user '{}'", u.name)
                }
            };

            if u.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&u.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if u.api_token.trim().len() < MIN_TOKEN_LEN {
                errors.push(format!(
                    "{}: api_token must be at least {MIN_TOKEN_LEN} characters",
                    ctx()
                ));
            } else if !seen_tokens.insert(&u.api_token) {
                errors.push(format!("{}: api_token is shared with another user", ctx()));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let user_names: HashSet<&str> = self.users.iter().map(|u| u.name.as_str()).collect();
        let mut seen_serials: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.serial_number.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.serial_number)
                }
            };

            if !is_valid_serial(&d.serial_number) {
                errors.push(format!(
                    "{}: serial_number must match [A-Za-z0-9_-]{{1,150}}",
                    ctx()
                ));
            } else if !seen_serials.insert(&d.serial_number) {
                errors.push(format!("{}: duplicate serial_number", ctx()));
            }

            if let Some(owner) = &d.owner {
                if !user_names.contains(owner.as_str()) {
                    errors.push(format!(
                        "{}: owner '{owner}' does not match any defined user",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all users and provisioned devices from the config into the database.
pub async fn apply(config: &Config, db: &Db, now: i64) -> Result<()> {
    for u in &config.users {
        db.upsert_user(&u.name, &u.api_token)
            .await
            .with_context(|| format!("failed to upsert user '{}'", u.name))?;
    }

    for d in &config.devices {
        let owner_id = match &d.owner {
            Some(name) => Some(
                db.user_by_name(name)
                    .await?
                    .with_context(|| format!("owner '{name}' missing after seeding"))?
                    .id,
            ),
            None => None,
        };
        db.upsert_device(&d.serial_number, &d.name, owner_id, now)
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.serial_number))?;
    }

    tracing::info!(
        users = config.users.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
