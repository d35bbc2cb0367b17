//! Persisted status vocabularies and row types shared by the state machine,
//! the heartbeat monitor and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages are numbered 1..=4 and always run in that order.
pub const FIRST_STAGE: u8 = 1;
pub const LAST_STAGE: u8 = 4;

pub fn stage_name(stage: u8) -> &'static str {
    match stage {
        1 => "MFC",
        2 => "Natural Filter",
        3 => "UV Filter",
        4 => "Clean Water Tank",
        _ => "Unknown",
    }
}

pub fn is_valid_stage(stage: u8) -> bool {
    (FIRST_STAGE..=LAST_STAGE).contains(&stage)
}

/// Serials travel inside MQTT topics, so they must not contain `/`, `+` or `#`.
pub fn is_valid_serial(serial: &str) -> bool {
    !serial.is_empty()
        && serial.len() <= 150
        && serial
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Status enums (stored as TEXT)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum DeviceStatus {
    #[serde(rename = "connected")]
    #[sqlx(rename = "connected")]
    Connected,
    #[serde(rename = "not connected")]
    #[sqlx(rename = "not connected")]
    NotConnected,
    #[serde(rename = "offline")]
    #[sqlx(rename = "offline")]
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProcessStatus {
    Active,
    Paused,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Success,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub api_token: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub serial_number: String,
    pub name: String,
    pub owner_id: Option<i64>,
    pub status: DeviceStatus,
    pub last_heartbeat_at: Option<i64>,
    pub archived_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FiltrationProcess {
    pub id: i64,
    pub device_id: i64,
    pub treatment_report_id: i64,
    pub status: ProcessStatus,
    pub current_stage: i64,
    pub pump_3_state: bool,
    pub valve_1_state: bool,
    pub valve_1_opened_at: Option<i64>,
    pub valve_2_state: bool,
    pub restart_count: i64,
    pub started_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StageRecord {
    pub process_id: i64,
    pub stage_number: i64,
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TreatmentReport {
    pub id: i64,
    pub device_id: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub final_status: ReportStatus,
    pub total_cycles: Option<i64>,
}

/// Classified water sample reported by the device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewReading {
    pub water_type: String,
    pub ph: Option<f64>,
    pub tds: Option<f64>,
    pub turbidity: Option<f64>,
    pub water_level: Option<f64>,
    pub electric_current: Option<f64>,
    pub ai_classification: Option<String>,
    pub confidence: Option<f64>,
}

pub const DIRTY_WATER: &str = "dirty_water";
pub const CLEAN_WATER: &str = "clean_water";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_follow_treatment_order() {
        assert_eq!(stage_name(1), "MFC");
        assert_eq!(stage_name(4), "Clean Water Tank");
        assert_eq!(stage_name(9), "Unknown");
    }

    #[test]
    fn serial_rejects_topic_wildcards() {
        assert!(is_valid_serial("BT20120"));
        assert!(is_valid_serial("dev_01-a"));
        assert!(!is_valid_serial(""));
        assert!(!is_valid_serial("a/b"));
        assert!(!is_valid_serial("a+"));
        assert!(!is_valid_serial("#"));
        assert!(!is_valid_serial(&"x".repeat(151)));
    }

    #[test]
    fn device_status_serializes_with_space() {
        let json = serde_json::to_string(&DeviceStatus::NotConnected).unwrap();
        assert_eq!(json, r#""not connected""#);
    }

    #[test]
    fn stage_status_text_matches_serde() {
        for s in [
            StageStatus::Pending,
            StageStatus::Active,
            StageStatus::Completed,
            StageStatus::Skipped,
            StageStatus::Failed,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
        }
    }
}
