use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn new_shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// In-memory view for `/api/status`. The database stays the source of truth;
/// this only mirrors what the hub has seen since it started.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub devices: HashMap<String, DeviceLiveness>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DeviceLiveness {
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Heartbeat,
    Ack,
    Publish,
    Transition,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub devices: HashMap<String, DeviceLiveness>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_heartbeat(&mut self, serial: &str, ts: i64) {
        let was_online = self.devices.get(serial).is_some_and(|d| d.online);
        self.devices.insert(
            serial.to_string(),
            DeviceLiveness {
                online: true,
                last_heartbeat: OffsetDateTime::from_unix_timestamp(ts).ok(),
            },
        );
        if !was_online {
            self.push_event(EventKind::Heartbeat, format!("{serial} online"));
        }
    }

    pub fn record_offline(&mut self, serial: &str) {
        if let Some(d) = self.devices.get_mut(serial) {
            d.online = false;
        }
        self.push_event(EventKind::Heartbeat, format!("{serial} offline"));
    }

    pub fn record_ack(&mut self, topic: &str, payload: &str) {
        self.push_event(EventKind::Ack, format!("{topic} = {payload}"));
    }

    pub fn record_publish(&mut self, topic: &str, payload: &str) {
        self.push_event(EventKind::Publish, format!("{topic} <- {payload}"));
    }

    pub fn record_transition(&mut self, detail: String) {
        self.push_event(EventKind::Transition, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_newest() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("e{}", MAX_EVENTS + 4));
        assert_eq!(status.events.last().unwrap().detail, "e5");
    }

    #[test]
    fn heartbeat_logs_only_transitions() {
        let mut st = SystemState::new();
        st.record_heartbeat("BT1", 1_700_000_000);
        st.record_heartbeat("BT1", 1_700_000_030);
        assert_eq!(st.events.len(), 1);

        st.record_offline("BT1");
        assert!(!st.devices["BT1"].online);
        st.record_heartbeat("BT1", 1_700_000_200);
        assert_eq!(st.events.len(), 3);
        assert!(st.devices["BT1"].online);
    }

    #[test]
    fn status_serializes_rfc3339() {
        let mut st = SystemState::new();
        st.record_heartbeat("BT1", 0);
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(
            json["devices"]["BT1"]["last_heartbeat"],
            "1970-01-01T00:00:00Z"
        );
        assert_eq!(json["events"][0]["kind"], "heartbeat");
    }
}
