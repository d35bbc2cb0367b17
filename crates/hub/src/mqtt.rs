use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Topic layout
// ---------------------------------------------------------------------------

pub const CLASSIFICATION_TOPIC: &str = "hydronew/ai-classification/backend";

/// Everything the hub listens to.
pub const SUBSCRIPTIONS: &[&str] = &[
    "biotech/+/heartbeat",
    "mfc/+/pump/3/ack",
    "mfc/+/valve/1/ack",
    "mfc/+/valve/1/state",
    "mfc_fallback/+/valve/2/ack",
    "mfc_fallback/+/valve/2/state",
    "reservoir_fallback/+/pump/1/ack",
    "filtration/+/stage/+/ack",
    CLASSIFICATION_TOPIC,
];

pub const OPEN: &str = "OPEN";
pub const CLOSE: &str = "CLOSE";

pub fn pump_3_topic(serial: &str) -> String {
    format!("mfc/{serial}/pump/3")
}

pub fn valve_1_topic(serial: &str) -> String {
    format!("mfc/{serial}/valve/1")
}

pub fn valve_2_topic(serial: &str) -> String {
    format!("mfc_fallback/{serial}/valve/2")
}

pub fn reservoir_pump_topic(serial: &str) -> String {
    format!("reservoir_fallback/{serial}/pump/1")
}

pub fn stage_state_topic(serial: &str, stage: u8) -> String {
    format!("filtration/{serial}/stage/{stage}/state")
}

pub fn restart_topic(serial: &str) -> String {
    format!("filtration/{serial}/restart")
}

/// `<actuator>/state` echo for the UI.
pub fn state_topic(actuator_topic: &str) -> String {
    format!("{actuator_topic}/state")
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Heartbeat { serial: &'a str },
    StartAck { serial: &'a str },
    Valve1Ack { serial: &'a str },
    Valve1State { serial: &'a str },
    Valve2Ack { serial: &'a str },
    Valve2State { serial: &'a str },
    RestartAck { serial: &'a str },
    StageAck { serial: &'a str, stage: u8 },
    Classification,
}

/// Map an inbound topic onto what it means. `None` for anything the hub does
/// not handle.
pub fn parse_topic(topic: &str) -> Option<Inbound<'_>> {
    if topic == CLASSIFICATION_TOPIC {
        return Some(Inbound::Classification);
    }

    let parts: Vec<&str> = topic.split('/').collect();
    if parts.get(1).is_some_and(|serial| serial.is_empty()) {
        return None;
    }

    let inbound = match parts.as_slice() {
        &["biotech", serial, "heartbeat"] => Inbound::Heartbeat { serial },
        &["mfc", serial, "pump", "3", "ack"] => Inbound::StartAck { serial },
        &["mfc", serial, "valve", "1", "ack"] => Inbound::Valve1Ack { serial },
        &["mfc", serial, "valve", "1", "state"] => Inbound::Valve1State { serial },
        &["mfc_fallback", serial, "valve", "2", "ack"] => Inbound::Valve2Ack { serial },
        &["mfc_fallback", serial, "valve", "2", "state"] => Inbound::Valve2State { serial },
        &["reservoir_fallback", serial, "pump", "1", "ack"] => Inbound::RestartAck { serial },
        &["filtration", serial, "stage", n, "ack"] => Inbound::StageAck {
            serial,
            stage: n.parse().ok()?,
        },
        _ => return None,
    };
    Some(inbound)
}

/// Parse a `1`/`0` ack or state payload (trims whitespace).
pub fn parse_flag(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload);
    match s.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(format!("unexpected flag payload '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// Classification payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClassificationMsg {
    pub device_serial_number: String,
    #[serde(default)]
    pub sensor_data: Vec<SensorSample>,
}

#[derive(Debug, Deserialize)]
pub struct SensorSample {
    pub water_type: String,
    #[serde(default)]
    pub sensors: SensorValues,
    pub ai_classification: Option<String>,
    pub confidence: Option<f64>,
}

/// Known sensor keys; both the snake_case and the firmware spelling are
/// accepted, everything else is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct SensorValues {
    #[serde(alias = "pH")]
    pub ph: Option<f64>,
    #[serde(alias = "TDS")]
    pub tds: Option<f64>,
    #[serde(alias = "Turbidity")]
    pub turbidity: Option<f64>,
    #[serde(alias = "WaterLevel")]
    pub water_level: Option<f64>,
    #[serde(alias = "ElectricCurrent")]
    pub electric_current: Option<f64>,
}

// ---------------------------------------------------------------------------
// Outbound port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("mqtt publish failed topic={topic}"))
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingPublisher;

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        sent: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
    }

    impl RecordingPublisher {
        pub(crate) fn failing() -> Self {
            Self {
                fail: AtomicBool::new(true),
                ..Default::default()
            }
        }

        pub(crate) fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("broker unavailable");
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_topic --------------------------------------------------------

    #[test]
    fn heartbeat_topic() {
        assert_eq!(
            parse_topic("biotech/BT20120/heartbeat"),
            Some(Inbound::Heartbeat { serial: "BT20120" })
        );
    }

    #[test]
    fn actuator_ack_topics() {
        assert_eq!(
            parse_topic("mfc/BT1/pump/3/ack"),
            Some(Inbound::StartAck { serial: "BT1" })
        );
        assert_eq!(
            parse_topic("mfc/BT1/valve/1/ack"),
            Some(Inbound::Valve1Ack { serial: "BT1" })
        );
        assert_eq!(
            parse_topic("mfc/BT1/valve/1/state"),
            Some(Inbound::Valve1State { serial: "BT1" })
        );
        assert_eq!(
            parse_topic("mfc_fallback/BT1/valve/2/ack"),
            Some(Inbound::Valve2Ack { serial: "BT1" })
        );
        assert_eq!(
            parse_topic("mfc_fallback/BT1/valve/2/state"),
            Some(Inbound::Valve2State { serial: "BT1" })
        );
        assert_eq!(
            parse_topic("reservoir_fallback/BT1/pump/1/ack"),
            Some(Inbound::RestartAck { serial: "BT1" })
        );
    }

    #[test]
    fn stage_ack_topic() {
        assert_eq!(
            parse_topic("filtration/BT1/stage/3/ack"),
            Some(Inbound::StageAck {
                serial: "BT1",
                stage: 3
            })
        );
        assert_eq!(parse_topic("filtration/BT1/stage/three/ack"), None);
    }

    #[test]
    fn classification_topic() {
        assert_eq!(
            parse_topic("hydronew/ai-classification/backend"),
            Some(Inbound::Classification)
        );
    }

    #[test]
    fn outbound_topics_are_not_inbound() {
        assert_eq!(parse_topic("mfc/BT1/pump/3"), None);
        assert_eq!(parse_topic("filtration/BT1/stage/2/state"), None);
        assert_eq!(parse_topic("filtration/BT1/restart"), None);
    }

    #[test]
    fn malformed_topics_rejected() {
        assert_eq!(parse_topic(""), None);
        assert_eq!(parse_topic("biotech//heartbeat"), None);
        assert_eq!(parse_topic("biotech/BT1/heartbeat/extra"), None);
        assert_eq!(parse_topic("mfc/BT1/valve/3/ack"), None);
    }

    // -- parse_flag ---------------------------------------------------------

    #[test]
    fn flag_payloads() {
        assert_eq!(parse_flag(b"1"), Ok(true));
        assert_eq!(parse_flag(b" 0\n"), Ok(false));
        assert!(parse_flag(b"OPEN").is_err());
        assert!(parse_flag(b"").is_err());
    }

    // -- Topic builders -----------------------------------------------------

    #[test]
    fn outbound_topic_builders() {
        assert_eq!(pump_3_topic("BT1"), "mfc/BT1/pump/3");
        assert_eq!(state_topic(&valve_1_topic("BT1")), "mfc/BT1/valve/1/state");
        assert_eq!(
            state_topic(&valve_2_topic("BT1")),
            "mfc_fallback/BT1/valve/2/state"
        );
        assert_eq!(reservoir_pump_topic("BT1"), "reservoir_fallback/BT1/pump/1");
        assert_eq!(stage_state_topic("BT1", 4), "filtration/BT1/stage/4/state");
        assert_eq!(restart_topic("BT1"), "filtration/BT1/restart");
    }

    // -- ClassificationMsg deserialization ----------------------------------

    #[test]
    fn classification_msg_deserialize() {
        let json = r#"{
            "device_serial_number": "BT20120",
            "sensor_data": [
                {"water_type": "clean_water",
                 "sensors": {"ph": 6.82, "tds": 2.41, "turbidity": 0.5, "humidity": 40},
                 "ai_classification": "good", "confidence": 98.7},
                {"water_type": "dirty_water",
                 "sensors": {"WaterLevel": 55.0, "ElectricCurrent": 3.2}}
            ]
        }"#;
        let msg: ClassificationMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.device_serial_number, "BT20120");
        assert_eq!(msg.sensor_data.len(), 2);
        assert_eq!(msg.sensor_data[0].sensors.ph, Some(6.82));
        assert_eq!(msg.sensor_data[0].ai_classification.as_deref(), Some("good"));
        assert_eq!(msg.sensor_data[1].sensors.water_level, Some(55.0));
        assert_eq!(msg.sensor_data[1].sensors.electric_current, Some(3.2));
        assert_eq!(msg.sensor_data[1].confidence, None);
    }

    #[test]
    fn classification_msg_missing_serial_fails() {
        let json = r#"{"sensor_data": []}"#;
        assert!(serde_json::from_str::<ClassificationMsg>(json).is_err());
    }

    #[test]
    fn classification_msg_without_samples() {
        let msg: ClassificationMsg =
            serde_json::from_str(r#"{"device_serial_number": "BT1"}"#).unwrap();
        assert!(msg.sensor_data.is_empty());
    }

    // -- Publisher ----------------------------------------------------------

    #[tokio::test]
    async fn recording_publisher_collects() {
        let p = RecordingPublisher::default();
        p.publish("a/b", OPEN).await.unwrap();
        assert_eq!(p.take(), vec![("a/b".to_string(), "OPEN".to_string())]);

        let failing = RecordingPublisher::failing();
        assert!(failing.publish("a/b", CLOSE).await.is_err());
    }
}
