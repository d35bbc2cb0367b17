//! Simulated filtration hardware: actuator state, command replies and
//! classified water samples.

use serde::Serialize;

pub const CLASSIFICATION_TOPIC: &str = "hydronew/ai-classification/backend";

pub fn heartbeat_topic(serial: &str) -> String {
    format!("biotech/{serial}/heartbeat")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuator {
    Pump3,
    Valve1,
    Valve2,
    ReservoirPump,
}

impl Actuator {
    pub const ALL: [Actuator; 4] = [
        Actuator::Pump3,
        Actuator::Valve1,
        Actuator::Valve2,
        Actuator::ReservoirPump,
    ];

    pub fn topic(self, serial: &str) -> String {
        match self {
            Self::Pump3 => format!("mfc/{serial}/pump/3"),
            Self::Valve1 => format!("mfc/{serial}/valve/1"),
            Self::Valve2 => format!("mfc_fallback/{serial}/valve/2"),
            Self::ReservoirPump => format!("reservoir_fallback/{serial}/pump/1"),
        }
    }

    fn is_valve(self) -> bool {
        matches!(self, Self::Valve1 | Self::Valve2)
    }
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Device {
    serial: String,
    pump_3_on: bool,
    valve_1_open: bool,
    valve_2_open: bool,
    reservoir_pump_on: bool,
    /// Dirty-water tank fill, percent.
    dirty_level: f64,
}

impl Device {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            pump_3_on: false,
            valve_1_open: false,
            valve_2_open: false,
            reservoir_pump_on: false,
            dirty_level: 50.0,
        }
    }

    pub fn command_topics(&self) -> Vec<String> {
        Actuator::ALL.iter().map(|a| a.topic(&self.serial)).collect()
    }

    /// Apply an OPEN/CLOSE command and return the messages the hardware
    /// answers with. Anything that is not a command for this device gets no
    /// answer; a command the device cannot execute is acked with `0`.
    pub fn handle_command(&mut self, topic: &str, payload: &[u8]) -> Vec<(String, String)> {
        let Some(actuator) = Actuator::ALL
            .into_iter()
            .find(|a| a.topic(&self.serial) == topic)
        else {
            return Vec::new();
        };

        let on = match String::from_utf8_lossy(payload).trim() {
            "OPEN" => true,
            "CLOSE" => false,
            _ => return vec![(format!("{topic}/ack"), "0".to_string())],
        };

        match actuator {
            Actuator::Pump3 => self.pump_3_on = on,
            Actuator::Valve1 => self.valve_1_open = on,
            Actuator::Valve2 => self.valve_2_open = on,
            Actuator::ReservoirPump => self.reservoir_pump_on = on,
        }

        let mut replies = vec![(format!("{topic}/ack"), "1".to_string())];
        if actuator.is_valve() {
            replies.push((format!("{topic}/state"), if on { "1" } else { "0" }.to_string()));
        }
        replies
    }

    pub fn summary(&self) -> String {
        let on = |b: bool| if b { "on" } else { "off" };
        format!(
            "pump3={} valve1={} valve2={} reservoir={} level={:.0}%",
            on(self.pump_3_on),
            on(self.valve_1_open),
            on(self.valve_2_open),
            on(self.reservoir_pump_on),
            self.dirty_level,
        )
    }

    /// Advance the dirty-water tank one sample period: it drains while
    /// valve 1 is open and slowly refills otherwise.
    pub fn tick(&mut self) {
        self.dirty_level = if self.valve_1_open {
            (self.dirty_level - 5.0).max(0.0)
        } else {
            (self.dirty_level + 1.0).min(100.0)
        };
    }

    /// One classification message covering all three water types.
    pub fn sample(&self, rng: &mut fastrand::Rng, bad_ratio: f64) -> ClassificationPayload {
        let noise = |rng: &mut fastrand::Rng, base: f64, spread: f64| {
            base + (rng.f64() - 0.5) * 2.0 * spread
        };
        let clean_bad = rng.f64() < bad_ratio;

        ClassificationPayload {
            device_serial_number: self.serial.clone(),
            sensor_data: vec![
                SensorSample {
                    water_type: "clean_water",
                    sensors: Sensors {
                        ph: Some(noise(rng, if clean_bad { 5.4 } else { 7.0 }, 0.3)),
                        tds: Some(noise(rng, if clean_bad { 650.0 } else { 180.0 }, 40.0)),
                        turbidity: Some(noise(rng, if clean_bad { 9.0 } else { 0.8 }, 0.5)),
                        ..Default::default()
                    },
                    ai_classification: Some(if clean_bad { "bad" } else { "good" }),
                    confidence: Some(noise(rng, 92.0, 6.0).clamp(0.0, 100.0)),
                },
                SensorSample {
                    water_type: "dirty_water",
                    sensors: Sensors {
                        water_level: Some(self.dirty_level),
                        electric_current: Some(noise(rng, 4.0, 1.5).max(0.0)),
                        ..Default::default()
                    },
                    ai_classification: None,
                    confidence: None,
                },
                SensorSample {
                    water_type: "hydroponics_water",
                    sensors: Sensors {
                        ph: Some(noise(rng, 6.2, 0.2)),
                        tds: Some(noise(rng, 900.0, 60.0)),
                        ..Default::default()
                    },
                    ai_classification: None,
                    confidence: None,
                },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ClassificationPayload {
    pub device_serial_number: String,
    pub sensor_data: Vec<SensorSample>,
}

#[derive(Debug, Serialize)]
pub struct SensorSample {
    pub water_type: &'static str,
    pub sensors: Sensors,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_classification: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Default, Serialize)]
pub struct Sensors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electric_current: Option<f64>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_command_is_acked() {
        let mut d = Device::new("BT1");
        let replies = d.handle_command("mfc/BT1/pump/3", b"OPEN");
        assert_eq!(replies, vec![("mfc/BT1/pump/3/ack".to_string(), "1".to_string())]);
        assert!(d.pump_3_on);
    }

    #[test]
    fn valve_command_is_acked_with_state() {
        let mut d = Device::new("BT1");
        let replies = d.handle_command("mfc_fallback/BT1/valve/2", b"CLOSE");
        assert_eq!(
            replies,
            vec![
                ("mfc_fallback/BT1/valve/2/ack".to_string(), "1".to_string()),
                ("mfc_fallback/BT1/valve/2/state".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn garbage_payload_is_not_executed() {
        let mut d = Device::new("BT1");
        let replies = d.handle_command("mfc/BT1/valve/1", b"TOGGLE");
        assert_eq!(replies, vec![("mfc/BT1/valve/1/ack".to_string(), "0".to_string())]);
        assert!(!d.valve_1_open);
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let mut d = Device::new("BT1");
        assert!(d.handle_command("mfc/BT2/pump/3", b"OPEN").is_empty());
        assert!(d.handle_command("filtration/BT1/stage/1/state", b"active").is_empty());
    }

    #[test]
    fn summary_reflects_actuators() {
        let mut d = Device::new("BT1");
        d.handle_command("reservoir_fallback/BT1/pump/1", b"OPEN");
        assert_eq!(
            d.summary(),
            "pump3=off valve1=off valve2=off reservoir=on level=50%"
        );
    }

    #[test]
    fn tank_drains_while_valve_open() {
        let mut d = Device::new("BT1");
        d.handle_command("mfc/BT1/valve/1", b"OPEN");
        d.tick();
        assert_eq!(d.dirty_level, 45.0);
        d.handle_command("mfc/BT1/valve/1", b"CLOSE");
        d.tick();
        assert_eq!(d.dirty_level, 46.0);
    }

    #[test]
    fn sample_matches_hub_payload_shape() {
        let d = Device::new("BT20120");
        let mut rng = fastrand::Rng::with_seed(7);
        let json = serde_json::to_value(d.sample(&mut rng, 0.0)).unwrap();

        assert_eq!(json["device_serial_number"], "BT20120");
        let data = json["sensor_data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["water_type"], "clean_water");
        assert_eq!(data[0]["ai_classification"], "good");
        assert_eq!(data[1]["sensors"]["water_level"], 50.0);
        assert!(data[1].get("ai_classification").is_none());
    }

    #[test]
    fn bad_ratio_one_always_classifies_bad() {
        let d = Device::new("BT1");
        let mut rng = fastrand::Rng::with_seed(1);
        for _ in 0..20 {
            let json = serde_json::to_value(d.sample(&mut rng, 1.0)).unwrap();
            assert_eq!(json["sensor_data"][0]["ai_classification"], "bad");
        }
    }
}
