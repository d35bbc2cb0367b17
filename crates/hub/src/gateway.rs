//! Filtration command gateway: turns an operator request into one outbound
//! MQTT command. Persisted process state is never touched here; it moves when
//! the device acknowledges through the inbound path.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::db::Db;
use crate::error::ApiError;
use crate::model::{is_valid_serial, Device};
use crate::mqtt::{self, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    OpenValve1,
    CloseValve1,
    OpenDrainValve,
    CloseDrainValve,
    Restart,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Start,
        Command::OpenValve1,
        Command::CloseValve1,
        Command::OpenDrainValve,
        Command::CloseDrainValve,
        Command::Restart,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::OpenValve1 => "open-valve-1",
            Self::CloseValve1 => "close-valve-1",
            Self::OpenDrainValve => "open-drain-valve",
            Self::CloseDrainValve => "close-drain-valve",
            Self::Restart => "restart",
        }
    }

    pub fn topic(self, serial: &str) -> String {
        match self {
            Self::Start => mqtt::pump_3_topic(serial),
            Self::OpenValve1 | Self::CloseValve1 => mqtt::valve_1_topic(serial),
            Self::OpenDrainValve | Self::CloseDrainValve => mqtt::valve_2_topic(serial),
            Self::Restart => mqtt::reservoir_pump_topic(serial),
        }
    }

    pub fn payload(self) -> &'static str {
        match self {
            Self::CloseValve1 | Self::CloseDrainValve => mqtt::CLOSE,
            _ => mqtt::OPEN,
        }
    }

    /// User-facing confirmation.
    pub fn sent_message(self) -> &'static str {
        match self {
            Self::Start => {
                "Start process command sent. State will update when device acknowledges."
            }
            Self::OpenValve1 => {
                "Open valve 1 command sent. State will update when device acknowledges."
            }
            Self::CloseValve1 => {
                "Close valve 1 command sent. State will update when device acknowledges."
            }
            Self::OpenDrainValve => {
                "Open drain valve command sent. State will update when device acknowledges."
            }
            Self::CloseDrainValve => {
                "Close drain valve command sent. State will update when device acknowledges."
            }
            Self::Restart => {
                "Restart command sent. Stage states will update when device acknowledges."
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| ApiError::Validation(format!("unknown command '{s}'")))
    }
}

/// The caller's device with the given serial, or their first paired device
/// when no serial is given.
pub async fn resolve_device(
    db: &Db,
    owner_id: i64,
    serial: Option<&str>,
) -> Result<Device, ApiError> {
    let device = match serial {
        Some(serial) => {
            if !is_valid_serial(serial) {
                return Err(ApiError::Validation(format!("malformed serial '{serial}'")));
            }
            db.owned_device(owner_id, serial).await?
        }
        None => db.devices_for_owner(owner_id).await?.into_iter().next(),
    };
    device.ok_or_else(|| {
        ApiError::NotFound(
            "No device found. Pair a device first or provide a valid serial.".to_string(),
        )
    })
}

/// Publish `command` to the resolved device and return the device.
pub async fn send(
    db: &Db,
    publisher: &dyn Publisher,
    owner_id: i64,
    serial: Option<&str>,
    command: Command,
) -> Result<Device, ApiError> {
    let device = resolve_device(db, owner_id, serial).await?;
    let topic = command.topic(&device.serial_number);

    publisher
        .publish(&topic, command.payload())
        .await
        .map_err(|e| ApiError::Broker(format!("{e:#}")))?;

    info!(
        serial = %device.serial_number,
        command = %command,
        topic = %topic,
        "command published"
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::RecordingPublisher;

    async fn setup() -> (Db, i64) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let owner = db.upsert_user("alice", "alice-token-0123456789").await.unwrap();
        (db, owner)
    }

    #[test]
    fn command_table() {
        let cases = [
            ("start", "mfc/BT1/pump/3", "OPEN"),
            ("open-valve-1", "mfc/BT1/valve/1", "OPEN"),
            ("close-valve-1", "mfc/BT1/valve/1", "CLOSE"),
            ("open-drain-valve", "mfc_fallback/BT1/valve/2", "OPEN"),
            ("close-drain-valve", "mfc_fallback/BT1/valve/2", "CLOSE"),
            ("restart", "reservoir_fallback/BT1/pump/1", "OPEN"),
        ];
        for (name, topic, payload) in cases {
            let cmd: Command = name.parse().unwrap();
            assert_eq!(cmd.topic("BT1"), topic, "{name}");
            assert_eq!(cmd.payload(), payload, "{name}");
            assert_eq!(cmd.to_string(), name);
        }
    }

    #[test]
    fn unknown_command_is_validation_error() {
        let err = "self-destruct".parse::<Command>().unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn send_uses_first_paired_device_without_serial() {
        let (db, owner) = setup().await;
        for serial in ["BT1", "BT2"] {
            let d = db.ensure_device(serial, 1).await.unwrap();
            db.pair_device(d.id, owner).await.unwrap();
        }
        let publisher = RecordingPublisher::default();

        let device = send(&db, &publisher, owner, None, Command::OpenValve1)
            .await
            .unwrap();

        assert_eq!(device.serial_number, "BT1");
        assert_eq!(
            publisher.take(),
            vec![("mfc/BT1/valve/1".to_string(), "OPEN".to_string())]
        );
    }

    #[tokio::test]
    async fn send_with_explicit_serial() {
        let (db, owner) = setup().await;
        for serial in ["BT1", "BT2"] {
            let d = db.ensure_device(serial, 1).await.unwrap();
            db.pair_device(d.id, owner).await.unwrap();
        }
        let publisher = RecordingPublisher::default();

        send(&db, &publisher, owner, Some("BT2"), Command::Restart)
            .await
            .unwrap();

        assert_eq!(
            publisher.take(),
            vec![("reservoir_fallback/BT2/pump/1".to_string(), "OPEN".to_string())]
        );
    }

    #[tokio::test]
    async fn no_device_is_not_found_and_nothing_published() {
        let (db, owner) = setup().await;
        let publisher = RecordingPublisher::default();

        let err = send(&db, &publisher, owner, None, Command::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        // someone else's device does not resolve either
        db.ensure_device("BT9", 1).await.unwrap();
        let err = send(&db, &publisher, owner, Some("BT9"), Command::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(publisher.take().is_empty());
    }

    #[tokio::test]
    async fn malformed_serial_is_validation_error() {
        let (db, owner) = setup().await;
        let publisher = RecordingPublisher::default();
        let err = send(&db, &publisher, owner, Some("BT/#"), Command::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn broker_failure_maps_to_bad_gateway() {
        let (db, owner) = setup().await;
        let d = db.ensure_device("BT1", 1).await.unwrap();
        db.pair_device(d.id, owner).await.unwrap();

        let publisher = RecordingPublisher::failing();
        let err = send(&db, &publisher, owner, None, Command::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Broker(_)));
    }
}
