//! Classification payload ingestion.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::db::Db;
use crate::error::TransitionError;
use crate::filtration::FiltrationService;
use crate::model::{is_valid_serial, NewReading, DIRTY_WATER};
use crate::mqtt::{ClassificationMsg, SensorSample};

const WATER_TYPES: [&str; 3] = ["clean_water", "dirty_water", "hydroponics_water"];

pub struct ReadingsIngester {
    db: Db,
    filtration: Arc<FiltrationService>,
    clock: Arc<dyn Clock>,
}

impl ReadingsIngester {
    pub fn new(db: Db, filtration: Arc<FiltrationService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            filtration,
            clock,
        }
    }

    /// Store every sample of one classification message and run the valve
    /// rules once, on the last dirty-water sample. Returns the number of rows stored;
    /// malformed payloads store nothing.
    pub async fn ingest(&self, payload: &[u8]) -> Result<usize, TransitionError> {
        let msg: ClassificationMsg = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping malformed classification payload");
                return Ok(0);
            }
        };
        let serial = msg.device_serial_number.as_str();
        if !is_valid_serial(serial) {
            warn!(serial = %serial, "classification for malformed serial dropped");
            return Ok(0);
        }

        let now = self.clock.now();
        let device = self.db.ensure_device(serial, now).await?;

        let mut stored = 0;
        let mut dirty = None;
        for sample in msg.sensor_data {
            if !WATER_TYPES.contains(&sample.water_type.as_str()) {
                warn!(serial = %serial, water_type = %sample.water_type, "unknown water type skipped");
                continue;
            }
            let reading = to_reading(sample);
            self.db.insert_reading(device.id, &reading, now).await?;
            stored += 1;

            if reading.water_type == DIRTY_WATER {
                dirty = Some((reading.water_level, reading.electric_current));
            }
        }

        // One valve decision per message, on its latest dirty-water sample.
        if let Some((level, current)) = dirty {
            self.filtration.check_auto_valve(&device, level, current).await?;
        }

        debug!(serial = %serial, stored, "classification stored");
        Ok(stored)
    }
}

fn to_reading(sample: SensorSample) -> NewReading {
    let s = sample.sensors;
    NewReading {
        water_type: sample.water_type,
        ph: s.ph,
        tds: s.tds,
        turbidity: s.turbidity,
        water_level: s.water_level,
        electric_current: s.electric_current,
        ai_classification: sample.ai_classification,
        confidence: sample.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::filtration::{StateMachineSettings, ValveSignal};
    use crate::model::CLEAN_WATER;
    use crate::mqtt::RecordingPublisher;
    use crate::queue::RecordingScheduler;
    use crate::state;

    const T0: i64 = 1_700_000_000;

    async fn setup() -> (ReadingsIngester, Arc<FiltrationService>, Arc<RecordingPublisher>, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = Arc::new(ManualClock::at(T0));
        let publisher = Arc::new(RecordingPublisher::default());
        let filtration = Arc::new(FiltrationService::new(
            db.clone(),
            publisher.clone(),
            Arc::new(RecordingScheduler::default()),
            clock.clone(),
            state::new_shared(),
            StateMachineSettings::from(&Config::default()),
        ));
        let ingester = ReadingsIngester::new(db.clone(), filtration.clone(), clock);
        (ingester, filtration, publisher, db)
    }

    async fn count(db: &Db) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stores_one_row_per_sample_and_registers_device() {
        let (ingester, _, _, db) = setup().await;
        let payload = br#"{
            "device_serial_number": "BT20120",
            "sensor_data": [
                {"water_type": "clean_water", "sensors": {"ph": 7.1, "tds": 120},
                 "ai_classification": "good", "confidence": 97.5},
                {"water_type": "dirty_water", "sensors": {"water_level": 40}},
                {"water_type": "hydroponics_water", "sensors": {"ph": 6.2, "humidity": 55}}
            ]
        }"#;

        assert_eq!(ingester.ingest(payload).await.unwrap(), 3);
        assert_eq!(count(&db).await, 3);

        let dev = db.device_by_serial("BT20120").await.unwrap().unwrap();
        assert_eq!(
            db.latest_water_level(dev.id, DIRTY_WATER).await.unwrap(),
            Some(40.0)
        );
        let mut conn = db.pool().acquire().await.unwrap();
        let counts = crate::db::classification_counts(&mut conn, dev.id, CLEAN_WATER, T0, T0)
            .await
            .unwrap();
        assert_eq!(counts, (1, 0));
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let (ingester, _, _, db) = setup().await;
        assert_eq!(ingester.ingest(b"{not json").await.unwrap(), 0);
        assert_eq!(
            ingester
                .ingest(br#"{"device_serial_number": "a/b", "sensor_data": []}"#)
                .await
                .unwrap(),
            0
        );
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn unknown_water_type_is_skipped() {
        let (ingester, _, _, db) = setup().await;
        let payload = br#"{"device_serial_number": "BT1",
            "sensor_data": [{"water_type": "sea_water", "sensors": {}}]}"#;
        assert_eq!(ingester.ingest(payload).await.unwrap(), 0);
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn low_dirty_water_level_closes_open_valve() {
        let (ingester, filtration, publisher, db) = setup().await;
        db.ensure_device("BT1", T0).await.unwrap();
        filtration.handle_start_ack("BT1", true).await.unwrap();
        filtration
            .handle_valve_1("BT1", ValveSignal::State(true))
            .await
            .unwrap();
        publisher.take();

        let payload = br#"{"device_serial_number": "BT1",
            "sensor_data": [{"water_type": "dirty_water", "sensors": {"WaterLevel": 4.5}}]}"#;
        ingester.ingest(payload).await.unwrap();

        assert_eq!(
            publisher.take(),
            vec![("mfc/BT1/valve/1".to_string(), "CLOSE".to_string())]
        );
    }

    #[tokio::test]
    async fn many_dirty_samples_yield_one_valve_command() {
        let (ingester, filtration, publisher, db) = setup().await;
        db.ensure_device("BT1", T0).await.unwrap();
        filtration.handle_start_ack("BT1", true).await.unwrap();
        filtration
            .handle_valve_1("BT1", ValveSignal::State(true))
            .await
            .unwrap();
        publisher.take();

        let samples = vec![r#"{"water_type": "dirty_water", "sensors": {"water_level": 3.0}}"#; 25];
        let payload = format!(
            r#"{{"device_serial_number": "BT1", "sensor_data": [{}]}}"#,
            samples.join(",")
        );
        assert_eq!(ingester.ingest(payload.as_bytes()).await.unwrap(), 25);

        assert_eq!(
            publisher.take(),
            vec![("mfc/BT1/valve/1".to_string(), "CLOSE".to_string())]
        );
    }
}
