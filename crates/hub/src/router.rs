use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TransitionError;
use crate::filtration::{FiltrationService, ValveSignal};
use crate::monitor::HeartbeatMonitor;
use crate::mqtt::{parse_flag, parse_topic, Inbound};
use crate::readings::ReadingsIngester;
use crate::state::SharedState;

/// Dispatches one inbound publish to the component that owns its topic.
pub struct InboundRouter {
    filtration: Arc<FiltrationService>,
    monitor: Arc<HeartbeatMonitor>,
    ingester: ReadingsIngester,
    shared: SharedState,
}

impl InboundRouter {
    pub fn new(
        filtration: Arc<FiltrationService>,
        monitor: Arc<HeartbeatMonitor>,
        ingester: ReadingsIngester,
        shared: SharedState,
    ) -> Self {
        Self {
            filtration,
            monitor,
            ingester,
            shared,
        }
    }

    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<(), TransitionError> {
        let Some(inbound) = parse_topic(topic) else {
            warn!(topic = %topic, "unhandled topic");
            return Ok(());
        };

        if let Inbound::Heartbeat { serial } = inbound {
            return self.monitor.record_heartbeat(serial).await;
        }
        if let Inbound::Classification = inbound {
            return self.ingester.ingest(payload).await.map(|_| ());
        }

        let flag = match parse_flag(payload) {
            Ok(flag) => flag,
            Err(msg) => {
                warn!(topic = %topic, "{msg}");
                self.shared.write().await.record_error(format!("{topic}: {msg}"));
                return Ok(());
            }
        };
        self.shared
            .write()
            .await
            .record_ack(topic, if flag { "1" } else { "0" });

        let f = &self.filtration;
        let outcome = match inbound {
            Inbound::StartAck { serial } => f.handle_start_ack(serial, flag).await?,
            Inbound::Valve1Ack { serial } if flag => f.handle_valve_1(serial, ValveSignal::Ack).await?,
            Inbound::Valve1State { serial } => {
                f.handle_valve_1(serial, ValveSignal::State(flag)).await?
            }
            Inbound::Valve2Ack { serial } if flag => f.handle_valve_2(serial, ValveSignal::Ack).await?,
            Inbound::Valve2State { serial } => {
                f.handle_valve_2(serial, ValveSignal::State(flag)).await?
            }
            Inbound::RestartAck { serial } => f.handle_restart_ack(serial, flag).await?,
            Inbound::StageAck { serial, stage } => f.handle_stage_ack(serial, stage, flag).await?,
            Inbound::Valve1Ack { .. } | Inbound::Valve2Ack { .. } => {
                warn!(topic = %topic, "valve command not executed by device");
                return Ok(());
            }
            Inbound::Heartbeat { .. } | Inbound::Classification => return Ok(()),
        };
        debug!(topic = %topic, outcome = ?outcome, "inbound handled");
        Ok(())
    }
}
