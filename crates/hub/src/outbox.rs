//! Outgoing publish queue.
//!
//! Inbound messages are handled on the MQTT poll loop, and the client's
//! request channel only drains while that loop polls. Handlers therefore
//! never publish to the client directly: they enqueue here, and a separate
//! worker feeds the client in order.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::mqtt::Publisher;
use crate::state::SharedState;

#[derive(Debug)]
struct Outgoing {
    topic: String,
    payload: String,
}

/// Publisher handle that never waits on the broker.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

pub struct OutboxReceiver(mpsc::UnboundedReceiver<Outgoing>);

impl Outbox {
    pub fn new() -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, OutboxReceiver(rx))
    }
}

#[async_trait]
impl Publisher for Outbox {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.tx
            .send(Outgoing {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .map_err(|_| anyhow!("outbox closed, dropping publish topic={topic}"))
    }
}

/// Worker loop. Intended to be `tokio::spawn`-ed from main with the MQTT
/// client as `sink`.
pub async fn run(sink: Arc<dyn Publisher>, rx: OutboxReceiver, shared: SharedState) {
    let mut rx = rx.0;
    while let Some(msg) = rx.recv().await {
        match sink.publish(&msg.topic, &msg.payload).await {
            Ok(()) => debug!(topic = %msg.topic, payload = %msg.payload, "published"),
            Err(e) => {
                warn!(topic = %msg.topic, error = %format!("{e:#}"), "publish failed");
                shared
                    .write()
                    .await
                    .record_error(format!("publish {} failed: {e}", msg.topic));
            }
        }
    }
    debug!("outbox closed, worker exiting");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::RecordingPublisher;
    use crate::state;
    use rumqttc::{AsyncClient, MqttOptions};
    use std::time::Duration;

    #[tokio::test]
    async fn enqueue_does_not_wait_for_an_unpolled_client() {
        // Nobody polls the event loop, so the client's request channel
        // fills after two requests.
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("outbox-test", "localhost", 1883), 2);
        let (outbox, rx) = Outbox::new();
        tokio::spawn(run(Arc::new(client), rx, state::new_shared()));

        let burst = async {
            for i in 0..25 {
                outbox.publish("mfc/BT1/valve/1", &i.to_string()).await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(1), burst)
            .await
            .expect("publishing through the outbox blocked");
    }

    #[tokio::test]
    async fn worker_delivers_in_order() {
        let sink = Arc::new(RecordingPublisher::default());
        let (outbox, rx) = Outbox::new();
        outbox.publish("a", "OPEN").await.unwrap();
        outbox.publish("b", "CLOSE").await.unwrap();
        drop(outbox);

        run(sink.clone(), rx, state::new_shared()).await;
        assert_eq!(
            sink.take(),
            vec![
                ("a".to_string(), "OPEN".to_string()),
                ("b".to_string(), "CLOSE".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_delivery_is_recorded() {
        let shared = state::new_shared();
        let (outbox, rx) = Outbox::new();
        outbox.publish("a", "OPEN").await.unwrap();
        drop(outbox);

        run(Arc::new(RecordingPublisher::failing()), rx, shared.clone()).await;
        let status = shared.read().await.to_status();
        assert!(status
            .events
            .iter()
            .any(|e| e.detail.contains("publish a failed")));
    }

    #[tokio::test]
    async fn closed_outbox_reports_error() {
        let (outbox, rx) = Outbox::new();
        drop(rx);
        assert!(outbox.publish("a", "OPEN").await.is_err());
    }
}
