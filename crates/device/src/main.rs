mod sim;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::Device;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let serial = env::var("DEVICE_SERIAL").unwrap_or_else(|_| "BT20120".to_string());
    let heartbeat_every_s: u64 = env_or("HEARTBEAT_EVERY_S", 30);
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 10);
    let bad_ratio: f64 = env_or("BAD_WATER_RATIO", 0.2);

    let client_id = format!("hydronew-device-{serial}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let device = Arc::new(Mutex::new(Device::new(&serial)));

    // Command handling runs alongside the periodic publishers.
    {
        let client = client.clone();
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("device connected to mqtt");
                        let topics = device.lock().await.command_topics();
                        for topic in topics {
                            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                                error!(topic = %topic, error = %e, "subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let (replies, summary) = {
                            let mut d = device.lock().await;
                            (d.handle_command(&p.topic, &p.payload), d.summary())
                        };
                        if replies.is_empty() {
                            debug!(topic = %p.topic, "ignored publish");
                        } else {
                            info!(topic = %p.topic, state = %summary, "command applied");
                        }
                        for (topic, payload) in replies {
                            info!(topic = %topic, payload = %payload, "reply");
                            if let Err(e) = client
                                .publish(&topic, QoS::AtLeastOnce, false, payload.into_bytes())
                                .await
                            {
                                error!(topic = %topic, error = %e, "publish failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt error, retrying");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let heartbeat_topic = sim::heartbeat_topic(&serial);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_every_s.max(1)));
    let mut sampling = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));
    let mut rng = fastrand::Rng::new();

    info!(serial = %serial, heartbeat_every_s, sample_every_s, bad_ratio, "device simulator started");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = client
                    .publish(&heartbeat_topic, QoS::AtLeastOnce, false, b"1".to_vec())
                    .await
                {
                    error!(error = %e, "heartbeat publish failed");
                }
            }
            _ = sampling.tick() => {
                let payload = {
                    let mut d = device.lock().await;
                    d.tick();
                    serde_json::to_vec(&d.sample(&mut rng, bad_ratio))
                };
                match payload {
                    Ok(bytes) => {
                        if let Err(e) = client
                            .publish(sim::CLASSIFICATION_TOPIC, QoS::AtLeastOnce, false, bytes)
                            .await
                        {
                            error!(error = %e, "sample publish failed");
                        }
                    }
                    Err(e) => error!(error = %e, "sample serialization failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_or_bad_values() {
        assert_eq!(env_or("HYDRONEW_DEVICE_TEST_UNSET", 42u64), 42);
        env::set_var("HYDRONEW_DEVICE_TEST_BAD", "not-a-number");
        assert_eq!(env_or("HYDRONEW_DEVICE_TEST_BAD", 0.5f64), 0.5);
        env::set_var("HYDRONEW_DEVICE_TEST_OK", "7");
        assert_eq!(env_or("HYDRONEW_DEVICE_TEST_OK", 1u16), 7);
    }
}
