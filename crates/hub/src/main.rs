mod clock;
mod config;
mod db;
mod error;
mod filtration;
mod gateway;
mod jobs;
mod model;
mod monitor;
mod mqtt;
mod outbox;
mod queue;
mod readings;
mod router;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use db::Db;
use filtration::{FiltrationService, StateMachineSettings};
use jobs::JobRunner;
use monitor::HeartbeatMonitor;
use mqtt::Publisher;
use outbox::Outbox;
use queue::{TaskQueue, TaskScheduler};
use readings::ReadingsIngester;
use router::InboundRouter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let client_id = env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "hydronew-hub".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:hydronew.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed users + devices) ──────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db, clock.now()).await?;

    if cfg.users.is_empty() {
        warn!("no users configured; the HTTP API will reject every request");
    }

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = state::new_shared();
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Ok(user) = env::var("MQTT_USERNAME") {
        let password = env::var("MQTT_PASSWORD").unwrap_or_default();
        mqttoptions.set_credentials(user, password);
    }
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // Everything that publishes goes through the outbox; only its worker
    // talks to the client.
    let (outbox, outbox_rx) = Outbox::new();
    let publisher: Arc<dyn Publisher> = Arc::new(outbox);
    tokio::spawn(outbox::run(
        Arc::new(client.clone()),
        outbox_rx,
        Arc::clone(&shared),
    ));

    // ── Task queue + core services ──────────────────────────────────
    let (task_queue, task_rx) = TaskQueue::new();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(task_queue.clone());

    let filtration = Arc::new(FiltrationService::new(
        db.clone(),
        Arc::clone(&publisher),
        Arc::clone(&scheduler),
        Arc::clone(&clock),
        Arc::clone(&shared),
        StateMachineSettings::from(&cfg),
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        db.clone(),
        Arc::clone(&filtration),
        Arc::clone(&scheduler),
        Arc::clone(&clock),
        Arc::clone(&shared),
        cfg.heartbeat.clone(),
    ));
    let ingester = ReadingsIngester::new(db.clone(), Arc::clone(&filtration), Arc::clone(&clock));

    let runner = Arc::new(JobRunner::new(Arc::clone(&filtration), Arc::clone(&monitor)));
    tokio::spawn(queue::run(task_queue, task_rx, runner, cfg.queue.clone()));

    match filtration.recover().await {
        Ok(n) => info!(active_runs = n, "filtration state recovered"),
        Err(e) => error!(error = %e, "failed to recover active runs"),
    }

    let sweep_every = cfg.heartbeat.window().max(Duration::from_secs(1));
    tokio::spawn(monitor::run_sweeper(Arc::clone(&monitor), sweep_every));

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        db: db.clone(),
        shared: Arc::clone(&shared),
        filtration: Arc::clone(&filtration),
        publisher: Arc::clone(&publisher),
        clock: Arc::clone(&clock),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── MQTT loop ───────────────────────────────────────────────────
    let inbound = InboundRouter::new(filtration, monitor, ingester, Arc::clone(&shared));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Err(e) = inbound.route(&p.topic, &p.payload).await {
                    error!(topic = %p.topic, error = %format!("{e:#}"), "inbound handling failed");
                    shared
                        .write()
                        .await
                        .record_error(format!("{} failed: {e}", p.topic));
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                // The request channel drains only while this loop polls.
                let client = client.clone();
                tokio::spawn(async move {
                    for topic in mqtt::SUBSCRIPTIONS {
                        if let Err(e) = client.subscribe(*topic, QoS::AtLeastOnce).await {
                            error!(topic = %topic, error = %e, "subscribe failed");
                        }
                    }
                });
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt error, reconnecting");

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
