mod aggregator;
mod bridge;
mod bus;
mod config;
mod db;
mod device;
mod feed;
mod lamp;
mod monitor;
mod mqtt;
mod names;
mod pump;
mod store;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::path::PathBuf;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aggregator::DeviceStatusAggregator;
use bridge::BridgeLink;
use bus::{Command, EventBus};
use config::SettingsPersister;
use db::Db;
use feed::ChangeFeed;
use lamp::LampController;
use monitor::Monitor;
use mqtt::{command_message, handle_publish, HEARTBEAT_TOPIC, TELEMETRY_FILTER};
use pump::PumpController;
use store::{SharedStore, Store};

const READINESS_POLL: Duration = Duration::from_secs(1);
const FEED_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let db_url = env::var("DB_URL").ok().filter(|s| !s.is_empty());
    let config_path =
        PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "hydro.toml".to_string()));

    // ── Store + status aggregation ──────────────────────────────────
    let store: SharedStore = Arc::new(Store::new());
    let _aggregator = DeviceStatusAggregator::new(Arc::clone(&store));
    Monitor::new(Arc::clone(&store)).init();
    let feed = ChangeFeed::attach(&store, FEED_CAPACITY);

    // ── Settings ────────────────────────────────────────────────────
    let cfg = config::load_or_init(&config_path)?;
    let utc_offset = cfg.utc_offset()?;
    config::apply(&cfg, &store);
    let _persister = SettingsPersister::attach(Arc::clone(&store), config_path, cfg);

    // ── History (optional) ──────────────────────────────────────────
    let (db, _history) = match db_url {
        Some(url) => {
            let db = Db::connect(&url).await?;
            db.migrate().await?;
            let history = db::record_history(db.clone(), &store, &aggregator::value_keys());
            (Some(db), history)
        }
        None => {
            info!("DB_URL not set, telemetry history disabled");
            (None, Vec::new())
        }
    };

    // ── Controllers ─────────────────────────────────────────────────
    let bus = EventBus::new(64);
    let pump = PumpController::new(Arc::clone(&store), bus.clone());
    let lamp = LampController::new(Arc::clone(&store), bus.clone(), utc_offset);
    tokio::spawn(drive_controllers(pump, lamp));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        store: Arc::clone(&store),
        db,
        feed,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("hydro-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client
        .subscribe(TELEMETRY_FILTER, QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to telemetry")?;
    client
        .subscribe(HEARTBEAT_TOPIC, QoS::AtMostOnce)
        .await
        .context("failed to subscribe to heartbeat")?;
    info!("hub subscribed to {TELEMETRY_FILTER} and {HEARTBEAT_TOPIC}");

    tokio::spawn(forward_commands(bus.subscribe(), client.clone()));

    let mut bridge = BridgeLink::new(Arc::clone(&store));
    let mut health = tokio::time::interval(bridge::TICK_INTERVAL);
    let mut connected = false;

    loop {
        tokio::select! {
            _ = health.tick() => {
                bridge.tick(Instant::now(), connected);
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handle_publish(&store, &mut bridge, &p.topic, &p.payload, Instant::now());
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected = true;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    connected = false;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, reconnecting");
                    connected = false;
                    bridge.tick(Instant::now(), connected);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

/// Start each controller once its inputs are all present, then watch for
/// loops that stop. A stopped controller is reported and left stopped.
async fn drive_controllers(pump: Arc<PumpController>, lamp: Arc<LampController>) {
    let mut ticker = tokio::time::interval(READINESS_POLL);
    let mut pump_down = false;
    let mut lamp_down = false;
    loop {
        ticker.tick().await;
        if !pump.was_launched() && pump.ready() {
            pump.start();
        }
        if !lamp.was_launched() && lamp.ready() {
            lamp.start();
        }

        if !pump_down && pump.was_launched() && !pump.is_started() {
            pump_down = true;
            error!("pump controller is down, restart the hub once the pump is back");
        }
        if !lamp_down && lamp.was_launched() && !lamp.is_started() {
            lamp_down = true;
            error!("lamp controller is down, restart the hub once the lamp is back");
        }
        if pump_down && lamp_down {
            break;
        }
    }
}

/// Publish controller commands to the multi-controller.
async fn forward_commands(mut rx: tokio::sync::broadcast::Receiver<Command>, client: AsyncClient) {
    loop {
        match rx.recv().await {
            Ok(command) => {
                let (topic, payload) = command_message(command);
                info!(?command, %topic, "sending command");
                if let Err(e) = client
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    error!(error = %e, "failed to publish command");
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "command forwarder lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
