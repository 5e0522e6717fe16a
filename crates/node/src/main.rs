mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{MultiControllerSim, Scenario};

const DEVICE_ID: &str = "multiController";
const HEARTBEAT_TOPIC: &str = "hydro/bridge/heartbeat";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Actuator {
    Pump,
    Lamp,
}

/// Parse "hydro/multiController/<pump|lamp>/set" with an ON/OFF payload.
fn parse_command(topic: &str, payload: &[u8]) -> Option<(Actuator, bool)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != "hydro" || parts[1] != DEVICE_ID || parts[3] != "set" {
        return None;
    }
    let actuator = match parts[2] {
        "pump" => Actuator::Pump,
        "lamp" => Actuator::Lamp,
        _ => return None,
    };
    let text = std::str::from_utf8(payload).ok()?;
    let on = match text.trim().to_ascii_uppercase().as_str() {
        "ON" => true,
        "OFF" => false,
        _ => return None,
    };
    Some((actuator, on))
}

fn apply_command(sim: &mut MultiControllerSim, actuator: Actuator, on: bool) {
    match actuator {
        Actuator::Pump => sim.set_pump(on),
        Actuator::Lamp => sim.set_lamp(on),
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let telemetry_every_ms: u64 = env_or("TELEMETRY_EVERY_MS", 500);
    let heartbeat_every_s: u64 = env_or("HEARTBEAT_EVERY_S", 2);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut sim = MultiControllerSim::new(scenario);
    info!(%scenario, "multi-controller simulator starting");

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(format!("hydro-node-{DEVICE_ID}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let command_filter = format!("hydro/{DEVICE_ID}/+/set");
    client
        .subscribe(&command_filter, QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to commands")?;

    let telemetry_topic = format!("hydro/{DEVICE_ID}/telemetry");
    info!(%telemetry_topic, %command_filter, "simulator topics");

    let mut telemetry_tick = interval(Duration::from_millis(telemetry_every_ms));
    let mut heartbeat_tick = interval(Duration::from_secs(heartbeat_every_s));
    let mut last_step = Instant::now();

    loop {
        tokio::select! {
            _ = telemetry_tick.tick() => {
                let now = Instant::now();
                sim.step(now.duration_since(last_step).as_secs_f64());
                last_step = now;

                let telem = sim.telemetry();
                let payload = serde_json::to_vec(&telem)?;
                if let Err(e) = client
                    .publish(&telemetry_topic, QoS::AtMostOnce, false, payload)
                    .await
                {
                    warn!(error = %e, "telemetry publish failed");
                } else {
                    debug!(
                        pump = telem.pump_state,
                        upper = telem.upper_state,
                        level = format!("{:.1}", telem.water_level),
                        "telemetry published"
                    );
                }
            }
            _ = heartbeat_tick.tick() => {
                if let Err(e) = client
                    .publish(HEARTBEAT_TOPIC, QoS::AtMostOnce, false, Vec::new())
                    .await
                {
                    warn!(error = %e, "heartbeat publish failed");
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match parse_command(&p.topic, &p.payload) {
                        Some((actuator, on)) => {
                            info!(?actuator, on, "command received");
                            apply_command(&mut sim, actuator, on);
                        }
                        None => warn!(topic = %p.topic, "ignoring unrecognised command"),
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(scenario = %sim.scenario(), "node connected to mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
