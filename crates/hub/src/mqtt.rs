use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::BridgeLink;
use crate::bus::Command;
use crate::device::MultiControllerTelem;
use crate::names::{MULTI_CONTROLLER, TELEM_PIPE};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub(crate) const TELEMETRY_FILTER: &str = "hydro/+/telemetry";
pub(crate) const HEARTBEAT_TOPIC: &str = "hydro/bridge/heartbeat";

/// Extract the device id from "hydro/<device>/telemetry".
pub(crate) fn extract_telemetry_device(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "hydro" && parts[2] == "telemetry" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Topic and payload that carry `command` to the multi-controller.
pub(crate) fn command_message(command: Command) -> (String, &'static str) {
    let (actuator, on) = match command {
        Command::PumpSetState(on) => ("pump", on),
        Command::LampSetState(on) => ("lamp", on),
    };
    (
        format!("hydro/{MULTI_CONTROLLER}/{actuator}/set"),
        encode_state(on),
    )
}

pub(crate) fn encode_state(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// What an incoming publish turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Ingress {
    Heartbeat,
    Telemetry,
    Rejected,
    Unhandled,
}

/// Route one incoming publish into the store and the bridge link tracker.
pub(crate) fn handle_publish(
    store: &Store,
    bridge: &mut BridgeLink,
    topic: &str,
    payload: &[u8],
    now: Instant,
) -> Ingress {
    if topic == HEARTBEAT_TOPIC {
        bridge.heartbeat(now);
        return Ingress::Heartbeat;
    }

    let Some(device) = extract_telemetry_device(topic) else {
        debug!(topic, "mqtt: unhandled topic");
        return Ingress::Unhandled;
    };
    if device != MULTI_CONTROLLER {
        warn!(device, "mqtt: telemetry from unknown device");
        return Ingress::Rejected;
    }

    match serde_json::from_slice::<MultiControllerTelem>(payload) {
        Ok(telem) => {
            bridge.message(now);
            store.set(TELEM_PIPE, telem);
            Ingress::Telemetry
        }
        Err(e) => {
            warn!(topic, error = %e, "mqtt: bad telemetry json");
            Ingress::Rejected
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
