//! Link health of the radio bridge.
//!
//! The MQTT loop records heartbeats and device messages as they arrive and
//! ticks this machine once a second. The resulting status is written to
//! `bridge.rs.status`, where the aggregator picks it up.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::device::DeviceStatus;
use crate::names::BRIDGE_LINK_STATUS;
use crate::store::SharedStore;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
const LINK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BridgeLink {
    store: SharedStore,
    last_heartbeat: Option<Instant>,
    last_message: Option<Instant>,
}

impl BridgeLink {
    pub fn new(store: SharedStore) -> Self {
        store.set(BRIDGE_LINK_STATUS, DeviceStatus::NotFound);
        Self {
            store,
            last_heartbeat: None,
            last_message: None,
        }
    }

    pub fn heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    /// A telemetry message relayed from a field device.
    pub fn message(&mut self, now: Instant) {
        self.last_message = Some(now);
    }

    pub fn status(&self) -> DeviceStatus {
        self.store
            .get(BRIDGE_LINK_STATUS)
            .unwrap_or(DeviceStatus::NotFound)
    }

    /// Advance one step. `link_up` is the broker connection state.
    pub fn tick(&mut self, now: Instant, link_up: bool) -> DeviceStatus {
        let current = self.status();
        let heard = recent(self.last_heartbeat, now);
        let relayed = recent(self.last_message, now);

        let next = if !link_up {
            DeviceStatus::NotFound
        } else {
            match current {
                DeviceStatus::NotFound => DeviceStatus::Error,
                DeviceStatus::Error if heard => DeviceStatus::Warning,
                DeviceStatus::Error => DeviceStatus::Error,
                DeviceStatus::Warning if relayed => DeviceStatus::Working,
                DeviceStatus::Warning if !heard => DeviceStatus::Error,
                DeviceStatus::Warning => DeviceStatus::Warning,
                DeviceStatus::Working if relayed => DeviceStatus::Working,
                DeviceStatus::Working => DeviceStatus::Warning,
            }
        };

        if next != current {
            info!(from = current.as_str(), to = next.as_str(), "bridge: link status");
            self.store.set(BRIDGE_LINK_STATUS, next);
        }
        next
    }
}

fn recent(at: Option<Instant>, now: Instant) -> bool {
    at.is_some_and(|t| now.saturating_duration_since(t) <= LINK_TIMEOUT)
}

// ===========================================================================
// Tests
// ===========================================================================
