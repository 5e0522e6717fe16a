//! Turns raw telemetry, bridge link health and monitor flags into the
//! per-device `value` / `status` / `statusStr` entries.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use crate::device::{evaluate, DeviceKind, DeviceStatus, MultiControllerTelem};
use crate::monitor::{Monitor, MonitorFlag};
use crate::names::{
    status_key, status_str_key, value_key, BRIDGE_LINK_STATUS, DEVICE_FLAGS, MONITOR_FLAG_PREFIX,
    TELEM_PIPE,
};
use crate::store::{SharedStore, StoreType, SubscriptionId, Value};

pub struct DeviceStatusAggregator {
    store: SharedStore,
    monitor: Monitor,
    /// Serializes `refresh_system` so the derived system entries always
    /// describe one read of the flags.
    refresh_lock: Mutex<()>,
    telem_sub: SubscriptionId,
    bridge_sub: SubscriptionId,
    flags_sub: SubscriptionId,
}

impl DeviceStatusAggregator {
    /// Register on the telemetry pipe, the bridge link status and the
    /// monitor flags. Must exist before the first telemetry arrives.
    pub fn new(store: SharedStore) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let telem = store.subscribe(TELEM_PIPE, move |_, value| {
                if let (Some(agg), Value::Telemetry(telem)) = (w.upgrade(), value) {
                    agg.apply_telemetry(telem);
                }
            });

            let w = weak.clone();
            let bridge = store.subscribe(BRIDGE_LINK_STATUS, move |_, value| {
                if let (Some(agg), Value::Status(status)) = (w.upgrade(), value) {
                    agg.apply_bridge_status(*status);
                }
            });

            let w = weak.clone();
            let flags = store.subscribe_prefix(MONITOR_FLAG_PREFIX, move |_, _, _| {
                if let Some(agg) = w.upgrade() {
                    agg.refresh_system();
                }
            });

            Self {
                monitor: Monitor::new(Arc::clone(&store)),
                store,
                refresh_lock: Mutex::new(()),
                telem_sub: telem,
                bridge_sub: bridge,
                flags_sub: flags,
            }
        })
    }

    pub fn apply_telemetry(&self, telem: &MultiControllerTelem) {
        self.update_value(DeviceKind::Pump, telem.pump_state);
        self.update_value(DeviceKind::Lamp, telem.lamp_state);
        self.update_value(DeviceKind::UpperLevel, telem.upper_state);
        self.update_value(DeviceKind::WaterLevel, telem.water_level);
        self.update_value(DeviceKind::PhMeter, telem.ph);
        self.update_value(DeviceKind::PpmMeter, telem.ppm);
        self.update_value(DeviceKind::Turbidimeter, telem.turbidimeter);
        self.update_value(DeviceKind::Temperature, telem.temperature);

        for kind in DeviceKind::REPORTED {
            let (status, text) = evaluate(kind, telem.status_flags(kind));
            self.update_status(kind, status, text);
        }
    }

    pub fn apply_bridge_status(&self, status: DeviceStatus) {
        let text = match status {
            DeviceStatus::Error => "Bridge not answering",
            DeviceStatus::NotFound => "Bridge serial device lost",
            DeviceStatus::Warning => "Bridge working but no slaves found",
            DeviceStatus::Working => "Bridge and slaves working",
        };
        self.update_value(DeviceKind::Bridge, true);
        self.update_status(DeviceKind::Bridge, status, text.to_string());
    }

    /// Recompute the system pseudo-device from the currently raised flags.
    pub fn refresh_system(&self) {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let active = self.monitor.active();
        let bits = active.iter().fold(0, |acc, f| acc | f.bit());
        let (working, status, text) = system_summary(&active);
        debug!(?active, status = status.as_str(), "aggregator: system status");

        self.store.set(DEVICE_FLAGS, bits);
        self.update_value(DeviceKind::System, working);
        self.update_status(DeviceKind::System, status, text);
    }

    fn update_value<T: StoreType>(&self, kind: DeviceKind, value: T) {
        self.store.set(&value_key(kind.name()), value);
    }

    fn update_status(&self, kind: DeviceKind, status: DeviceStatus, text: String) {
        self.store.set(&status_key(kind.name()), status);
        self.store.set(&status_str_key(kind.name()), text);
    }
}

impl Drop for DeviceStatusAggregator {
    fn drop(&mut self) {
        self.store.unsubscribe(TELEM_PIPE, self.telem_sub);
        self.store.unsubscribe(BRIDGE_LINK_STATUS, self.bridge_sub);
        self.store.unsubscribe_prefix(MONITOR_FLAG_PREFIX, self.flags_sub);
    }
}

/// Fold the raised flags into `(value, status, text)` for the system
/// pseudo-device. `value` is false whenever a flag stops an operation.
pub fn system_summary(active: &[MonitorFlag]) -> (bool, DeviceStatus, String) {
    let mut working = true;
    let mut status = DeviceStatus::Working;
    let mut lines = Vec::new();

    for flag in active {
        let (severity, stops, text) = match flag {
            MonitorFlag::FloatLevelTimeout => (DeviceStatus::Warning, false, "Float level stuck"),
            MonitorFlag::NotFloodedInTime => {
                (DeviceStatus::Warning, false, "Upper tank not flooded in time")
            }
            MonitorFlag::NoUpperForSwing => (
                DeviceStatus::Warning,
                true,
                "Pump mode is swing but upper level sensor is missing",
            ),
            MonitorFlag::PumpNotOperate => {
                (DeviceStatus::Error, true, "Pump control disabled by error")
            }
            MonitorFlag::PumpControllerLost => {
                (DeviceStatus::Error, true, "Pump controller stopped: pump lost")
            }
            MonitorFlag::LampControllerLost => {
                (DeviceStatus::Error, true, "Lamp controller stopped: lamp lost")
            }
        };

        if severity == DeviceStatus::Error || status == DeviceStatus::Working {
            status = severity;
        }
        working &= !stops;
        lines.push(text);
    }

    let text = if lines.is_empty() {
        "No errors".to_string()
    } else {
        lines.join("\n")
    };
    (working, status, text)
}

/// Every `<device>.telem.value` key, used by the history recorder.
pub fn value_keys() -> Vec<String> {
    DeviceKind::ALL
        .into_iter()
        .map(|d| value_key(d.name()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
