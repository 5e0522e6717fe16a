//! Store key names.
//!
//! Keys are dotted paths: `<device>.<section>.<field>`. Sections used here
//! are `telem` (measured state), `config` (operator settings, persisted),
//! `int` (controller internals) and `rs` (raw transport data).

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

pub const MULTI_CONTROLLER: &str = "multiController";
pub const WATER_LEVEL: &str = "waterLevel";
pub const PPM_METER: &str = "ppmMeter";
pub const PUMP: &str = "pump";
pub const LAMP: &str = "lamp";
pub const UPPER_LEVEL: &str = "upperLevel";
pub const PH_METER: &str = "phMeter";
pub const TURBIDIMETER: &str = "turbidimeter";
pub const TEMPERATURE: &str = "temperature";
pub const BRIDGE: &str = "bridge";
pub const SYSTEM: &str = "system";

// ---------------------------------------------------------------------------
// Per-device telemetry keys
// ---------------------------------------------------------------------------

pub fn value_key(device: &str) -> String {
    format!("{device}.telem.value")
}

pub fn status_key(device: &str) -> String {
    format!("{device}.telem.status")
}

pub fn status_str_key(device: &str) -> String {
    format!("{device}.telem.statusStr")
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Latest decoded multi-controller telemetry burst.
pub const TELEM_PIPE: &str = "multiController.rs.data";
/// Link health of the radio bridge, driven by the bridge state machine.
pub const BRIDGE_LINK_STATUS: &str = "bridge.rs.status";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub const LAMP_ENABLED: &str = "lamp.config.enabled";
pub const LAMP_ON_TIME: &str = "lamp.config.onTime";
pub const LAMP_OFF_TIME: &str = "lamp.config.offTime";

pub const PUMP_ENABLED: &str = "pump.config.enabled";
pub const PUMP_MODE: &str = "pump.config.mode";
pub const PUMP_ON_TIME: &str = "pump.config.onTime";
pub const PUMP_OFF_TIME: &str = "pump.config.offTime";
pub const PUMP_SWING_TIME: &str = "pump.config.swingTime";
pub const PUMP_VALID_TIME: &str = "pump.config.validTime";
pub const PUMP_MAX_FLOOD_TIME: &str = "pump.config.maxFloodTime";

pub const WATER_LEVEL_MIN: &str = "waterLevel.config.minValue";
pub const BRIDGE_MAC: &str = "bridge.config.mac";
pub const SYSTEM_MAINTENANCE: &str = "system.config.maintenance";

// ---------------------------------------------------------------------------
// Controller internals
// ---------------------------------------------------------------------------

pub const PUMP_PLAIN_TYPE: &str = "pump.int.plainType";
pub const PUMP_SWING_STATE: &str = "pump.int.swingState";
pub const PUMP_NEXT_SWITCH_TIME: &str = "pump.int.nextSwitchTime";
pub const PUMP_DESIRED_STATE: &str = "pump.int.desiredState";
pub const LAMP_DESIRED_STATE: &str = "lamp.int.desiredState";

/// One boolean entry per monitor flag lives under this prefix.
pub const MONITOR_FLAG_PREFIX: &str = "system.int.flags.";
/// Bit union of every raised monitor flag.
pub const DEVICE_FLAGS: &str = "system.int.deviceFlags";
