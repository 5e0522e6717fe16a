//! TOML settings file: loading, validation, seeding the store, and writing
//! operator changes back to disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::UtcOffset;
use tracing::{error, info, warn};

use crate::names::{
    BRIDGE_MAC, LAMP_ENABLED, LAMP_OFF_TIME, LAMP_ON_TIME, PUMP_ENABLED, PUMP_MAX_FLOOD_TIME,
    PUMP_MODE, PUMP_OFF_TIME, PUMP_ON_TIME, PUMP_SWING_TIME, PUMP_VALID_TIME, SYSTEM_MAINTENANCE,
    WATER_LEVEL_MIN,
};
use crate::pump::PumpMode;
use crate::store::{SharedStore, Store, SubscriptionId, Value};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lamp: LampSettings,
    pub pump: PumpSettings,
    pub water_level: WaterLevelSettings,
    pub system: SystemSettings,
    pub bridge: BridgeSettings,
}

/// Lamp window, in minutes since midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LampSettings {
    pub enabled: bool,
    pub on_time: i64,
    pub off_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub enabled: bool,
    pub mode: PumpMode,
    pub on_time_sec: u64,
    pub off_time_sec: u64,
    pub swing_time_sec: u64,
    pub valid_time_sec: u64,
    pub max_flood_time_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterLevelSettings {
    /// Irrigation is withheld at or below this reservoir level (percent).
    pub min_value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub maintenance: bool,
    /// Local time is UTC shifted by this many minutes.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub mac: String,
}

impl Default for LampSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            on_time: 8 * 60,
            off_time: 22 * 60,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PumpMode::EbbNormal,
            on_time_sec: 15,
            off_time_sec: 30,
            swing_time_sec: 8,
            valid_time_sec: 50,
            max_flood_time_sec: 180,
        }
    }
}

impl Default for WaterLevelSettings {
    fn default() -> Self {
        Self { min_value: 0.0 }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            mac: "E8:31:CD:D6:D1:B4".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store schema
// ---------------------------------------------------------------------------

/// One persisted setting: its store key and typed value.
#[derive(Debug, Clone)]
pub struct Setting {
    pub key: &'static str,
    pub value: Value,
    pub description: &'static str,
}

impl Config {
    /// Every persisted setting, in store form.
    pub fn settings(&self) -> Vec<Setting> {
        let secs = Duration::from_secs;
        vec![
            Setting {
                key: LAMP_ENABLED,
                value: Value::Bool(self.lamp.enabled),
                description: "Lamp control enabled",
            },
            Setting {
                key: LAMP_ON_TIME,
                value: Value::Int(self.lamp.on_time),
                description: "Lamp on, minute of day",
            },
            Setting {
                key: LAMP_OFF_TIME,
                value: Value::Int(self.lamp.off_time),
                description: "Lamp off, minute of day",
            },
            Setting {
                key: PUMP_ENABLED,
                value: Value::Bool(self.pump.enabled),
                description: "Pump control enabled",
            },
            Setting {
                key: PUMP_MODE,
                value: Value::PumpMode(self.pump.mode),
                description: "Pump working mode",
            },
            Setting {
                key: PUMP_ON_TIME,
                value: Value::Duration(secs(self.pump.on_time_sec)),
                description: "Irrigation phase length",
            },
            Setting {
                key: PUMP_OFF_TIME,
                value: Value::Duration(secs(self.pump.off_time_sec)),
                description: "Drainage phase length",
            },
            Setting {
                key: PUMP_SWING_TIME,
                value: Value::Duration(secs(self.pump.swing_time_sec)),
                description: "Pause between swing pulses",
            },
            Setting {
                key: PUMP_VALID_TIME,
                value: Value::Duration(secs(self.pump.valid_time_sec)),
                description: "Minimum interval between pump commands",
            },
            Setting {
                key: PUMP_MAX_FLOOD_TIME,
                value: Value::Duration(secs(self.pump.max_flood_time_sec)),
                description: "Upper tank must flood within this time",
            },
            Setting {
                key: WATER_LEVEL_MIN,
                value: Value::Float(self.water_level.min_value),
                description: "Minimum reservoir level for irrigation",
            },
            Setting {
                key: SYSTEM_MAINTENANCE,
                value: Value::Bool(self.system.maintenance),
                description: "Pause every controller",
            },
            Setting {
                key: BRIDGE_MAC,
                value: Value::Text(self.bridge.mac.clone()),
                description: "Radio bridge MAC address",
            },
        ]
    }

    /// Rebuild a config from the store, taking anything missing from
    /// `base`.
    pub fn from_store(store: &Store, base: &Config) -> Config {
        let secs = |key: &str, fallback: u64| {
            store
                .get::<Duration>(key)
                .map_or(fallback, |d| d.as_secs())
        };

        Config {
            lamp: LampSettings {
                enabled: store.get_or(LAMP_ENABLED, base.lamp.enabled),
                on_time: store.get_or(LAMP_ON_TIME, base.lamp.on_time),
                off_time: store.get_or(LAMP_OFF_TIME, base.lamp.off_time),
            },
            pump: PumpSettings {
                enabled: store.get_or(PUMP_ENABLED, base.pump.enabled),
                mode: store.get_or(PUMP_MODE, base.pump.mode),
                on_time_sec: secs(PUMP_ON_TIME, base.pump.on_time_sec),
                off_time_sec: secs(PUMP_OFF_TIME, base.pump.off_time_sec),
                swing_time_sec: secs(PUMP_SWING_TIME, base.pump.swing_time_sec),
                valid_time_sec: secs(PUMP_VALID_TIME, base.pump.valid_time_sec),
                max_flood_time_sec: secs(PUMP_MAX_FLOOD_TIME, base.pump.max_flood_time_sec),
            },
            water_level: WaterLevelSettings {
                min_value: store.get_or(WATER_LEVEL_MIN, base.water_level.min_value),
            },
            system: SystemSettings {
                maintenance: store.get_or(SYSTEM_MAINTENANCE, base.system.maintenance),
                utc_offset_minutes: base.system.utc_offset_minutes,
            },
            bridge: BridgeSettings {
                mac: store.get_or(BRIDGE_MAC, base.bridge.mac.clone()),
            },
        }
    }

    /// Overwrite the field behind one store key. Returns false when `key` is
    /// not a setting or `value` has the wrong type.
    pub fn set_setting(&mut self, key: &str, value: &Value) -> bool {
        match (key, value) {
            (LAMP_ENABLED, Value::Bool(v)) => self.lamp.enabled = *v,
            (LAMP_ON_TIME, Value::Int(v)) => self.lamp.on_time = *v,
            (LAMP_OFF_TIME, Value::Int(v)) => self.lamp.off_time = *v,
            (PUMP_ENABLED, Value::Bool(v)) => self.pump.enabled = *v,
            (PUMP_MODE, Value::PumpMode(v)) => self.pump.mode = *v,
            (PUMP_ON_TIME, Value::Duration(d)) => self.pump.on_time_sec = d.as_secs(),
            (PUMP_OFF_TIME, Value::Duration(d)) => self.pump.off_time_sec = d.as_secs(),
            (PUMP_SWING_TIME, Value::Duration(d)) => self.pump.swing_time_sec = d.as_secs(),
            (PUMP_VALID_TIME, Value::Duration(d)) => self.pump.valid_time_sec = d.as_secs(),
            (PUMP_MAX_FLOOD_TIME, Value::Duration(d)) => {
                self.pump.max_flood_time_sec = d.as_secs()
            }
            (WATER_LEVEL_MIN, Value::Float(v)) => self.water_level.min_value = *v,
            (SYSTEM_MAINTENANCE, Value::Bool(v)) => self.system.maintenance = *v,
            (BRIDGE_MAC, Value::Text(v)) => self.bridge.mac = v.clone(),
            _ => return false,
        }
        true
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.system.utc_offset_minutes * 60).with_context(|| {
            format!(
                "utc_offset_minutes {} is not a valid offset",
                self.system.utc_offset_minutes
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

const MINUTES_PER_DAY: i64 = 24 * 60;

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_lamp(&mut errors);
        self.validate_pump(&mut errors);
        self.validate_other(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_lamp(&self, errors: &mut Vec<String>) {
        for (name, minute) in [("on_time", self.lamp.on_time), ("off_time", self.lamp.off_time)] {
            if !(0..MINUTES_PER_DAY).contains(&minute) {
                errors.push(format!(
                    "lamp: {name} {minute} out of range [0, {MINUTES_PER_DAY})"
                ));
            }
        }
    }

    fn validate_pump(&self, errors: &mut Vec<String>) {
        let p = &self.pump;
        for (name, value) in [
            ("on_time_sec", p.on_time_sec),
            ("off_time_sec", p.off_time_sec),
            ("swing_time_sec", p.swing_time_sec),
            ("valid_time_sec", p.valid_time_sec),
            ("max_flood_time_sec", p.max_flood_time_sec),
        ] {
            if value == 0 {
                errors.push(format!("pump: {name} must be positive"));
            }
        }
    }

    fn validate_other(&self, errors: &mut Vec<String>) {
        let min = self.water_level.min_value;
        if !(0.0..=100.0).contains(&min) {
            errors.push(format!(
                "water_level: min_value {min} out of range [0.0, 100.0]"
            ));
        }

        // UTC-12:00 .. UTC+14:00
        if !(-720..=840).contains(&self.system.utc_offset_minutes) {
            errors.push(format!(
                "system: utc_offset_minutes {} out of range [-720, 840]",
                self.system.utc_offset_minutes
            ));
        }

        if !is_valid_mac(&self.bridge.mac) {
            errors.push(format!(
                "bridge: mac '{}' is not of the form XX:XX:XX:XX:XX:XX",
                self.bridge.mac
            ));
        }
    }
}

/// Check a pending store write. For a setting key, the config the store
/// would hold after the write must validate; any other key passes.
pub fn check_setting(store: &Store, key: &str, value: &Value) -> Result<()> {
    let mut candidate = Config::from_store(store, &Config::default());
    if !candidate.set_setting(key, value) {
        return Ok(());
    }
    candidate.validate()
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

// ---------------------------------------------------------------------------
// Load, save, apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Load the config, writing the defaults back when the file did not exist.
pub fn load_or_init(path: &Path) -> Result<Config> {
    let existed = path.exists();
    let config = load(path)?;
    if !existed {
        save(path, &config)?;
    }
    Ok(config)
}

pub fn save(path: &Path, config: &Config) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// Write every setting into the store.
pub fn apply(config: &Config, store: &Store) {
    let settings = config.settings();
    let mut rejected = 0;
    for s in &settings {
        if !store.set_value(s.key, s.value.clone()) && store.kind(s.key) != Some(s.value.kind()) {
            rejected += 1;
        }
    }

    info!(settings = settings.len(), rejected, "config applied");
}

// ---------------------------------------------------------------------------
// Autosave
// ---------------------------------------------------------------------------

/// Writes the settings file whenever a setting changes in the store.
/// Attach after [`apply`] so the initial seeding is not saved back.
pub struct SettingsPersister {
    store: SharedStore,
    path: PathBuf,
    base: Config,
    write_lock: Mutex<()>,
    subscriptions: Vec<SubscriptionId>,
}

impl SettingsPersister {
    pub fn attach(store: SharedStore, path: PathBuf, base: Config) -> Arc<Self> {
        let keys: Vec<&'static str> = base.settings().iter().map(|s| s.key).collect();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let subscriptions = keys
                .into_iter()
                .map(|key| {
                    let w = weak.clone();
                    store.subscribe(key, move |key, _| {
                        if let Some(persister) = w.upgrade() {
                            persister.persist(key);
                        }
                    })
                })
                .collect();

            Self {
                store,
                path,
                base,
                write_lock: Mutex::new(()),
                subscriptions,
            }
        })
    }

    fn persist(&self, changed: &str) {
        let config = Config::from_store(&self.store, &self.base);
        if let Err(e) = config.validate() {
            warn!(key = changed, error = %format!("{e:#}"), "settings: not saving invalid config");
            return;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match save(&self.path, &config) {
            Ok(()) => info!(key = changed, path = %self.path.display(), "settings: saved"),
            Err(e) => error!(key = changed, error = %format!("{e:#}"), "settings: save failed"),
        }
    }
}

impl Drop for SettingsPersister {
    fn drop(&mut self) {
        for id in &self.subscriptions {
            self.store.unsubscribe_all(*id);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
