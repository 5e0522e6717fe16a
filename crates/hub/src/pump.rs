//! Pump controller.
//!
//! The pump alternates between two coarse phases: `Irrigation` (pump on,
//! flooding the grow bed) and `Drainage` (pump off). In swing mode the
//! irrigation phase is further pulsed to fill an upper tank until its float
//! sensor reports flooded.
//!
//! Each tick reads the current settings from the store, decides the desired
//! pump state under the controller's private lock, and writes it back to
//! `pump.int.desiredState`. A separate validator compares the desired state
//! with the reported one at most once per `validTime` and emits a
//! [`Command::PumpSetState`] when they disagree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{Command, EventBus};
use crate::device::DeviceStatus;
use crate::monitor::{Monitor, MonitorFlag};
use crate::names::{
    self, status_key, value_key, PUMP_DESIRED_STATE, PUMP_ENABLED, PUMP_MAX_FLOOD_TIME, PUMP_MODE,
    PUMP_NEXT_SWITCH_TIME, PUMP_OFF_TIME, PUMP_ON_TIME, PUMP_PLAIN_TYPE, PUMP_SWING_STATE,
    PUMP_SWING_TIME, PUMP_VALID_TIME, SYSTEM_MAINTENANCE, WATER_LEVEL_MIN,
};
use crate::store::{SharedStore, SubscriptionId, Value};

const TICK_INTERVAL: Duration = Duration::from_millis(200);
const MAINTENANCE_RETRY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Phase types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpMode {
    EbbNormal,
    EbbSwing,
    Dripping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlainType {
    Drainage,
    Irrigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingState {
    SwingOn,
    SwingOff,
}

/// What the loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// Maintenance is on; nothing was evaluated.
    Paused,
    /// The pump is gone; the loop must exit.
    Stopped,
}

// ---------------------------------------------------------------------------
// Controller state
// ---------------------------------------------------------------------------

/// Timers are `None` until the first tick that needs them arms them.
struct PumpState {
    plain: PlainType,
    swing: SwingState,
    last_action: Option<Instant>,
    last_swing: Option<Instant>,
    flood_deadline: Option<Instant>,
    last_validation: Option<Instant>,
}

impl PumpState {
    fn new() -> Self {
        Self {
            plain: PlainType::Drainage,
            swing: SwingState::SwingOff,
            last_action: None,
            last_swing: None,
            flood_deadline: None,
            last_validation: None,
        }
    }
}

struct Settings {
    enabled: bool,
    mode: PumpMode,
    on_time: Duration,
    off_time: Duration,
    swing_time: Duration,
    valid_time: Duration,
    max_flood_time: Duration,
}

struct Keys {
    pump_value: String,
    pump_status: String,
    upper_value: String,
    upper_status: String,
    water_level: String,
}

impl Keys {
    fn new() -> Self {
        Self {
            pump_value: value_key(names::PUMP),
            pump_status: status_key(names::PUMP),
            upper_value: value_key(names::UPPER_LEVEL),
            upper_status: status_key(names::UPPER_LEVEL),
            water_level: value_key(names::WATER_LEVEL),
        }
    }
}

pub struct PumpController {
    store: SharedStore,
    bus: EventBus,
    monitor: Monitor,
    keys: Keys,
    state: Mutex<PumpState>,
    launched: AtomicBool,
    running: AtomicBool,
    subscriptions: Vec<SubscriptionId>,
}

impl PumpController {
    pub fn new(store: SharedStore, bus: EventBus) -> Arc<Self> {
        let keys = Keys::new();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let mode = store.subscribe(PUMP_MODE, move |_, value| {
                if let (Some(ctrl), Value::PumpMode(mode)) = (w.upgrade(), value) {
                    ctrl.on_mode_changed(*mode);
                }
            });

            let w = weak.clone();
            let pump_status = store.subscribe(&keys.pump_status, move |_, value| {
                if let (Some(ctrl), Value::Status(status)) = (w.upgrade(), value) {
                    if *status != DeviceStatus::NotFound {
                        ctrl.monitor.clear(MonitorFlag::PumpControllerLost);
                    }
                }
            });

            let w = weak.clone();
            let upper_status = store.subscribe(&keys.upper_status, move |_, value| {
                if let (Some(ctrl), Value::Status(status)) = (w.upgrade(), value) {
                    if *status != DeviceStatus::NotFound {
                        ctrl.monitor.clear(MonitorFlag::NoUpperForSwing);
                    }
                }
            });

            if !store.has(PUMP_DESIRED_STATE) {
                store.set(PUMP_DESIRED_STATE, false);
            }
            store.set(PUMP_PLAIN_TYPE, PlainType::Drainage);
            store.set(PUMP_SWING_STATE, SwingState::SwingOff);

            Self {
                monitor: Monitor::new(Arc::clone(&store)),
                store,
                bus,
                keys,
                state: Mutex::new(PumpState::new()),
                launched: AtomicBool::new(false),
                running: AtomicBool::new(false),
                subscriptions: vec![mode, pump_status, upper_status],
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Lifecycle ----------------------------------------------------------

    /// True once every key the controller reads exists and the pump is
    /// present.
    pub fn ready(&self) -> bool {
        let required = [
            PUMP_ENABLED,
            PUMP_MODE,
            PUMP_DESIRED_STATE,
            PUMP_ON_TIME,
            PUMP_OFF_TIME,
            PUMP_SWING_TIME,
            PUMP_VALID_TIME,
            PUMP_MAX_FLOOD_TIME,
            SYSTEM_MAINTENANCE,
            WATER_LEVEL_MIN,
            self.keys.pump_value.as_str(),
            self.keys.pump_status.as_str(),
            self.keys.upper_value.as_str(),
            self.keys.water_level.as_str(),
        ];
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|k| !self.store.has(k))
            .collect();
        if !missing.is_empty() {
            debug!(?missing, "pump: not ready");
            return false;
        }
        self.pump_status() != Some(DeviceStatus::NotFound)
    }

    /// Spawn the control loop. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.launched.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).run());
        true
    }

    /// Whether the loop has been started and has not stopped.
    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn was_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        info!("pump: controller started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            match self.tick(Instant::now()) {
                TickOutcome::Ran => {}
                TickOutcome::Paused => tokio::time::sleep(MAINTENANCE_RETRY).await,
                TickOutcome::Stopped => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
        error!("pump: controller stopped");
    }

    // -- Tick ---------------------------------------------------------------

    /// Evaluate one step of the control logic at `now`.
    pub fn tick(&self, now: Instant) -> TickOutcome {
        if self.store.get_or(SYSTEM_MAINTENANCE, false) {
            return TickOutcome::Paused;
        }

        let mut state = self.lock_state();

        if self.pump_status() == Some(DeviceStatus::NotFound) {
            if self.store.get_or(PUMP_ENABLED, false) {
                self.monitor.set(MonitorFlag::PumpControllerLost);
            }
            error!("pump: device not found, stopping control loop");
            return TickOutcome::Stopped;
        }

        let Some(settings) = self.settings() else {
            warn!("pump: settings incomplete, skipping tick");
            return TickOutcome::Ran;
        };

        if !settings.enabled {
            state.last_action = None;
            self.enter_drainage(&mut state);
        } else {
            match settings.mode {
                PumpMode::EbbNormal | PumpMode::Dripping => {
                    self.process_timed(&mut state, &settings, now)
                }
                PumpMode::EbbSwing => self.process_swing(&mut state, &settings, now),
            }
        }

        self.publish_phase(&state, &settings, now);
        self.validate(&mut state, settings.valid_time, now);
        TickOutcome::Ran
    }

    /// Plain on/off duty cycle shared by the ebb-and-flow and drip modes.
    fn process_timed(&self, state: &mut PumpState, s: &Settings, now: Instant) {
        let since = *state.last_action.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);

        match state.plain {
            PlainType::Irrigation => {
                if elapsed >= s.on_time {
                    state.last_action = Some(now);
                    self.enter_drainage(state);
                }
            }
            PlainType::Drainage => {
                if elapsed >= s.off_time {
                    state.last_action = Some(now);
                    if self.permit_for_action() {
                        self.monitor.clear(MonitorFlag::PumpNotOperate);
                        self.enter_irrigation(state);
                    } else {
                        self.monitor.set(MonitorFlag::PumpNotOperate);
                    }
                }
            }
        }
    }

    fn process_swing(&self, state: &mut PumpState, s: &Settings, now: Instant) {
        let since = *state.last_action.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);

        match state.plain {
            PlainType::Drainage => {
                if elapsed >= s.off_time {
                    state.last_action = Some(now);
                    if self.permit_for_action() {
                        self.monitor.clear(MonitorFlag::PumpNotOperate);
                        state.swing = SwingState::SwingOn;
                        state.flood_deadline = Some(now + s.max_flood_time);
                        self.enter_irrigation(state);
                    } else {
                        self.monitor.set(MonitorFlag::PumpNotOperate);
                    }
                }
            }
            PlainType::Irrigation => {
                if elapsed >= s.on_time {
                    state.last_action = Some(now);
                    self.enter_drainage(state);
                    return;
                }

                let abort = if !self.permit_for_action() {
                    Some(MonitorFlag::PumpNotOperate)
                } else if state.flood_deadline.is_some_and(|d| now >= d) {
                    Some(MonitorFlag::NotFloodedInTime)
                } else if self.upper_status() == Some(DeviceStatus::NotFound) {
                    Some(MonitorFlag::NoUpperForSwing)
                } else {
                    None
                };
                if let Some(flag) = abort {
                    warn!(flag = flag.name(), "pump: irrigation aborted");
                    state.last_action = Some(now);
                    self.enter_drainage(state);
                    self.monitor.set(flag);
                    return;
                }

                match state.swing {
                    SwingState::SwingOff => {
                        let due = state
                            .last_swing
                            .map_or(true, |t| now.saturating_duration_since(t) >= s.swing_time);
                        if due {
                            state.swing = SwingState::SwingOn;
                            self.set_desired(true);
                        }
                    }
                    SwingState::SwingOn => {
                        if self.store.get_or(&self.keys.upper_value, false) {
                            state.swing = SwingState::SwingOff;
                            state.last_swing = Some(now);
                            state.flood_deadline = None;
                            self.set_desired(false);
                            self.monitor.clear(MonitorFlag::NotFloodedInTime);
                        }
                    }
                }
            }
        }
    }

    fn enter_irrigation(&self, state: &mut PumpState) {
        if state.plain != PlainType::Irrigation {
            info!("pump: irrigation");
        }
        state.plain = PlainType::Irrigation;
        self.set_desired(true);
    }

    fn enter_drainage(&self, state: &mut PumpState) {
        if state.plain != PlainType::Drainage {
            info!("pump: drainage");
        }
        state.plain = PlainType::Drainage;
        state.swing = SwingState::SwingOff;
        state.flood_deadline = None;
        self.set_desired(false);
    }

    /// Irrigation is allowed only while the reservoir is above its minimum.
    fn permit_for_action(&self) -> bool {
        let level = self.store.get::<f64>(&self.keys.water_level);
        let min = self.store.get::<f64>(WATER_LEVEL_MIN);
        matches!((level, min), (Some(level), Some(min)) if level > min)
    }

    fn validate(&self, state: &mut PumpState, valid_time: Duration, now: Instant) {
        if state
            .last_validation
            .is_some_and(|t| now.saturating_duration_since(t) < valid_time)
        {
            return;
        }
        state.last_validation = Some(now);

        let desired = self.store.get_or(PUMP_DESIRED_STATE, false);
        let actual = self.store.get::<bool>(&self.keys.pump_value);
        if actual != Some(desired) {
            info!(desired, ?actual, "pump: commanding state");
            self.bus.send(Command::PumpSetState(desired));
        }
    }

    fn publish_phase(&self, state: &PumpState, s: &Settings, now: Instant) {
        let phase = match state.plain {
            PlainType::Irrigation => s.on_time,
            PlainType::Drainage => s.off_time,
        };
        let elapsed = state
            .last_action
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        let remaining = Duration::from_secs(phase.saturating_sub(elapsed).as_secs());

        self.store.set(PUMP_PLAIN_TYPE, state.plain);
        self.store.set(PUMP_SWING_STATE, state.swing);
        self.store.set(PUMP_NEXT_SWITCH_TIME, remaining);
    }

    // -- Notifications ------------------------------------------------------

    fn on_mode_changed(&self, mode: PumpMode) {
        let mut state = self.lock_state();
        info!(?mode, "pump: mode changed, restarting cycle");
        state.last_action = None;
        state.last_swing = None;
        state.last_validation = None;
        self.enter_drainage(&mut state);
        self.store.set(PUMP_PLAIN_TYPE, state.plain);
        self.store.set(PUMP_SWING_STATE, state.swing);
    }

    // -- Store access -------------------------------------------------------

    fn settings(&self) -> Option<Settings> {
        Some(Settings {
            enabled: self.store.get(PUMP_ENABLED)?,
            mode: self.store.get(PUMP_MODE)?,
            on_time: self.store.get(PUMP_ON_TIME)?,
            off_time: self.store.get(PUMP_OFF_TIME)?,
            swing_time: self.store.get(PUMP_SWING_TIME)?,
            valid_time: self.store.get(PUMP_VALID_TIME)?,
            max_flood_time: self.store.get(PUMP_MAX_FLOOD_TIME)?,
        })
    }

    fn pump_status(&self) -> Option<DeviceStatus> {
        self.store.get(&self.keys.pump_status)
    }

    fn upper_status(&self) -> Option<DeviceStatus> {
        self.store.get(&self.keys.upper_status)
    }

    fn set_desired(&self, on: bool) {
        self.store.set(PUMP_DESIRED_STATE, on);
    }
}

impl Drop for PumpController {
    fn drop(&mut self) {
        for id in &self.subscriptions {
            self.store.unsubscribe_all(*id);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
