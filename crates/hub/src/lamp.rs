//! Lamp controller: a daily on/off window in minutes since midnight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, error, info};

use crate::bus::{Command, EventBus};
use crate::device::DeviceStatus;
use crate::monitor::{Monitor, MonitorFlag};
use crate::names::{
    self, status_key, value_key, LAMP_DESIRED_STATE, LAMP_ENABLED, LAMP_OFF_TIME, LAMP_ON_TIME,
    SYSTEM_MAINTENANCE,
};
use crate::pump::TickOutcome;
use crate::store::{SharedStore, SubscriptionId, Value};

const TICK_INTERVAL: Duration = Duration::from_secs(10);
const MINUTES_PER_DAY: i64 = 24 * 60;

/// Whether `minute` falls inside the `[on, off)` window. A window whose
/// start is after its end wraps past midnight.
pub fn is_lamp_active(minute: i64, on: i64, off: i64) -> bool {
    let minute = minute.rem_euclid(MINUTES_PER_DAY);
    if on <= off {
        minute >= on && minute < off
    } else {
        minute >= on || minute < off
    }
}

/// Minutes since local midnight, local being UTC shifted by `offset`.
pub fn minute_of_day(offset: UtcOffset) -> i64 {
    let now = OffsetDateTime::now_utc().to_offset(offset);
    i64::from(now.hour()) * 60 + i64::from(now.minute())
}

pub struct LampController {
    store: SharedStore,
    bus: EventBus,
    monitor: Monitor,
    offset: UtcOffset,
    value_key: String,
    status_key: String,
    launched: AtomicBool,
    running: AtomicBool,
    subscriptions: Vec<SubscriptionId>,
}

impl LampController {
    pub fn new(store: SharedStore, bus: EventBus, offset: UtcOffset) -> Arc<Self> {
        let value_key = value_key(names::LAMP);
        let status_key = status_key(names::LAMP);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let status = store.subscribe(&status_key, move |_, value| {
                if let (Some(ctrl), Value::Status(status)) = (w.upgrade(), value) {
                    if *status != DeviceStatus::NotFound {
                        ctrl.monitor.clear(MonitorFlag::LampControllerLost);
                    }
                }
            });

            Self {
                monitor: Monitor::new(Arc::clone(&store)),
                store,
                bus,
                offset,
                value_key,
                status_key,
                launched: AtomicBool::new(false),
                running: AtomicBool::new(false),
                subscriptions: vec![status],
            }
        })
    }

    pub fn ready(&self) -> bool {
        let required = [
            LAMP_ENABLED,
            LAMP_ON_TIME,
            LAMP_OFF_TIME,
            SYSTEM_MAINTENANCE,
            self.value_key.as_str(),
            self.status_key.as_str(),
        ];
        if let Some(missing) = required.into_iter().find(|k| !self.store.has(k)) {
            debug!(missing, "lamp: not ready");
            return false;
        }
        self.status() != Some(DeviceStatus::NotFound)
    }

    pub fn start(self: &Arc<Self>) -> bool {
        if self.launched.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).run());
        true
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn was_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        info!(offset = %self.offset, "lamp: controller started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if self.tick_at(minute_of_day(self.offset)) == TickOutcome::Stopped {
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        error!("lamp: controller stopped");
    }

    /// Evaluate the lamp at the given minute of day.
    pub fn tick_at(&self, minute: i64) -> TickOutcome {
        if self.store.get_or(SYSTEM_MAINTENANCE, false) {
            return TickOutcome::Paused;
        }

        let enabled = self.store.get_or(LAMP_ENABLED, false);
        if self.status() == Some(DeviceStatus::NotFound) {
            if enabled {
                self.monitor.set(MonitorFlag::LampControllerLost);
            }
            error!("lamp: device not found, stopping control loop");
            return TickOutcome::Stopped;
        }

        let (Some(on), Some(off)) = (
            self.store.get::<i64>(LAMP_ON_TIME),
            self.store.get::<i64>(LAMP_OFF_TIME),
        ) else {
            return TickOutcome::Ran;
        };

        let desired = enabled && is_lamp_active(minute, on, off);
        if self.store.set(LAMP_DESIRED_STATE, desired) {
            info!(desired, minute, "lamp: desired state");
        }

        let actual = self.store.get::<bool>(&self.value_key);
        if actual != Some(desired) {
            self.bus.send(Command::LampSetState(desired));
        }
        TickOutcome::Ran
    }

    fn status(&self) -> Option<DeviceStatus> {
        self.store.get(&self.status_key)
    }
}

impl Drop for LampController {
    fn drop(&mut self) {
        for id in &self.subscriptions {
            self.store.unsubscribe_all(*id);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tokio::sync::broadcast::error::TryRecvError;

    fn setup(on: i64, off: i64) -> (SharedStore, EventBus, Arc<LampController>) {
        let store: SharedStore = Arc::new(Store::new());
        Monitor::new(Arc::clone(&store)).init();
        store.set(LAMP_ENABLED, true);
        store.set(LAMP_ON_TIME, on);
        store.set(LAMP_OFF_TIME, off);
        store.set(SYSTEM_MAINTENANCE, false);
        store.set("lamp.telem.value", false);
        store.set("lamp.telem.status", DeviceStatus::Working);

        let bus = EventBus::new(16);
        let lamp = LampController::new(Arc::clone(&store), bus.clone(), UtcOffset::UTC);
        (store, bus, lamp)
    }

    // -- Window -------------------------------------------------------------

    #[test]
    fn daytime_window() {
        assert!(!is_lamp_active(479, 480, 1320));
        assert!(is_lamp_active(480, 480, 1320));
        assert!(is_lamp_active(1319, 480, 1320));
        assert!(!is_lamp_active(1320, 480, 1320));
    }

    #[test]
    fn window_wraps_past_midnight() {
        assert!(is_lamp_active(30, 1380, 60));
        assert!(is_lamp_active(1440 + 30, 1380, 60));
        assert!(is_lamp_active(1380, 1380, 60));
        assert!(!is_lamp_active(60, 1380, 60));
        assert!(!is_lamp_active(700, 1380, 60));
    }

    #[test]
    fn empty_window_is_never_active() {
        assert!(!is_lamp_active(0, 600, 600));
        assert!(!is_lamp_active(600, 600, 600));
    }

    #[test]
    fn minute_of_day_is_in_range() {
        let m = minute_of_day(UtcOffset::UTC);
        assert!((0..MINUTES_PER_DAY).contains(&m));
    }

    // -- Tick ---------------------------------------------------------------

    #[test]
    fn commands_on_inside_window() {
        let (store, bus, lamp) = setup(1380, 60);
        let mut rx = bus.subscribe();

        assert_eq!(lamp.tick_at(30), TickOutcome::Ran);
        assert_eq!(store.get::<bool>(LAMP_DESIRED_STATE), Some(true));
        assert_eq!(rx.try_recv().unwrap(), Command::LampSetState(true));

        store.set("lamp.telem.value", true);
        lamp.tick_at(31);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn commands_off_outside_window() {
        let (store, bus, lamp) = setup(1380, 60);
        store.set("lamp.telem.value", true);
        let mut rx = bus.subscribe();

        lamp.tick_at(700);
        assert_eq!(store.get::<bool>(LAMP_DESIRED_STATE), Some(false));
        assert_eq!(rx.try_recv().unwrap(), Command::LampSetState(false));
    }

    #[test]
    fn disabled_lamp_stays_off() {
        let (store, bus, lamp) = setup(0, 1439);
        store.set(LAMP_ENABLED, false);
        let mut rx = bus.subscribe();

        lamp.tick_at(600);
        assert_eq!(store.get::<bool>(LAMP_DESIRED_STATE), Some(false));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn maintenance_pauses() {
        let (store, bus, lamp) = setup(0, 1439);
        store.set(SYSTEM_MAINTENANCE, true);
        let mut rx = bus.subscribe();

        assert_eq!(lamp.tick_at(600), TickOutcome::Paused);
        assert!(!store.has(LAMP_DESIRED_STATE));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn lost_lamp_stops_and_recovers_flag() {
        let (store, _, lamp) = setup(480, 1320);
        let monitor = Monitor::new(Arc::clone(&store));

        store.set("lamp.telem.status", DeviceStatus::NotFound);
        assert!(!lamp.ready());
        assert_eq!(lamp.tick_at(600), TickOutcome::Stopped);
        assert!(monitor.is_set(MonitorFlag::LampControllerLost));

        store.set("lamp.telem.status", DeviceStatus::Error);
        assert!(!monitor.is_set(MonitorFlag::LampControllerLost));
    }

    #[test]
    fn ready_needs_every_key() {
        let (store, _, lamp) = setup(480, 1320);
        assert!(lamp.ready());
        store.remove(LAMP_ON_TIME);
        assert!(!lamp.ready());
    }
}
