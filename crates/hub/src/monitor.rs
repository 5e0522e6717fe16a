//! System condition flags raised and cleared by the controllers.
//!
//! Each flag is an independent boolean store entry, so raising one flag
//! never races with clearing another.

use tracing::{info, warn};

use crate::names::MONITOR_FLAG_PREFIX;
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorFlag {
    PumpNotOperate,
    NotFloodedInTime,
    FloatLevelTimeout,
    PumpControllerLost,
    NoUpperForSwing,
    LampControllerLost,
}

impl MonitorFlag {
    pub const ALL: [MonitorFlag; 6] = [
        Self::PumpNotOperate,
        Self::NotFloodedInTime,
        Self::FloatLevelTimeout,
        Self::PumpControllerLost,
        Self::NoUpperForSwing,
        Self::LampControllerLost,
    ];

    pub fn bit(self) -> u32 {
        match self {
            Self::PumpNotOperate => 1 << 0,
            Self::NotFloodedInTime => 1 << 1,
            Self::FloatLevelTimeout => 1 << 2,
            Self::PumpControllerLost => 1 << 3,
            Self::NoUpperForSwing => 1 << 4,
            Self::LampControllerLost => 1 << 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PumpNotOperate => "PumpNotOperate",
            Self::NotFloodedInTime => "NotFloodedInTime",
            Self::FloatLevelTimeout => "FloatLevelTimeout",
            Self::PumpControllerLost => "PumpControllerLost",
            Self::NoUpperForSwing => "NoUpperForSwing",
            Self::LampControllerLost => "LampControllerLost",
        }
    }

    pub fn key(self) -> String {
        format!("{MONITOR_FLAG_PREFIX}{}", self.name())
    }
}

/// Handle over the flag entries of a store.
#[derive(Clone)]
pub struct Monitor {
    store: SharedStore,
}

impl Monitor {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create every flag entry, cleared. Run once at boot.
    pub fn init(&self) {
        for flag in MonitorFlag::ALL {
            self.store.set(&flag.key(), false);
        }
    }

    pub fn set(&self, flag: MonitorFlag) -> bool {
        let changed = self.store.set(&flag.key(), true);
        if changed {
            warn!(flag = flag.name(), "monitor: flag raised");
        }
        changed
    }

    pub fn clear(&self, flag: MonitorFlag) -> bool {
        let changed = self.store.set(&flag.key(), false);
        if changed {
            info!(flag = flag.name(), "monitor: flag cleared");
        }
        changed
    }

    pub fn is_set(&self, flag: MonitorFlag) -> bool {
        self.store.get_or(&flag.key(), false)
    }

    pub fn active(&self) -> Vec<MonitorFlag> {
        MonitorFlag::ALL
            .into_iter()
            .filter(|f| self.is_set(*f))
            .collect()
    }

    pub fn bits(&self) -> u32 {
        self.active().iter().fold(0, |acc, f| acc | f.bit())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    fn monitor() -> Monitor {
        let m = Monitor::new(Arc::new(Store::new()));
        m.init();
        m
    }

    #[test]
    fn bits_are_distinct() {
        let union = MonitorFlag::ALL.iter().fold(0, |acc, f| acc | f.bit());
        assert_eq!(union, 0b11_1111);
    }

    #[test]
    fn init_creates_cleared_entries() {
        let m = monitor();
        for flag in MonitorFlag::ALL {
            assert!(m.store.has(&flag.key()));
            assert!(!m.is_set(flag));
        }
        assert_eq!(m.bits(), 0);
    }

    #[test]
    fn set_and_clear_are_independent() {
        let m = monitor();
        assert!(m.set(MonitorFlag::NotFloodedInTime));
        assert!(m.set(MonitorFlag::LampControllerLost));
        assert!(!m.set(MonitorFlag::LampControllerLost));

        assert!(m.clear(MonitorFlag::NotFloodedInTime));
        assert_eq!(m.active(), vec![MonitorFlag::LampControllerLost]);
        assert_eq!(m.bits(), 1 << 5);
    }

    #[test]
    fn flags_live_under_the_system_prefix() {
        assert_eq!(
            MonitorFlag::NoUpperForSwing.key(),
            "system.int.flags.NoUpperForSwing"
        );
    }
}
