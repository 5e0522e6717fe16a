//! Process-wide typed key/value store with change notification.
//!
//! Every key holds a single [`Value`]. The variant written first fixes the
//! kind of the key for the lifetime of the process: a later write of another
//! kind is refused and logged, the stored value is left untouched.
//!
//! Observers are owned closures registered per exact key or per key prefix.
//! A successful write snapshots the matching observers and the new value
//! under the store lock, releases the lock, and only then calls them on the
//! writer's thread. An observer is therefore free to read or write the store
//! (including the key that triggered it) without deadlocking.
//!
//! Prefix matching is a strict "starts with" on the key; the empty prefix
//! matches every key.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, trace};

use crate::device::{DeviceStatus, MultiControllerTelem};
use crate::pump::{PlainType, PumpMode, SwingState};

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStore = Arc<Store>;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// The closed set of value kinds a key may hold.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u32),
    Float(f64),
    Text(String),
    Duration(Duration),
    Status(DeviceStatus),
    PumpMode(PumpMode),
    PlainType(PlainType),
    SwingState(SwingState),
    /// Raw telemetry burst. Has no equality, so every write notifies.
    Telemetry(Box<MultiControllerTelem>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Duration,
    Status,
    PumpMode,
    PlainType,
    SwingState,
    Telemetry,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Text => "string",
            Self::Duration => "duration",
            Self::Status => "device_status",
            Self::PumpMode => "pump_mode",
            Self::PlainType => "plain_type",
            Self::SwingState => "swing_state",
            Self::Telemetry => "telemetry",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::UInt(_) => ValueKind::UInt,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Duration(_) => ValueKind::Duration,
            Self::Status(_) => ValueKind::Status,
            Self::PumpMode(_) => ValueKind::PumpMode,
            Self::PlainType(_) => ValueKind::PlainType,
            Self::SwingState(_) => ValueKind::SwingState,
            Self::Telemetry(_) => ValueKind::Telemetry,
        }
    }

    /// Equality used for change detection. `None` when the kind has no
    /// notion of equality; such writes always count as a change.
    fn same_as(&self, other: &Value) -> Option<bool> {
        let same = match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (Self::Status(a), Self::Status(b)) => a == b,
            (Self::PumpMode(a), Self::PumpMode(b)) => a == b,
            (Self::PlainType(a), Self::PlainType(b)) => a == b,
            (Self::SwingState(a), Self::SwingState(b)) => a == b,
            (Self::Telemetry(_), Self::Telemetry(_)) => return None,
            _ => false,
        };
        Some(same)
    }

    /// JSON rendering used by the HTTP surface and the history log.
    /// Durations are whole seconds.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::from(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::UInt(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Text(v) => serde_json::Value::from(v.as_str()),
            Self::Duration(v) => serde_json::Value::from(v.as_secs()),
            Self::Status(v) => serde_json::to_value(v).unwrap_or_default(),
            Self::PumpMode(v) => serde_json::to_value(v).unwrap_or_default(),
            Self::PlainType(v) => serde_json::to_value(v).unwrap_or_default(),
            Self::SwingState(v) => serde_json::to_value(v).unwrap_or_default(),
            Self::Telemetry(v) => serde_json::to_value(v.as_ref()).unwrap_or_default(),
        }
    }

    /// Convert JSON into a value of the requested kind. Returns `None` when
    /// the JSON does not fit that kind; there is no coercion between kinds.
    pub fn from_json(kind: ValueKind, json: &serde_json::Value) -> Option<Value> {
        let value = match kind {
            ValueKind::Bool => Self::Bool(json.as_bool()?),
            ValueKind::Int => Self::Int(json.as_i64()?),
            ValueKind::UInt => Self::UInt(u32::try_from(json.as_u64()?).ok()?),
            ValueKind::Float => Self::Float(json.as_f64()?),
            ValueKind::Text => Self::Text(json.as_str()?.to_owned()),
            ValueKind::Duration => Self::Duration(Duration::from_secs(json.as_u64()?)),
            ValueKind::Status => Self::Status(serde_json::from_value(json.clone()).ok()?),
            ValueKind::PumpMode => Self::PumpMode(serde_json::from_value(json.clone()).ok()?),
            ValueKind::PlainType => Self::PlainType(serde_json::from_value(json.clone()).ok()?),
            ValueKind::SwingState => Self::SwingState(serde_json::from_value(json.clone()).ok()?),
            ValueKind::Telemetry => {
                Self::Telemetry(Box::new(serde_json::from_value(json.clone()).ok()?))
            }
        };
        Some(value)
    }
}

/// Rust types that can live in the store, one per [`Value`] variant.
pub trait StoreType: Sized {
    const KIND: ValueKind;

    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! store_type {
    ($ty:ty, $variant:ident) => {
        impl StoreType for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

store_type!(bool, Bool);
store_type!(i64, Int);
store_type!(u32, UInt);
store_type!(f64, Float);
store_type!(String, Text);
store_type!(Duration, Duration);
store_type!(DeviceStatus, Status);
store_type!(PumpMode, PumpMode);
store_type!(PlainType, PlainType);
store_type!(SwingState, SwingState);

impl StoreType for MultiControllerTelem {
    const KIND: ValueKind = ValueKind::Telemetry;

    fn into_value(self) -> Value {
        Value::Telemetry(Box::new(self))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Telemetry(v) => Some(v.as_ref().clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type KeyCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type PrefixCallback = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Observers collected under the lock, invoked after it is released.
struct Dispatch {
    key: Vec<KeyCallback>,
    prefix: Vec<(String, PrefixCallback)>,
}

impl Dispatch {
    fn is_empty(&self) -> bool {
        self.key.is_empty() && self.prefix.is_empty()
    }

    fn run(self, key: &str, value: &Value) {
        for cb in self.key {
            cb(key, value);
        }
        for (prefix, cb) in self.prefix {
            cb(&prefix, key, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    data: HashMap<String, Value>,
    key_observers: HashMap<String, Vec<(SubscriptionId, KeyCallback)>>,
    prefix_observers: Vec<(String, SubscriptionId, PrefixCallback)>,
}

impl Inner {
    fn dispatch_for(&self, key: &str) -> Dispatch {
        let key_cbs: Vec<KeyCallback> = self
            .key_observers
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        let prefix_cbs: Vec<(String, PrefixCallback)> = self
            .prefix_observers
            .iter()
            .filter(|(prefix, _, _)| key.starts_with(prefix.as_str()))
            .map(|(prefix, _, cb)| (prefix.clone(), Arc::clone(cb)))
            .collect();

        Dispatch {
            key: key_cbs,
            prefix: prefix_cbs,
        }
    }
}

#[derive(Default)]
pub struct Store {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // -- Writes -------------------------------------------------------------

    /// Write `value` under `key`. Returns `true` when the store changed and
    /// observers were notified.
    pub fn set<T: StoreType>(&self, key: &str, value: T) -> bool {
        self.set_value(key, value.into_value())
    }

    /// Untyped write. The kind of `value` must match the kind already
    /// recorded for `key`, if any.
    pub fn set_value(&self, key: &str, value: Value) -> bool {
        let dispatch = {
            let mut inner = self.lock();
            match inner.data.entry(key.to_owned()) {
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
                Entry::Occupied(mut slot) => {
                    let old = slot.get_mut();
                    if old.kind() != value.kind() {
                        error!(
                            key,
                            stored = old.kind().name(),
                            attempted = value.kind().name(),
                            "store: rejected write that would change the type of a key"
                        );
                        return false;
                    }
                    if old.same_as(&value) == Some(true) {
                        return false;
                    }
                    *old = value.clone();
                }
            }
            inner.dispatch_for(key)
        };

        if !dispatch.is_empty() {
            dispatch.run(key, &value);
        }
        true
    }

    /// Delete `key`, notifying its observers with the removed value.
    pub fn remove(&self, key: &str) -> bool {
        let (old, dispatch) = {
            let mut inner = self.lock();
            let Some(old) = inner.data.remove(key) else {
                return false;
            };
            let dispatch = inner.dispatch_for(key);
            (old, dispatch)
        };

        dispatch.run(key, &old);
        true
    }

    // -- Reads --------------------------------------------------------------

    /// Typed read. `None` when the key is absent or holds another kind.
    pub fn get<T: StoreType>(&self, key: &str) -> Option<T> {
        let inner = self.lock();
        let Some(value) = inner.data.get(key) else {
            trace!(key, "store: key not found");
            return None;
        };
        let typed = T::from_value(value);
        if typed.is_none() {
            trace!(
                key,
                stored = value.kind().name(),
                requested = T::KIND.name(),
                "store: read with mismatched type"
            );
        }
        typed
    }

    pub fn get_or<T: StoreType>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().data.contains_key(key)
    }

    pub fn kind(&self, key: &str) -> Option<ValueKind> {
        self.lock().data.get(key).map(Value::kind)
    }

    pub fn is_kind<T: StoreType>(&self, key: &str) -> bool {
        self.kind(key) == Some(T::KIND)
    }

    /// Diagnostic type name of the value stored under `key`.
    pub fn type_name(&self, key: &str) -> String {
        self.kind(key)
            .map_or_else(|| "not_found".to_string(), |k| k.name().to_string())
    }

    /// Sorted snapshot of every key starting with `prefix`.
    pub fn keys_by_prefix(&self, prefix: &str) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Sorted snapshot of every `(key, value)` pair under `prefix`.
    pub fn snapshot(&self, prefix: &str) -> Vec<(String, Value)> {
        let inner = self.lock();
        let mut entries: Vec<(String, Value)> = inner
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // -- Subscriptions ------------------------------------------------------

    /// Observe every successful write or removal of exactly `key`.
    pub fn subscribe<F>(&self, key: &str, observer: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = self.next_subscription();
        self.lock()
            .key_observers
            .entry(key.to_owned())
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.key_observers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.key_observers.remove(key);
        }
        removed
    }

    /// Observe every key starting with `prefix`. The callback receives the
    /// prefix it was registered with, the key, and the new value.
    pub fn subscribe_prefix<F>(&self, prefix: &str, observer: F) -> SubscriptionId
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        let id = self.next_subscription();
        self.lock()
            .prefix_observers
            .push((prefix.to_owned(), id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe_prefix(&self, prefix: &str, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.prefix_observers.len();
        inner
            .prefix_observers
            .retain(|(p, sub, _)| !(p == prefix && *sub == id));
        inner.prefix_observers.len() != before
    }

    /// Drop a subscription wherever it was registered.
    pub fn unsubscribe_all(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let mut removed = false;

        inner.key_observers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });

        let before = inner.prefix_observers.len();
        inner.prefix_observers.retain(|(_, sub, _)| *sub != id);
        removed |= inner.prefix_observers.len() != before;

        removed
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str, &Value) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_: &str, _: &Value| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    // -- Typed writes -------------------------------------------------------

    #[test]
    fn first_write_inserts_and_reports_change() {
        let store = Store::new();
        assert!(store.set("pump.config.enabled", true));
        assert_eq!(store.get::<bool>("pump.config.enabled"), Some(true));
    }

    #[test]
    fn write_of_other_type_is_rejected() {
        let store = Store::new();
        store.set("lamp.config.onTime", 480_i64);

        assert!(!store.set("lamp.config.onTime", 1.5_f64));
        assert!(!store.set("lamp.config.onTime", "08:00".to_string()));

        assert_eq!(store.get::<i64>("lamp.config.onTime"), Some(480));
        assert_eq!(store.kind("lamp.config.onTime"), Some(ValueKind::Int));
    }

    #[test]
    fn rejected_write_does_not_notify() {
        let store = Store::new();
        store.set("k", 1_u32);
        let (hits, cb) = counter();
        store.subscribe("k", cb);

        store.set("k", false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn same_value_twice_notifies_once() {
        let store = Store::new();
        let (hits, cb) = counter();
        store.subscribe("pump.telem.value", cb);

        assert!(store.set("pump.telem.value", true));
        assert!(!store.set("pump.telem.value", true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(store.set("pump.telem.value", false));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nan_always_counts_as_changed() {
        let store = Store::new();
        assert!(store.set("phMeter.telem.value", f64::NAN));
        assert!(store.set("phMeter.telem.value", f64::NAN));
    }

    #[test]
    fn telemetry_has_no_equality_and_always_notifies() {
        let store = Store::new();
        let (hits, cb) = counter();
        store.subscribe("multiController.rs.data", cb);

        let telem = MultiControllerTelem::default();
        assert!(store.set("multiController.rs.data", telem.clone()));
        assert!(store.set("multiController.rs.data", telem));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    // -- Reads --------------------------------------------------------------

    #[test]
    fn get_missing_key_is_none() {
        let store = Store::new();
        assert_eq!(store.get::<bool>("nope"), None);
        assert!(!store.has("nope"));
        assert_eq!(store.type_name("nope"), "not_found");
    }

    #[test]
    fn get_with_wrong_type_is_none() {
        let store = Store::new();
        store.set("waterLevel.telem.value", 42.0_f64);
        assert_eq!(store.get::<i64>("waterLevel.telem.value"), None);
        assert_eq!(store.get::<f64>("waterLevel.telem.value"), Some(42.0));
        assert!(store.is_kind::<f64>("waterLevel.telem.value"));
        assert_eq!(store.type_name("waterLevel.telem.value"), "float");
    }

    #[test]
    fn get_or_falls_back() {
        let store = Store::new();
        assert!(!store.get_or("system.config.maintenance", false));
        store.set("system.config.maintenance", true);
        assert!(store.get_or("system.config.maintenance", false));
    }

    #[test]
    fn keys_by_prefix_is_strict_and_sorted() {
        let store = Store::new();
        store.set("pump.telem.value", true);
        store.set("pump.config.onTime", Duration::from_secs(15));
        store.set("lamp.telem.value", false);
        store.set("upperpump.telem.value", false);

        assert_eq!(
            store.keys_by_prefix("pump."),
            vec!["pump.config.onTime".to_string(), "pump.telem.value".to_string()]
        );
        assert_eq!(store.keys_by_prefix("").len(), 4);
        assert!(store.keys_by_prefix(".telem").is_empty());
    }

    #[test]
    fn snapshot_returns_values() {
        let store = Store::new();
        store.set("lamp.config.onTime", 480_i64);
        store.set("lamp.config.offTime", 1320_i64);

        let snap = store.snapshot("lamp.config.");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, "lamp.config.offTime");
        assert!(matches!(snap[1].1, Value::Int(480)));
    }

    // -- Remove -------------------------------------------------------------

    #[test]
    fn remove_notifies_with_old_value() {
        let store = Store::new();
        store.set("k", 7_i64);

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        store.subscribe("k", move |_, v| {
            *s.lock().unwrap() = Some(v.clone());
        });

        assert!(store.remove("k"));
        assert!(!store.has("k"));
        assert!(matches!(*seen.lock().unwrap(), Some(Value::Int(7))));
        assert!(!store.remove("k"));
    }

    #[test]
    fn removed_key_may_take_a_new_type() {
        let store = Store::new();
        store.set("k", 7_i64);
        store.remove("k");
        assert!(store.set("k", true));
    }

    // -- Subscriptions ------------------------------------------------------

    #[test]
    fn prefix_observer_sees_matching_keys_only() {
        let store = Store::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        store.subscribe_prefix("pump", move |prefix, key, value| {
            s.lock()
                .unwrap()
                .push((prefix.to_string(), key.to_string(), value.to_json()));
        });

        store.set("pump.telem.value", true);
        store.set("lamp.telem.value", true);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "pump");
        assert_eq!(seen[0].1, "pump.telem.value");
        assert_eq!(seen[0].2, serde_json::json!(true));
    }

    #[test]
    fn prefix_does_not_match_in_the_middle() {
        let store = Store::new();
        let (hits, cb) = counter();
        store.subscribe_prefix(".telem", move |_, k, v| cb(k, v));

        store.set("pump.telem.value", true);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = Store::new();
        let (hits, cb) = counter();
        let id = store.subscribe("k", cb);

        store.set("k", 1_i64);
        assert!(store.unsubscribe("k", id));
        store.set("k", 2_i64);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!store.unsubscribe("k", id));
    }

    #[test]
    fn unsubscribe_prefix_stops_notifications() {
        let store = Store::new();
        let (hits, cb) = counter();
        let id = store.subscribe_prefix("lamp.", move |_, k, v| cb(k, v));

        store.set("lamp.telem.value", true);
        assert!(store.unsubscribe_prefix("lamp.", id));
        store.set("lamp.telem.value", false);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_all_finds_any_registration() {
        let store = Store::new();
        let (hits, cb) = counter();
        let key_id = store.subscribe("a", cb);
        let (prefix_hits, pcb) = counter();
        let prefix_id = store.subscribe_prefix("b", move |_, k, v| pcb(k, v));

        assert!(store.unsubscribe_all(key_id));
        assert!(store.unsubscribe_all(prefix_id));
        store.set("a", true);
        store.set("b", true);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(prefix_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_may_write_back_into_the_store() {
        let store = Arc::new(Store::new());
        let inner = Arc::clone(&store);
        store.subscribe("pump.telem.status", move |_, value| {
            if let Value::Status(status) = value {
                inner.set("pump.telem.statusStr", format!("{status:?}"));
                // Re-reading the triggering key must not deadlock.
                assert!(inner.has("pump.telem.status"));
            }
        });

        store.set("pump.telem.status", DeviceStatus::Warning);
        assert_eq!(
            store.get::<String>("pump.telem.statusStr").as_deref(),
            Some("Warning")
        );
    }

    #[test]
    fn observer_may_subscribe_during_notification() {
        let store = Arc::new(Store::new());
        let inner = Arc::clone(&store);
        store.subscribe("k", move |_, _| {
            inner.subscribe("other", |_, _| {});
        });
        store.set("k", true);
        store.set("k", false);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys() {
        let store = Arc::new(Store::new());
        let handles: Vec<_> = (0..8_i64)
            .map(|n| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100_i64 {
                        store.set(&format!("dev{n}.int.counter"), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for n in 0..8 {
            assert_eq!(store.get::<i64>(&format!("dev{n}.int.counter")), Some(99));
        }
    }

    // -- JSON conversion ----------------------------------------------------

    #[test]
    fn from_json_respects_kind() {
        assert!(matches!(
            Value::from_json(ValueKind::Duration, &serde_json::json!(30)),
            Some(Value::Duration(d)) if d == Duration::from_secs(30)
        ));
        assert!(matches!(
            Value::from_json(ValueKind::PumpMode, &serde_json::json!("ebb_swing")),
            Some(Value::PumpMode(PumpMode::EbbSwing))
        ));
        assert!(Value::from_json(ValueKind::Bool, &serde_json::json!(1)).is_none());
        assert!(Value::from_json(ValueKind::UInt, &serde_json::json!(-1)).is_none());
        assert!(Value::from_json(ValueKind::Int, &serde_json::json!("12")).is_none());
    }

    #[test]
    fn to_json_renders_durations_as_seconds() {
        assert_eq!(
            Value::Duration(Duration::from_secs(180)).to_json(),
            serde_json::json!(180)
        );
        assert_eq!(
            Value::Status(DeviceStatus::NotFound).to_json(),
            serde_json::json!("NotFound")
        );
    }
}
