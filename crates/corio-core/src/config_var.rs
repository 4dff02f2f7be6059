//! Named configuration variables with change listeners
//!
//! A `ConfigVar<T>` holds one typed value plus a set of listeners that are
//! told `(old, new)` whenever the value actually changes. Variables live
//! in a process-wide registry keyed by lowercase dotted names
//! (`[a-z0-9._]`), so independent modules can share one knob:
//!
//! ```ignore
//! use corio_core::config_var;
//!
//! let timeout = config_var::lookup("tcp.connect.timeout", 5000u64, "tcp connect timeout")?;
//! timeout.add_listener(|old, new| kinfo!("connect timeout {} -> {}", old, new));
//! timeout.set_value(1000);
//! ```
//!
//! `load_from_env()` applies `CORIO_<NAME>` overrides (dots become
//! underscores) to every registered variable.

use crate::env::env_key_for;
use crate::error::ConfigError;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Handle returned by `add_listener`
pub type ListenerId = u64;

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Bounds every configuration value type must meet
pub trait ConfigValue: Clone + PartialEq + Display + FromStr + Send + Sync + 'static {}

impl<T> ConfigValue for T where T: Clone + PartialEq + Display + FromStr + Send + Sync + 'static {}

/// Type-erased view used by the registry
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn value_string(&self) -> String;
    fn set_from_str(&self, s: &str) -> Result<(), ConfigError>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<BTreeMap<ListenerId, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    /// Create an unregistered variable. Most callers want [`lookup`].
    pub fn new(name: &str, default: T, description: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Store `v`. Listeners run (outside any lock) only if the value changed.
    /// Returns whether it changed.
    pub fn set_value(&self, v: T) -> bool {
        let old = {
            let mut cur = self.value.write();
            if *cur == v {
                return false;
            }
            std::mem::replace(&mut *cur, v.clone())
        };
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old, &v);
        }
        true
    }

    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(f));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().contains_key(&id)
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T: ConfigValue> ConfigVarBase for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn value_string(&self) -> String {
        self.value.read().to_string()
    }

    fn set_from_str(&self, s: &str) -> Result<(), ConfigError> {
        let v = s.trim().parse::<T>().map_err(|_| ConfigError::Parse {
            name: self.name.clone(),
            value: s.to_string(),
        })?;
        self.set_value(v);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type Registry = RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

/// Find or create the variable `name`.
///
/// An existing variable of the same type is returned as is (the default
/// is ignored). An existing variable of another type is an error.
pub fn lookup<T: ConfigValue>(
    name: &str,
    default: T,
    description: &str,
) -> Result<Arc<ConfigVar<T>>, ConfigError> {
    let name = name.to_lowercase();
    validate_name(&name)?;

    let mut reg = registry().write();
    if let Some(existing) = reg.get(&name) {
        return existing
            .clone()
            .as_any()
            .downcast::<ConfigVar<T>>()
            .map_err(|_| {
                crate::kerror!("config {} exists with a different type", name);
                ConfigError::TypeMismatch { name: name.clone() }
            });
    }

    let var = Arc::new(ConfigVar::new(&name, default, description));
    reg.insert(name, var.clone());
    Ok(var)
}

/// Typed lookup without creation
pub fn find<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
    let base = find_base(name)?;
    base.as_any().downcast::<ConfigVar<T>>().ok()
}

pub fn find_base(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
    registry().read().get(&name.to_lowercase()).cloned()
}

/// Apply `CORIO_<NAME>` environment overrides to every registered variable.
///
/// Returns how many variables were set. Unparsable values are logged and skipped.
pub fn load_from_env() -> usize {
    let vars: Vec<Arc<dyn ConfigVarBase>> = registry().read().values().cloned().collect();
    let mut applied = 0;
    for var in vars {
        let key = env_key_for(var.name());
        if let Ok(raw) = std::env::var(&key) {
            match var.set_from_str(&raw) {
                Ok(()) => applied += 1,
                Err(e) => crate::kwarn!("{}: {}", key, e),
            }
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_sees_old_and_new() {
        let var = ConfigVar::new("test.listener", 10u64, "");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = var.add_listener(move |old, new| s.lock().push((*old, *new)));

        assert!(var.set_value(20));
        assert!(!var.set_value(20)); // unchanged, no notification
        assert!(var.remove_listener(id));
        assert!(var.set_value(30));

        assert_eq!(*seen.lock(), vec![(10, 20)]);
        assert_eq!(var.value(), 30);
    }

    #[test]
    fn test_clear_listeners() {
        let var = ConfigVar::new("test.clear", 1i32, "");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = var.add_listener(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(var.has_listener(id));
        var.clear_listeners();
        var.set_value(2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lookup_returns_same_var() {
        let a = lookup("test.lookup.same", 5u32, "first").unwrap();
        let b = lookup("TEST.lookup.same", 99u32, "second").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.value(), 5);
        assert_eq!(a.description(), "first");
    }

    #[test]
    fn test_lookup_type_mismatch_and_bad_name() {
        lookup("test.lookup.typed", 1u64, "").unwrap();
        assert!(matches!(
            lookup("test.lookup.typed", String::from("x"), ""),
            Err(ConfigError::TypeMismatch { .. })
        ));
        assert!(matches!(
            lookup("bad name!", 1u64, ""),
            Err(ConfigError::InvalidName(_))
        ));
        assert!(find::<String>("test.lookup.typed").is_none());
        assert!(find::<u64>("test.lookup.typed").is_some());
    }

    #[test]
    fn test_set_from_str_and_env() {
        let var = lookup("test.env.knob", 7u64, "").unwrap();
        assert!(var.set_from_str("abc").is_err());
        std::env::set_var("CORIO_TEST_ENV_KNOB", "11");
        assert!(load_from_env() >= 1);
        assert_eq!(var.value(), 11);
        assert_eq!(var.value_string(), "11");
        std::env::remove_var("CORIO_TEST_ENV_KNOB");
    }
}
