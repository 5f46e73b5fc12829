//! A key/value map with watch/notify semantics. One backend is required: an
//! in-memory map; the trait leaves room for others without this spec
//! needing to implement them.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde_json::Value;

pub type WatchFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value);
    fn watch(&self, key: &str, cb: WatchFn);
    /// Removes a watcher from `key`. With `cb`, removes only the watcher
    /// matching that callback by pointer identity; without it, removes every
    /// watcher registered on the key.
    fn unwatch(&self, key: &str, cb: Option<&WatchFn>);
    fn load_config(&self, config: &Value);
}

#[derive(Default)]
struct Inner {
    map: AHashMap<String, Value>,
    watchers: AHashMap<String, Vec<WatchFn>>,
}

/// The in-memory datastore backend. Map and watcher lists share a single
/// lock; watcher callbacks run with the lock released so a callback can
/// itself call back into the store without deadlocking.
pub struct MemoryDataStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl MemoryDataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Datastore for MemoryDataStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().map.get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.map.insert(key.to_string(), value.clone());
            inner.watchers.get(key).cloned().unwrap_or_default()
        };

        for cb in callbacks {
            // A callback failure (panic) must not abort the put; each
            // watcher is isolated from the others and from the caller.
            let key = key.to_string();
            let value = value.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                cb(&key, &value);
            }));
            if result.is_err() {
                log::warn!("datastore watcher for key {key:?} panicked");
            }
        }
    }

    fn watch(&self, key: &str, cb: WatchFn) {
        self.inner
            .lock()
            .watchers
            .entry(key.to_string())
            .or_default()
            .push(cb);
    }

    fn unwatch(&self, key: &str, cb: Option<&WatchFn>) {
        let mut inner = self.inner.lock();
        match cb {
            Some(cb) => {
                if let Some(list) = inner.watchers.get_mut(key) {
                    list.retain(|w| !Arc::ptr_eq(w, cb));
                    if list.is_empty() {
                        inner.watchers.remove(key);
                    }
                }
            }
            None => {
                inner.watchers.remove(key);
            }
        }
    }

    fn load_config(&self, config: &Value) {
        if let Some(obj) = config.as_object() {
            let mut inner = self.inner.lock();
            for (k, v) in obj {
                inner.map.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_missing_key_is_none() {
        let ds = MemoryDataStore::new();
        assert!(ds.get("missing").is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let ds = MemoryDataStore::new();
        ds.put("k", Value::String("v".into()));
        assert_eq!(ds.get("k"), Some(Value::String("v".into())));
    }

    #[test]
    fn watcher_is_invoked_on_put() {
        let ds = MemoryDataStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        ds.watch("k", Arc::new(move |_k, _v| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        ds.put("k", Value::Bool(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_watcher_does_not_abort_put() {
        let ds = MemoryDataStore::new();
        ds.watch("k", Arc::new(|_k, _v| panic!("boom")));
        ds.put("k", Value::Bool(true));
        assert_eq!(ds.get("k"), Some(Value::Bool(true)));
    }

    #[test]
    fn unwatch_with_callback_removes_only_that_watcher() {
        let ds = MemoryDataStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let removed: WatchFn = Arc::new(move |_k, _v| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let kept_calls = Arc::new(AtomicUsize::new(0));
        let kept_calls2 = kept_calls.clone();
        let kept: WatchFn = Arc::new(move |_k, _v| {
            kept_calls2.fetch_add(1, Ordering::SeqCst);
        });

        ds.watch("k", removed.clone());
        ds.watch("k", kept.clone());
        ds.unwatch("k", Some(&removed));

        ds.put("k", Value::Bool(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(kept_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unwatch_without_callback_removes_all_watchers() {
        let ds = MemoryDataStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        ds.watch("k", Arc::new(move |_k, _v| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        ds.unwatch("k", None);
        ds.put("k", Value::Bool(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn load_config_seeds_store() {
        let ds = MemoryDataStore::new();
        ds.load_config(&serde_json::json!({"a": 1, "b": "two"}));
        assert_eq!(ds.get("a"), Some(Value::from(1)));
        assert_eq!(ds.get("b"), Some(Value::String("two".into())));
    }
}
