//! Key-value persistence with change notification.
//!
//! The backend is opaque; the crate only needs JSON values, prefix scans and a
//! per-key change hook. [`MemoryStorage`] is the bundled backend. Accounts see the
//! store through [`ScopedStorage`] views prefixed with `<uid>:` (account) and
//! `<uid>@<session id>:` (session).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::StorageError;
use crate::hooks::{Hook, SubscriptionId};

/// A change to one key. `new` is `None` on removal, `old` is `None` on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

pub type StorageListener = Box<dyn Fn(&StorageChange) + Send + Sync>;

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Called with (new, old) whenever `key` changes value.
    fn register_hook(&self, key: &str, listener: StorageListener) -> SubscriptionId;

    fn remove_hook(&self, key: &str, id: SubscriptionId);
}

/// In-process backend. Listeners run after the store lock is released.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, Value>>,
    hooks: Mutex<HashMap<String, Arc<Hook<StorageChange>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &str, new: Option<Value>, old: Option<Value>) {
        if new == old {
            return;
        }
        let hook = self.hooks.lock().get(key).cloned();
        if let Some(hook) = hook {
            hook.emit(&StorageChange {
                key: key.to_string(),
                new,
                old,
            });
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let old = self.values.lock().insert(key.to_string(), value.clone());
        self.notify(key, Some(value), old);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old = self.values.lock().remove(key);
        self.notify(key, None, old);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.values
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn register_hook(&self, key: &str, listener: StorageListener) -> SubscriptionId {
        let hook = self
            .hooks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Hook::new()))
            .clone();
        hook.subscribe(listener)
    }

    fn remove_hook(&self, key: &str, id: SubscriptionId) {
        let mut hooks = self.hooks.lock();
        if let Some(hook) = hooks.get(key) {
            hook.unsubscribe(id);
            if hook.is_empty() {
                hooks.remove(key);
            }
        }
    }
}

/// A prefixed view onto a shared [`Storage`].
#[derive(Clone)]
pub struct ScopedStorage {
    inner: Arc<dyn Storage>,
    prefix: String,
}

impl ScopedStorage {
    pub fn new(inner: Arc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// `<uid>:`
    pub fn account(inner: Arc<dyn Storage>, uid: &str) -> Self {
        Self::new(inner, format!("{}:", uid))
    }

    /// `<uid>@<session id>:`
    pub fn session(inner: Arc<dyn Storage>, uid: &str, session_id: &str) -> Self {
        Self::new(inner, format!("{}@{}:", uid, session_id))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(&self.key(key))
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.inner.set(&self.key(key), value)
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(&self.key(key))
    }

    /// Typed read. A value that no longer matches `T` is logged and treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %self.key(key), error = %e, "Ignoring stored value with unexpected shape");
                None
            }
        }
    }

    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|e| StorageError::Serialization {
            key: self.key(key),
            reason: e.to_string(),
        })?;
        self.set(key, value)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Keys under this scope, with the scope prefix stripped.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .keys_with_prefix(&self.prefix)
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect()
    }

    /// Remove every key under this scope.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in self.inner.keys_with_prefix(&self.prefix) {
            self.inner.remove(&key)?;
        }
        Ok(())
    }

    pub fn register_hook<F>(&self, key: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&StorageChange) + Send + Sync + 'static,
    {
        self.inner.register_hook(&self.key(key), Box::new(listener))
    }

    pub fn remove_hook(&self, key: &str, id: SubscriptionId) {
        self.inner.remove_hook(&self.key(key), id);
    }
}
