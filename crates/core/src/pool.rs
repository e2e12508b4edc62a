//! Generic named pool shared by the device pool and the MQTT client pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

struct Entry<T: ?Sized> {
    value: Arc<T>,
    cancel: CancellationToken,
}

/// A named collection of running things (devices, MQTT clients). Adding an
/// entry under a name that already exists cancels and replaces the old
/// one — the pool never silently runs two entries under the same key.
///
/// `T` is unsized-friendly so pools of trait objects (`Pool<dyn Device>`)
/// work alongside pools of concrete types (`Pool<MqttClient>`).
pub struct Pool<T: ?Sized> {
    entries: std::sync::RwLock<HashMap<String, Entry<T>>>,
}

impl<T: ?Sized> Default for Pool<T> {
    fn default() -> Self {
        Self {
            entries: std::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl<T: ?Sized> Pool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `name`, returning the [`CancellationToken`]
    /// the caller should thread into whatever background task owns it.
    /// If `name` was already present, its old token is cancelled first.
    pub fn add(&self, name: impl Into<String>, value: Arc<T>) -> CancellationToken {
        let name = name.into();
        let cancel = CancellationToken::new();
        let mut entries = self.entries.write().expect("pool lock poisoned");
        if let Some(old) = entries.insert(
            name,
            Entry {
                value,
                cancel: cancel.clone(),
            },
        ) {
            old.cancel.cancel();
        }
        cancel
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .expect("pool lock poisoned")
            .get(name)
            .map(|e| e.value.clone())
    }

    pub fn get_by_names(&self, names: &[String]) -> Vec<Arc<T>> {
        let entries = self.entries.read().expect("pool lock poisoned");
        names.iter().filter_map(|n| entries.get(n)).map(|e| e.value.clone()).collect()
    }

    pub fn iterate(&self) -> Vec<(String, Arc<T>)> {
        self.entries
            .read()
            .expect("pool lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every entry's token. Entries remain queryable until each
    /// background task finishes and is explicitly removed by the caller;
    /// this only signals shutdown, it does not forcibly drop entries.
    pub fn shutdown(&self) {
        let entries = self.entries.read().expect("pool lock poisoned");
        for entry in entries.values() {
            entry.cancel.cancel();
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .write()
            .expect("pool lock poisoned")
            .remove(name)
            .map(|e| e.value)
    }
}
