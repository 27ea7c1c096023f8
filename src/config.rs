//! Named configuration values with typed accessors and change listeners.
//!
//! Configuration is a flat registry of dotted string keys. Values are kept
//! as strings; accessors parse on demand and fall back to a supplied
//! default on parse failure. A JSON document can be layered in (nested
//! objects flatten into dotted keys), followed by environment overrides
//! (`WEFT_TCP_CONNECT_TIMEOUT` maps to `tcp.connect.timeout`).
//!
//! Change listeners are registered per key and fire with the old and new
//! value whenever [`Config::set`] replaces an existing value. The registry
//! is an explicit context object passed down from `main`; nothing in the
//! crate mutates process-global state.
//!
//! Keys consumed by the runtime itself:
//!
//! | key                           | default | meaning                        |
//! |-------------------------------|---------|--------------------------------|
//! | `tcp.connect.timeout`         | `5000`  | outbound connect deadline (ms) |
//! | `session.reconnect.interval`  | `2000`  | session redial period (ms)     |
//! | `http.request.buffer_size`    | `4096`  | request head buffer (bytes)    |
//! | `http.request.max_body_size`  | `64MB`  | request body cap (bytes)       |
//! | `http.response.buffer_size`   | `4096`  | response head buffer (bytes)   |
//! | `http.response.max_body_size` | `64MB`  | response body cap (bytes)      |

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};

/// Callback invoked with `(old_value, new_value)` when a key changes.
pub type ChangeListener = Arc<dyn Fn(&str, &str) + Send + Sync + 'static>;

struct Entry {
    value: String,
    listeners: Vec<(u64, ChangeListener)>,
}

/// A registry of named configuration values.
pub struct Config {
    entries: RwLock<HashMap<String, Entry>>,
    next_listener: RwLock<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("Config")
            .field("entries", &entries.len())
            .finish()
    }
}

impl Config {
    /// Creates a registry seeded with the runtime's default keys.
    #[must_use]
    pub fn new() -> Self {
        let config = Self {
            entries: RwLock::new(HashMap::new()),
            next_listener: RwLock::new(1),
        };
        config.seed("tcp.connect.timeout", "5000");
        config.seed("session.reconnect.interval", "2000");
        config.seed("http.request.buffer_size", "4096");
        config.seed("http.request.max_body_size", "67108864");
        config.seed("http.response.buffer_size", "4096");
        config.seed("http.response.max_body_size", "67108864");
        config
    }

    fn seed(&self, key: &str, value: &str) {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                listeners: Vec::new(),
            },
        );
    }

    /// Returns the raw string value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    /// Returns the value parsed as `T`, or `default` when the key is
    /// missing or unparseable.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Returns the value as a millisecond duration, or `default`.
    #[must_use]
    pub fn get_ms_or(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    /// Sets `key` to `value`, firing that key's change listeners when the
    /// value actually changes.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let fired: Vec<(ChangeListener, String)> = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                Some(entry) if entry.value != value => {
                    let old = std::mem::replace(&mut entry.value, value.clone());
                    entry
                        .listeners
                        .iter()
                        .map(|(_, cb)| (Arc::clone(cb), old.clone()))
                        .collect()
                }
                Some(_) => Vec::new(),
                None => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value,
                            listeners: Vec::new(),
                        },
                    );
                    Vec::new()
                }
            }
        };
        for (cb, old) in fired {
            cb(&old, self.get(key).as_deref().unwrap_or(""));
        }
    }

    /// Registers a change listener for `key`; returns a token usable with
    /// [`Config::remove_listener`]. Missing keys are created empty so the
    /// listener fires on first assignment.
    pub fn add_listener(&self, key: &str, listener: ChangeListener) -> u64 {
        let id = {
            let mut next = self.next_listener.write();
            let id = *next;
            *next += 1;
            id
        };
        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: String::new(),
                listeners: Vec::new(),
            })
            .listeners
            .push((id, listener));
        id
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, key: &str, id: u64) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.listeners.retain(|(lid, _)| *lid != id);
        }
    }

    /// Layers a JSON document into the registry. Nested objects flatten
    /// into dotted keys; scalars become their string form.
    pub fn load_json(&self, doc: &str) -> Result<()> {
        let value: Value = serde_json::from_str(doc)
            .map_err(|e| Error::with_message(ErrorKind::Config, "invalid json").with_source(e))?;
        let mut flat = Vec::new();
        flatten(&value, String::new(), &mut flat);
        for (key, val) in flat {
            self.set(&key, val);
        }
        Ok(())
    }

    /// Layers environment overrides with the given prefix:
    /// `<PREFIX>TCP_CONNECT_TIMEOUT` becomes `tcp.connect.timeout`.
    pub fn load_env(&self, prefix: &str) {
        for (name, value) in std::env::vars() {
            if let Some(rest) = name.strip_prefix(prefix) {
                let key = rest.to_ascii_lowercase().replace('_', ".");
                self.set(&key, value);
            }
        }
    }

    /// Number of keys in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn flatten(value: &Value, prefix: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(v, key, out);
            }
        }
        Value::String(s) => out.push((prefix, s.clone())),
        Value::Null => {}
        other => out.push((prefix, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_are_seeded() {
        let config = Config::new();
        assert_eq!(config.get_or("tcp.connect.timeout", 0u64), 5000);
        assert_eq!(
            config.get_ms_or("session.reconnect.interval", Duration::ZERO),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn typed_accessor_falls_back_on_garbage() {
        let config = Config::new();
        config.set("weird", "not-a-number");
        assert_eq!(config.get_or("weird", 7u32), 7);
        assert_eq!(config.get_or("missing", 9u32), 9);
    }

    #[test]
    fn listener_fires_on_change_only() {
        let config = Config::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new((String::new(), String::new())));

        let f = Arc::clone(&fired);
        let s = Arc::clone(&seen);
        config.add_listener(
            "tcp.connect.timeout",
            Arc::new(move |old, new| {
                f.fetch_add(1, Ordering::SeqCst);
                *s.lock() = (old.to_string(), new.to_string());
            }),
        );

        config.set("tcp.connect.timeout", "5000"); // unchanged, no fire
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        config.set("tcp.connect.timeout", "750");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let (old, new) = seen.lock().clone();
        assert_eq!(old, "5000");
        assert_eq!(new, "750");
    }

    #[test]
    fn removed_listener_stays_quiet() {
        let config = Config::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = config.add_listener(
            "k",
            Arc::new(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        config.set("k", "1");
        config.remove_listener("k", id);
        config.set("k", "2");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn json_flattens_nested_objects() {
        let config = Config::new();
        config
            .load_json(r#"{"http": {"request": {"buffer_size": 8192}}, "name": "edge"}"#)
            .expect("valid json");
        assert_eq!(config.get_or("http.request.buffer_size", 0usize), 8192);
        assert_eq!(config.get("name").as_deref(), Some("edge"));
    }

    #[test]
    fn json_rejects_garbage() {
        let config = Config::new();
        let err = config.load_json("{nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
