use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::{Map, Value};

/// Backing store consulted by [`ConfigAccessor`]. Absence is not an error.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Dotted lookup into a JSON object, e.g. `greeter.hostname`. A literal key
/// containing dots takes precedence over the nested walk.
impl ConfigSource for Map<String, Value> {
    fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = Map::get(self, key) {
            return Some(value.clone());
        }
        let mut parts = key.split('.');
        let mut current = Map::get(self, parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }
}

impl ConfigSource for HashMap<String, Value> {
    fn get(&self, key: &str) -> Option<Value> {
        HashMap::get(self, key).cloned()
    }
}

/// Typed accessor with caller-declared defaults. Never fails: a missing key
/// or a value of the wrong type yields the default.
#[derive(Clone)]
pub struct ConfigAccessor {
    source: Arc<dyn ConfigSource>,
}

impl ConfigAccessor {
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn empty() -> Self {
        Self::new(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.source.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(value)) => value,
            _ => default.to_string(),
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }
}

impl Default for ConfigAccessor {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ConfigAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigAccessor").finish_non_exhaustive()
    }
}
