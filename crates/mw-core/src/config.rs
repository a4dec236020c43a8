//! Configuration access.
//!
//! The core consumes configuration exclusively through the key-value
//! [`Config`] interface. Embedding applications usually construct it from
//! a TOML file (`[meshwire]` table of scalar keys); tests build it from an
//! in-memory map. Channel definitions follow the numbered convention
//! `producer-1`, `consumer-1`, `server-1`, `import-1`; the value is an
//! opaque endpoint string handed back to the application's connector
//! factory.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Key-value configuration provider.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Build from explicit pairs (the test path).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Config {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Load from a TOML file containing a flat `[meshwire]` table.
    pub fn from_toml_file(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Fatal(format!("reading config file '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        #[derive(Deserialize)]
        struct RawConfig {
            meshwire: Option<BTreeMap<String, toml::Value>>,
        }
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| CoreError::Fatal(format!("config parse error: {e}")))?;
        let table = raw.meshwire.unwrap_or_default();
        let mut values = BTreeMap::new();
        for (key, value) in table {
            let s = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            values.insert(key, s);
        }
        Ok(Config { values })
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Required key; missing is a startup abort.
    pub fn require(&self, key: &str) -> Result<&str, CoreError> {
        self.get(key)
            .ok_or_else(|| CoreError::Fatal(format!("missing required config key '{key}'")))
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "yes" | "on"))
    }

    pub fn get_duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .map_or(default, Duration::from_secs)
    }

    /// Enumerate numbered channel definitions for a prefix, in order,
    /// stopping at the first gap: `producer-1`, `producer-2`, …
    pub fn channel_defs(&self, prefix: &str) -> Vec<(String, String)> {
        let mut defs = Vec::new();
        for n in 1.. {
            let key = format!("{prefix}-{n}");
            match self.get(&key) {
                Some(value) => defs.push((key, value.to_owned())),
                None => break,
            }
        }
        defs
    }
}
