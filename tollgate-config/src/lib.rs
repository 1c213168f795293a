//! Layered configuration sources for tollgate.
//!
//! Values are merged from configuration files (TOML, JSON, env-style), a
//! `.env` file and prefixed environment variables, later sources overriding
//! earlier ones. Environment values arrive as strings; typed getters coerce
//! them (`"10"` reads as `10u32`, `"true"` as `true`).

pub mod env;
pub mod error;
pub mod loader;
pub mod service;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use service::{ConfigService, ConfigServiceBuilder};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Key/value store of merged configuration values
#[derive(Clone, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<HashMap<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: Some(prefix.into()),
        }
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let env_vars = loader.load()?;

        let mut config = self.config.write();
        for (key, value) in env_vars {
            config.insert(key, Value::String(value));
        }

        Ok(())
    }

    /// Load a `.env` file, then the process environment on top of it.
    ///
    /// The file is parsed on every call rather than exported into the
    /// process environment, so a reload sees edits to it. A missing default
    /// `.env` is not an error; an explicit path must exist.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        let entries = match path {
            Some(path) => dotenvy::from_path_iter(path)
                .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?,
            None => match dotenvy::from_filename_iter(".env") {
                Ok(entries) => entries,
                Err(e) if e.not_found() => return self.load_env(),
                Err(e) => return Err(ConfigError::LoadError(e.to_string())),
            },
        };

        let loader = EnvLoader::new(self.env_prefix.clone());
        {
            let mut config = self.config.write();
            for entry in entries {
                let (key, value) = entry.map_err(|e| ConfigError::LoadError(e.to_string()))?;
                if let Some(key) = loader.normalise(&key) {
                    config.insert(key, Value::String(value));
                }
            }
        }

        self.load_env()
    }

    /// Load configuration from file
    pub fn load_file(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).load_file(path)?;
        self.merge_value(data)
    }

    /// Merge a JSON object's top-level entries
    pub fn merge_value(&self, data: Value) -> Result<()> {
        match data {
            Value::Object(map) => {
                let mut config = self.config.write();
                for (key, value) in map {
                    config.insert(key, value);
                }
                Ok(())
            }
            other => Err(ConfigError::ParseError(format!(
                "expected a table of settings, found {}",
                other
            ))),
        }
    }

    /// Set a configuration value
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value =
            serde_json::to_value(value).map_err(|e| ConfigError::invalid(key, e.to_string()))?;
        self.config.write().insert(key.to_string(), json_value);
        Ok(())
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_opt(key)?
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))
    }

    /// Get a value that may be absent.
    ///
    /// Absent keys yield `Ok(None)`; present but malformed values are errors.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = match self.config.read().get(key) {
            Some(value) => value.clone(),
            None => return Ok(None),
        };
        decode(key, value).map(Some)
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.config.read().contains_key(key)
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        self.config.read().keys().cloned().collect()
    }

    /// Replace every value with those of `other`
    pub fn replace_with(&self, other: &ConfigManager) {
        let snapshot = other.config.read().clone();
        *self.config.write() = snapshot;
    }

    pub fn env_prefix(&self) -> Option<&str> {
        self.env_prefix.as_deref()
    }

    /// Deserialize the whole tree into `T` and validate it
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let tree = Value::Object(
            self.config
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let validated: T =
            serde_json::from_value(tree).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        validated.validate()?;

        Ok(validated)
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(err) => {
            // Environment values are strings: retry them as JSON literals.
            if let Value::String(raw) = &value
                && let Ok(decoded) = serde_json::from_str::<T>(raw.trim())
            {
                return Ok(decoded);
            }
            Err(ConfigError::invalid(key, err.to_string()))
        }
    }
}
