// ConfigService - reloadable set of configuration sources

use crate::{ConfigManager, FileFormat, Result};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf, FileFormat),
    Dotenv(Option<PathBuf>),
    Env,
}

/// Configuration built from an ordered list of sources.
///
/// The source list is kept so that [`ConfigService::reload`] can re-read
/// everything without a restart.
#[derive(Clone)]
pub struct ConfigService {
    manager: ConfigManager,
    sources: Vec<Source>,
}

impl ConfigService {
    pub fn builder() -> ConfigServiceBuilder {
        ConfigServiceBuilder::new()
    }

    /// Wrap a pre-populated manager (no sources, reload keeps its values)
    pub fn from_manager(manager: ConfigManager) -> Self {
        Self {
            manager,
            sources: Vec::new(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.manager.get(key)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.manager.get_opt(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.manager.has(key)
    }

    pub fn manager(&self) -> &ConfigManager {
        &self.manager
    }

    /// Re-read every source.
    ///
    /// On failure the current values are left untouched.
    pub fn reload(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Ok(());
        }

        let fresh = match self.manager.env_prefix() {
            Some(prefix) => ConfigManager::with_prefix(prefix),
            None => ConfigManager::new(),
        };
        load_sources(&fresh, &self.sources)?;
        self.manager.replace_with(&fresh);

        debug!(sources = self.sources.len(), "Configuration reloaded");
        Ok(())
    }
}

fn load_sources(manager: &ConfigManager, sources: &[Source]) -> Result<()> {
    for source in sources {
        match source {
            Source::File(path, format) => manager.load_file(path, *format)?,
            Source::Dotenv(path) => manager.load_dotenv(path.as_deref())?,
            Source::Env => manager.load_env()?,
        }
    }
    Ok(())
}

/// Builder for ConfigService
///
/// Sources are applied in the order they are added; later ones win.
pub struct ConfigServiceBuilder {
    prefix: Option<String>,
    sources: Vec<Source>,
}

impl ConfigServiceBuilder {
    pub fn new() -> Self {
        Self {
            prefix: None,
            sources: Vec::new(),
        }
    }

    /// Set environment variable prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Add a configuration file, format detected from its extension
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = FileFormat::detect(&path)?;
        self.sources.push(Source::File(path, format));
        Ok(self)
    }

    /// Add a `.env` file (`None` = `.env` in the working directory, optional)
    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.sources.push(Source::Dotenv(path));
        self
    }

    /// Add the process environment
    pub fn load_env(mut self) -> Self {
        self.sources.push(Source::Env);
        self
    }

    pub fn build(self) -> Result<ConfigService> {
        let manager = match self.prefix {
            Some(prefix) => ConfigManager::with_prefix(prefix),
            None => ConfigManager::new(),
        };
        load_sources(&manager, &self.sources)?;

        Ok(ConfigService {
            manager,
            sources: self.sources,
        })
    }
}

impl Default for ConfigServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
