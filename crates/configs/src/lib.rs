//! # configs
//!
//! Layered runtime settings, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `config/default.toml`, if present
//! 3. the file named by `COMMUNITY_CONFIG`, if set
//! 4. `COMMUNITY__SECTION__KEY` environment variables
//!
//! A `.env` file in the working directory is loaded into the environment
//! before the layers are read.

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub notifications: NotificationSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize)]
pub struct StoreSettings {
    /// Project or database identifier of the managed document store.
    pub project_id: String,
    /// Credential for the store client. Empty for the in-memory adapter.
    pub api_key: SecretString,
    pub max_transaction_attempts: u32,
    pub max_batch_writes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    /// Writes per fan-out batch. Kept below `store.max_batch_writes`.
    pub batch_size: usize,
    pub member_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info,services=debug`.
    pub filter: String,
    pub json: bool,
}

impl Settings {
    /// Loads `.env`, then every layer.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(%err, ".env present but unreadable");
            }
        }
        let extra = std::env::var("COMMUNITY_CONFIG").ok();
        Self::from_sources(extra.as_deref(), Environment::with_prefix("COMMUNITY").separator("__").try_parsing(true))
    }

    /// Builds settings from the default layers plus an optional file and an
    /// environment source. Split from [`Settings::load`] so tests can inject
    /// a fake environment.
    pub fn from_sources(extra_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("store.project_id", "local")?
            .set_default("store.api_key", "")?
            .set_default("store.max_transaction_attempts", 5)?
            .set_default("store.max_batch_writes", 500)?
            .set_default("notifications.batch_size", 450)?
            .set_default("notifications.member_page_size", 200)?
            .set_default("log.filter", "info")?
            .set_default("log.json", false)?
            .add_source(File::with_name("config/default").required(false));
        if let Some(path) = extra_file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_transaction_attempts == 0 {
            return Err(ConfigError::Invalid("store.max_transaction_attempts must be at least 1".into()));
        }
        if self.store.max_batch_writes == 0 {
            return Err(ConfigError::Invalid("store.max_batch_writes must be at least 1".into()));
        }
        let batch = self.notifications.batch_size;
        if batch == 0 || batch > self.store.max_batch_writes {
            return Err(ConfigError::Invalid(format!(
                "notifications.batch_size must be within 1..={}, got {batch}",
                self.store.max_batch_writes
            )));
        }
        if self.notifications.member_page_size == 0 {
            return Err(ConfigError::Invalid("notifications.member_page_size must be at least 1".into()));
        }
        Ok(())
    }
}
