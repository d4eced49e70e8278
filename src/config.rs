//! Layered configuration snapshot.
//!
//! A file source is read first, then `APP__SECTION__FIELD` environment
//! variables override individual fields. The result is frozen into
//! [`Settings`], which is shared read-only for the rest of the process.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat, ValueKind};
use serde::Deserialize;

use crate::error::Result;

pub const DATABASE_KEY: &str = "database";
pub const MESSAGING_KEY: &str = "messaging";
pub const AUTH_POLICY_KEY: &str = "auth.policy";
pub const APP_PORT_KEY: &str = "app.port";

const ENV_PREFIX: &str = "APP";

/// Immutable configuration snapshot.
pub struct Settings {
    raw: Config,
    typed: AppConfig,
}

impl Settings {
    /// Reads `path` (format taken from its extension) with environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_config(builder.build()?)
    }

    /// Parses YAML text without consulting the environment.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Self::from_config(raw)
    }

    pub fn from_config(raw: Config) -> Result<Self> {
        let typed = raw.clone().try_deserialize::<AppConfig>()?;
        Ok(Self { raw, typed })
    }

    /// True when `key` is present and not null, whatever its value.
    pub fn is_set(&self, key: &str) -> bool {
        match self.raw.get::<config::Value>(key) {
            Ok(value) => !matches!(value.kind, ValueKind::Nil),
            Err(_) => false,
        }
    }

    /// Capabilities declared by configuration.
    pub fn enabled(&self) -> EnabledCapabilities {
        EnabledCapabilities {
            database: self.is_set(DATABASE_KEY),
            messaging: self.is_set(MESSAGING_KEY),
            policy: self.is_set(AUTH_POLICY_KEY),
            http: self.is_set(APP_PORT_KEY) && self.typed.app.port != 0,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.typed
    }

    pub fn app(&self) -> &AppSection {
        &self.typed.app
    }

    pub fn app_name(&self) -> &str {
        &self.typed.app.name
    }

    pub fn app_port(&self) -> u16 {
        self.typed.app.port
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.typed.database
    }

    pub fn messaging(&self) -> &MessagingConfig {
        &self.typed.messaging
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.typed.auth
    }

    pub fn logger(&self) -> &LoggerConfig {
        &self.typed.logger
    }

    /// Reads any other key, for application-specific sections.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.raw.get::<T>(key).ok()
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("app", &self.typed.app)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnabledCapabilities {
    pub database: bool,
    pub messaging: bool,
    pub policy: bool,
    pub http: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub database: DatabaseConfig,
    pub messaging: MessagingConfig,
    pub auth: AuthConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub port: u16,
    /// Seconds allowed for reading a request body.
    pub read_timeout: u64,
    /// Seconds allowed for producing a response.
    pub write_timeout: u64,
    /// Largest request body accepted, in bytes.
    pub body_limit: usize,
    pub env: String,
}

impl AppSection {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn is_dev(&self) -> bool {
        self.env == "dev"
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "app".into(),
            port: 0,
            read_timeout: 10,
            write_timeout: 10,
            body_limit: 1024 * 1024,
            env: "dev".into(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    pub max_idle_conn: u32,
    pub max_open_conn: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: "postgres".into(),
            host: String::new(),
            port: 0,
            name: String::new(),
            user: String::new(),
            password: String::new(),
            sslmode: "prefer".into(),
            max_idle_conn: 2,
            max_open_conn: 10,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("type", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("sslmode", &self.sslmode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub pubsub_backend: String,
    pub pubsub_broker: String,
    /// Extra attempts after the first failed connect or publish.
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub streams: Vec<StreamConfig>,
}

impl MessagingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Seconds a message is retained; zero keeps messages forever.
    #[serde(default)]
    pub max_age: u64,
    #[serde(default)]
    pub storage_type: StorageKind,
    #[serde(default = "one")]
    pub replicas: usize,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Seconds.
    pub token_expiry: u64,
    pub policy: Option<PolicyConfig>,
}

/// Backing store of the policy engine.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    pub table: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            name: String::new(),
            user: String::new(),
            password: String::new(),
            sslmode: "prefer".into(),
            table: "casbin_rule".into(),
        }
    }
}

impl std::fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub log_level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}
