use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Prefix of environment variables read by both binaries, e.g. `METRICS_ADDRESS`
pub const ENV_PREFIX: &str = "METRICS";

/// Logging level
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Server address as host:port
    #[serde(default = "default_address")]
    pub address: String,
    /// Sampling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Publishing interval in seconds
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    /// Shared signing key
    #[serde(default)]
    pub key: Option<String>,
    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    /// The signing key, if set and non-empty
    pub fn key(&self) -> Option<&str> {
        non_empty(&self.key)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            poll_interval: default_poll_interval(),
            report_interval: default_report_interval(),
            key: None,
            log_level: LogLevel::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address as host:port
    #[serde(default = "default_address")]
    pub address: String,
    /// Snapshot interval in seconds; 0 saves after every write
    #[serde(default = "default_store_interval")]
    pub store_interval: u64,
    /// Snapshot file for the in-memory backend
    #[serde(default = "default_store_file")]
    pub store_file: Option<String>,
    /// Load the snapshot file on startup
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Shared signing key
    #[serde(default)]
    pub key: Option<String>,
    /// PostgreSQL connection string
    #[serde(default)]
    pub database_dsn: Option<String>,
    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

impl ServerConfig {
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }

    /// The snapshot file, if set and non-empty
    pub fn store_file(&self) -> Option<PathBuf> {
        non_empty(&self.store_file).map(PathBuf::from)
    }

    /// The signing key, if set and non-empty
    pub fn key(&self) -> Option<&str> {
        non_empty(&self.key)
    }

    /// The database connection string, if set and non-empty
    pub fn database_dsn(&self) -> Option<&str> {
        non_empty(&self.database_dsn)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            store_interval: default_store_interval(),
            store_file: default_store_file(),
            restore: default_restore(),
            key: None,
            database_dsn: None,
            log_level: LogLevel::default(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    10
}

fn default_store_interval() -> u64 {
    300
}

fn default_store_file() -> Option<String> {
    Some("/tmp/devops-metrics-db.json".to_string())
}

fn default_restore() -> bool {
    true
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML format)
    File(String),
    /// Environment variables with a prefix
    Environment(String),
    /// Explicit values, e.g. from command-line flags
    Overrides(config::Config),
    /// Default configuration
    Defaults,
}

/// Helper function to load configuration from various sources.
///
/// Later sources override earlier ones.
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    continue;
                }

                debug!("Loading TOML configuration from file: {}", path.display());
                builder = builder.add_source(
                    config::File::with_name(&path.to_string_lossy())
                        .format(config::FileFormat::Toml),
                );
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Overrides(values) => {
                debug!("Applying explicit configuration values");
                builder = builder.add_source(values);
            }
            ConfigSource::Defaults => {
                // Defaults are handled by the Deserialize implementation
                debug!("Using default configuration values");
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build configuration: {}", e)))?;

    let result = config
        .try_deserialize()
        .map_err(|e| AgentError::Config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

/// Configuration builder
pub struct ConfigBuilder<T: for<'de> Deserialize<'de>> {
    sources: Vec<ConfigSource>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: for<'de> Deserialize<'de> + Debug> ConfigBuilder<T> {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Add a TOML file source
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_string_lossy().to_string()));
        self
    }

    /// Add environment variables
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add explicit values from any serializable struct. `None` fields
    /// should be skipped during serialization so they do not mask other
    /// sources.
    pub fn add_overrides<S: Serialize>(mut self, values: &S) -> Result<Self> {
        let values = config::Config::try_from(values)
            .map_err(|e| AgentError::Config(format!("Invalid override values: {}", e)))?;
        self.sources.push(ConfigSource::Overrides(values));
        Ok(self)
    }

    /// Use default values
    pub fn use_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<T> {
        load_config::<T>(self.sources)
    }
}

impl<T: for<'de> Deserialize<'de> + Debug> Default for ConfigBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Load a binary's configuration: defaults, then the optional TOML `file`,
/// then `flags`, then `METRICS_*` environment variables.
///
/// `flags` should skip `None` fields when serialized so unset flags do not
/// mask the file.
pub fn load_layered<T, S>(file: Option<&Path>, flags: &S) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
    S: Serialize,
{
    layered_with_prefix(file, flags, ENV_PREFIX)
}

fn layered_with_prefix<T, S>(file: Option<&Path>, flags: &S, env_prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
    S: Serialize,
{
    let mut builder = ConfigBuilder::<T>::new().use_defaults();
    if let Some(path) = file {
        builder = builder.add_file(path);
    }
    builder.add_overrides(flags)?.add_env(env_prefix).build()
}
