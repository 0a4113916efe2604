//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TOML configuration loading and validation for the OPC-DA connector."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_connector_name() -> String {
    "OPC-DA Connector".to_owned()
}

fn default_connector_id() -> String {
    "opcda".to_owned()
}

fn default_connector_type() -> String {
    "opcda".to_owned()
}

fn default_server_name() -> String {
    "Matrikon.OPC.Simulation.1".to_owned()
}

fn default_server_host() -> String {
    "localhost".to_owned()
}

fn default_poll_period() -> Duration {
    Duration::from_millis(5000)
}

fn default_call_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_tick() -> Duration {
    Duration::from_millis(200)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_device_profile() -> String {
    "default".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the connector daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_EMS_OPCDA_CONFIG";

    /// Load configuration from disk, respecting the `R_EMS_OPCDA_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.connector.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connector identity, server block and the device mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_connector_name")]
    pub name: String,
    #[serde(default = "default_connector_id")]
    pub id: String,
    /// Prefix accepted on connector-scoped RPC methods (`opcda_read`).
    #[serde(default = "default_connector_type", rename = "type")]
    pub connector_type: String,
    #[serde(default)]
    pub server: ServerConfig,
    /// Connector-wide report strategy used when a device does not declare one.
    #[serde(default, alias = "reportStrategy")]
    pub report_strategy: Option<ReportStrategyConfig>,
    #[serde(default, alias = "mapping")]
    pub devices: Vec<DeviceConfig>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: default_connector_name(),
            id: default_connector_id(),
            connector_type: default_connector_type(),
            server: ServerConfig::default(),
            report_strategy: None,
            devices: Vec::new(),
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        if self.devices.is_empty() {
            return Err(anyhow!("connector must declare at least one device"));
        }
        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(anyhow!("device '{}' is declared more than once", device.name));
            }
        }
        Ok(())
    }

    /// Retrieve a device configuration by name.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }
}

/// Which session implementation backs the connector. Resolved once at startup.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Built-in data source producing random and waveform tags.
    #[default]
    Simulated,
    /// Plain in-memory tag store, only returns what was written.
    Memory,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server identity (ProgID) passed to the session on connect.
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(
        default = "default_poll_period",
        rename = "poll_period_ms",
        alias = "pollPeriodInMillis"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_period: Duration,
    #[serde(
        default = "default_call_timeout",
        rename = "timeout_ms",
        alias = "timeoutMs"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(
        default = "default_reconnect_delay",
        rename = "reconnect_delay_ms",
        alias = "reconnectDelayMs"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_delay: Duration,
    /// Upper bound for a single idle sleep of the run loop.
    #[serde(default = "default_idle_tick", rename = "idle_tick_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_tick: Duration,
    #[serde(default = "default_stop_timeout", rename = "stop_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
    /// Capacity of the acquisition to conversion channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub session: SessionKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            host: default_server_host(),
            poll_period: default_poll_period(),
            timeout: default_call_timeout(),
            reconnect_delay: default_reconnect_delay(),
            idle_tick: default_idle_tick(),
            stop_timeout: default_stop_timeout(),
            queue_capacity: default_queue_capacity(),
            session: SessionKind::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("server name must not be empty"));
        }
        if self.poll_period.is_zero() {
            return Err(anyhow!("poll period must be greater than zero"));
        }
        if self.idle_tick.is_zero() {
            return Err(anyhow!("idle tick must be greater than zero"));
        }
        if self.reconnect_delay.is_zero() {
            return Err(anyhow!("reconnect delay must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Static description of one logical device and its tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(alias = "deviceNamePattern")]
    pub name: String,
    #[serde(default = "default_device_profile", alias = "deviceTypePattern")]
    pub profile: String,
    /// Registered converter identifier, `default` when absent.
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default, alias = "reportStrategy")]
    pub report_strategy: Option<ReportStrategyConfig>,
    #[serde(default)]
    pub attributes: Vec<TagConfig>,
    #[serde(default)]
    pub timeseries: Vec<TagConfig>,
    #[serde(default, alias = "attributeUpdates")]
    pub attributes_updates: Vec<AttributeUpdateConfig>,
    #[serde(default, alias = "rpcMethods")]
    pub rpc_methods: Vec<RpcMethodConfig>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profile: profile.into(),
            converter: None,
            report_strategy: None,
            attributes: Vec::new(),
            timeseries: Vec::new(),
            attributes_updates: Vec::new(),
            rpc_methods: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("device name must not be empty"));
        }
        for (section, tags) in [("attributes", &self.attributes), ("timeseries", &self.timeseries)]
        {
            let mut keys = HashSet::new();
            for tag in tags {
                if tag.key.trim().is_empty() {
                    return Err(anyhow!(
                        "device '{}' has a {} entry without a key",
                        self.name,
                        section
                    ));
                }
                if tag.tag.trim().is_empty() {
                    return Err(anyhow!(
                        "device '{}' key '{}' in {} has no tag path",
                        self.name,
                        tag.key,
                        section
                    ));
                }
                if !keys.insert(tag.key.as_str()) {
                    return Err(anyhow!(
                        "device '{}' declares key '{}' twice in {}",
                        self.name,
                        tag.key,
                        section
                    ));
                }
            }
        }
        for update in &self.attributes_updates {
            if update.tag.trim().is_empty() {
                return Err(anyhow!(
                    "device '{}' attribute update '{}' has no tag path",
                    self.name,
                    update.key
                ));
            }
        }
        for method in &self.rpc_methods {
            if method.method.trim().is_empty() || method.tag.trim().is_empty() {
                return Err(anyhow!(
                    "device '{}' declares an rpc method without name or tag",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// One polled tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub key: String,
    #[serde(alias = "tagPath")]
    pub tag: String,
    /// Optional coercion applied to good-quality values.
    #[serde(default, rename = "type")]
    pub value_type: Option<ValueType>,
    #[serde(default, alias = "timestampLocation")]
    pub timestamp_location: TimestampLocation,
    #[serde(default, alias = "reportStrategy")]
    pub report_strategy: Option<ReportStrategyConfig>,
}

impl TagConfig {
    pub fn new(key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tag: tag.into(),
            value_type: None,
            timestamp_location: TimestampLocation::Gateway,
            report_strategy: None,
        }
    }

    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn with_timestamp_location(mut self, location: TimestampLocation) -> Self {
        self.timestamp_location = location;
        self
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[serde(alias = "integer")]
    Int,
    Double,
    Float,
    String,
    #[serde(alias = "boolean")]
    Bool,
}

/// Where the timestamp of a timeseries entry comes from.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampLocation {
    #[default]
    Gateway,
    Source,
}

/// Maps a shared attribute key onto a writable tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeUpdateConfig {
    #[serde(alias = "attributeOnThingsBoard")]
    pub key: String,
    #[serde(alias = "attributeOnDevice", alias = "tagPath")]
    pub tag: String,
}

/// Device-scoped RPC method that writes a fixed tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMethodConfig {
    pub method: String,
    pub tag: String,
    /// Value written when the call carries no params.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStrategyKind {
    OnReportPeriod,
    OnChange,
    OnChangeOrReportPeriod,
    OnReceived,
}

impl ReportStrategyKind {
    pub fn requires_period(&self) -> bool {
        matches!(
            self,
            ReportStrategyKind::OnReportPeriod | ReportStrategyKind::OnChangeOrReportPeriod
        )
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportStrategyConfig {
    #[serde(rename = "type")]
    pub kind: ReportStrategyKind,
    #[serde(default, rename = "report_period_ms", alias = "reportPeriod")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub report_period: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
