//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the connector runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the R-EMS OPC-DA connector workspace.
//! This crate exposes configuration loading, tracing bootstrap and time
//! helpers consumed by the connector library and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, AttributeUpdateConfig, ConnectorConfig, DeviceConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, ReportStrategyConfig, ReportStrategyKind, RpcMethodConfig,
    ServerConfig, SessionKind, TagConfig, TimestampLocation, ValueType,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
