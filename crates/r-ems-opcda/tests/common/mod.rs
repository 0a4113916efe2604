//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Shared fixtures for OPC-DA connector integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use r_ems_common::config::{
    AttributeUpdateConfig, ConnectorConfig, DeviceConfig, TagConfig, TimestampLocation, ValueType,
};
use r_ems_opcda::{
    ChannelSink, ConnectorBuilder, ConnectorHandle, ConnectorMetrics, DispatchedRecord,
    MemorySession, MemoryStore,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const BOILER: &str = "Boiler 1";
pub const TEMP_PATH: &str = "Boiler1.Temperature";
pub const MODEL_PATH: &str = "Boiler1.Model";
pub const SETPOINT_PATH: &str = "Boiler1.Setpoint";

/// temp (timeseries, int) and model (attribute, string), plus a writable setpoint.
pub fn boiler_device(temp_location: TimestampLocation) -> DeviceConfig {
    let mut device = DeviceConfig::new(BOILER, "boiler");
    device.timeseries.push(
        TagConfig::new("temp", TEMP_PATH)
            .with_type(ValueType::Int)
            .with_timestamp_location(temp_location),
    );
    device
        .attributes
        .push(TagConfig::new("model", MODEL_PATH).with_type(ValueType::String));
    device.attributes_updates.push(AttributeUpdateConfig {
        key: "setpoint".into(),
        tag: SETPOINT_PATH.into(),
    });
    device
}

pub fn connector_config(devices: Vec<DeviceConfig>) -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.server.poll_period = Duration::from_millis(25);
    config.server.idle_tick = Duration::from_millis(5);
    config.server.reconnect_delay = Duration::from_millis(20);
    config.server.stop_timeout = Duration::from_secs(2);
    config.server.timeout = Duration::from_millis(200);
    config.devices = devices;
    config
}

pub struct Running {
    pub handle: ConnectorHandle,
    pub records: UnboundedReceiver<DispatchedRecord>,
    pub store: MemoryStore,
    pub metrics: ConnectorMetrics,
}

pub fn start(config: ConnectorConfig, store: &MemoryStore) -> Running {
    r_ems_common::init_test_tracing();
    let (sink, records) = ChannelSink::new();
    let metrics = ConnectorMetrics::detached().unwrap();
    let handle = ConnectorBuilder::new(
        config,
        Box::new(MemorySession::with_store(store.clone())),
        Arc::new(sink),
    )
    .with_metrics(metrics.clone())
    .build()
    .unwrap()
    .start();
    Running {
        handle,
        records,
        store: store.clone(),
        metrics,
    }
}

pub async fn next_record(records: &mut UnboundedReceiver<DispatchedRecord>) -> DispatchedRecord {
    tokio::time::timeout(Duration::from_secs(3), records.recv())
        .await
        .expect("no record within 3s")
        .expect("record channel closed")
}

/// Poll `condition` every 5 ms for up to 3 s.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..600 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
