//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Attribute update and RPC pass-through to the tag session."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::device::Device;
use crate::error::SessionError;
use crate::metrics::ConnectorMetrics;
use crate::value::TagValue;

/// Shared attribute change pushed by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub device: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub device: String,
    pub data: RpcData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Structured outcome of every RPC or attribute write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub code: u16,
}

impl RpcReply {
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            code: 200,
        }
    }

    pub fn from_error(error: &RpcError) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.to_string()),
            code: error.code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("device `{0}` not found")]
    DeviceNotFound(String),
    #[error("key `{key}` is not mapped to a tag on device `{device}`")]
    KeyNotMapped { device: String, key: String },
    #[error("method `{0}` not found")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("session is not connected")]
    NotConnected,
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RpcError {
    pub fn code(&self) -> u16 {
        match self {
            RpcError::DeviceNotFound(_)
            | RpcError::KeyNotMapped { .. }
            | RpcError::MethodNotFound(_) => 404,
            RpcError::InvalidParams(_) => 400,
            RpcError::NotConnected => 503,
            RpcError::Session(SessionError::Timeout(_)) => 504,
            RpcError::Session(_) => 500,
        }
    }
}

/// Result of writing one key of an attribute update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeWriteOutcome {
    pub key: String,
    pub reply: RpcReply,
}

const UNKNOWN_METHOD: &str = "unknown";

/// Where an RPC wants to read or write.
enum Target {
    Key(String),
    Path(String),
    KeyOrPath(String),
}

/// Event-triggered reads and writes, independent of the poll pipeline.
///
/// Failures are reported to the caller only; they never change the
/// connection state.
#[derive(Debug, Clone)]
pub struct PassThrough {
    devices: Arc<IndexMap<String, Arc<Device>>>,
    connection: Arc<ConnectionManager>,
    method_prefix: String,
    metrics: ConnectorMetrics,
}

impl PassThrough {
    pub fn new(
        devices: Arc<IndexMap<String, Arc<Device>>>,
        connection: Arc<ConnectionManager>,
        connector_type: &str,
        metrics: ConnectorMetrics,
    ) -> Self {
        Self {
            devices,
            connection,
            method_prefix: format!("{}_", connector_type.to_ascii_lowercase()),
            metrics,
        }
    }

    fn device(&self, name: &str) -> Result<&Arc<Device>, RpcError> {
        self.devices
            .get(name)
            .ok_or_else(|| RpcError::DeviceNotFound(name.to_owned()))
    }

    fn ensure_connected(&self) -> Result<(), RpcError> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(RpcError::NotConnected)
        }
    }

    /// Write every mapped key of `update`. Keys without a mapping fail locally.
    pub async fn on_attributes_update(
        &self,
        update: &AttributeUpdate,
    ) -> Result<Vec<AttributeWriteOutcome>, RpcError> {
        let device = match self.device(&update.device) {
            Ok(device) => device,
            Err(err) => {
                self.metrics.inc_rpc("attribute_update", err.code());
                return Err(err);
            }
        };
        let mut outcomes = Vec::with_capacity(update.data.len());
        for (key, value) in &update.data {
            let result = match device.attribute_update_path(key) {
                Some(path) => self.write_path(path, value).await.map(|()| value.clone()),
                None => Err(RpcError::KeyNotMapped {
                    device: device.name().to_owned(),
                    key: key.clone(),
                }),
            };
            let reply = match result {
                Ok(value) => RpcReply::ok(value),
                Err(err) => {
                    warn!(device = %device.name(), %key, error = %err, "attribute update failed");
                    RpcReply::from_error(&err)
                }
            };
            self.metrics.inc_rpc("attribute_update", reply.code);
            outcomes.push(AttributeWriteOutcome {
                key: key.clone(),
                reply,
            });
        }
        Ok(outcomes)
    }

    /// Serve one RPC call. Always yields a reply.
    pub async fn handle_rpc(&self, request: &RpcRequest) -> RpcReply {
        let method = self.normalize_method(&request.data.method);
        let reply = match self.dispatch(request, &method).await {
            Ok(value) => RpcReply::ok(value),
            Err(err) => {
                warn!(
                    device = %request.device,
                    method = %request.data.method,
                    error = %err,
                    "rpc failed"
                );
                RpcReply::from_error(&err)
            }
        };
        self.metrics
            .inc_rpc(&self.metric_label(&request.device, &method), reply.code);
        reply
    }

    /// Metric label for `method`: built-in and device-declared methods keep
    /// their name, anything else is counted as `unknown`.
    fn metric_label(&self, device: &str, method: &str) -> String {
        match method {
            "read" | "write" => method.to_owned(),
            custom => self
                .devices
                .get(device)
                .and_then(|device| device.rpc_method(custom))
                .map(|rpc| rpc.method.clone())
                .unwrap_or_else(|| UNKNOWN_METHOD.to_owned()),
        }
    }

    fn normalize_method(&self, method: &str) -> String {
        let method = method.trim();
        let lowered = method.to_ascii_lowercase();
        let stripped = match lowered.strip_prefix(&self.method_prefix) {
            Some(rest) => &method[method.len() - rest.len()..],
            None => method,
        };
        match stripped.to_ascii_lowercase().as_str() {
            "get" | "read" => "read".to_owned(),
            "set" | "write" => "write".to_owned(),
            _ => stripped.to_owned(),
        }
    }

    async fn dispatch(&self, request: &RpcRequest, method: &str) -> Result<Value, RpcError> {
        let device = self.device(&request.device)?;
        let params = &request.data.params;
        match method {
            "read" => {
                let path = resolve_target(device, read_target(params)?)?;
                self.ensure_connected()?;
                debug!(device = %device.name(), tag = %path, "rpc read");
                let reading = self.connection.guard().read_one(&path).await?;
                Ok(json!({
                    "tag": path,
                    "value": reading.value.to_json(),
                    "quality": reading.quality.code(),
                }))
            }
            "write" => {
                let (target, value) = write_target(params)?;
                let path = resolve_target(device, target)?;
                self.write_path(&path, &value).await?;
                Ok(value)
            }
            custom => {
                let Some(rpc) = device.rpc_method(custom) else {
                    return Err(RpcError::MethodNotFound(request.data.method.clone()));
                };
                let value = if params.is_null() {
                    rpc.value.clone().ok_or_else(|| {
                        RpcError::InvalidParams(format!("method `{custom}` needs a value"))
                    })?
                } else {
                    params.clone()
                };
                self.write_path(&rpc.tag, &value).await?;
                Ok(json!("success"))
            }
        }
    }

    async fn write_path(&self, path: &str, value: &Value) -> Result<(), RpcError> {
        self.ensure_connected()?;
        debug!(tag = path, %value, "pass-through write");
        self.connection
            .guard()
            .write(path, &TagValue::from_json(value))
            .await?;
        Ok(())
    }
}

fn resolve_target(device: &Device, target: Target) -> Result<String, RpcError> {
    match target {
        Target::Path(path) => Ok(path),
        Target::Key(key) => device
            .resolve_rpc_key(&key)
            .map(str::to_owned)
            .ok_or_else(|| RpcError::KeyNotMapped {
                device: device.name().to_owned(),
                key,
            }),
        Target::KeyOrPath(name) => Ok(device
            .resolve_rpc_key(&name)
            .map(str::to_owned)
            .unwrap_or(name)),
    }
}

/// `"tag=X;value=Y"` into its parts.
fn parse_pairs(text: &str) -> IndexMap<String, String> {
    text.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
        .collect()
}

fn object_target(params: &Map<String, Value>) -> Result<Target, RpcError> {
    let text = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_owned);
    if let Some(path) = text("tag").or_else(|| text("tagPath")) {
        return Ok(Target::Path(path));
    }
    if let Some(key) = text("key") {
        return Ok(Target::Key(key));
    }
    Err(RpcError::InvalidParams(
        "expected `tag` or `key` in params".into(),
    ))
}

fn read_target(params: &Value) -> Result<Target, RpcError> {
    match params {
        Value::String(text) if text.contains('=') => parse_pairs(text)
            .get("tag")
            .map(|tag| Target::KeyOrPath(tag.clone()))
            .ok_or_else(|| RpcError::InvalidParams(format!("no tag in `{text}`"))),
        Value::String(text) if !text.trim().is_empty() => Ok(Target::KeyOrPath(text.trim().to_owned())),
        Value::Object(map) => object_target(map),
        _ => Err(RpcError::InvalidParams("read needs a tag".into())),
    }
}

fn write_target(params: &Value) -> Result<(Target, Value), RpcError> {
    match params {
        Value::String(text) => {
            let pairs = parse_pairs(text);
            let tag = pairs
                .get("tag")
                .ok_or_else(|| RpcError::InvalidParams(format!("no tag in `{text}`")))?;
            let raw = pairs
                .get("value")
                .ok_or_else(|| RpcError::InvalidParams(format!("no value in `{text}`")))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            Ok((Target::KeyOrPath(tag.clone()), value))
        }
        Value::Object(map) => {
            let value = map
                .get("value")
                .cloned()
                .ok_or_else(|| RpcError::InvalidParams("write needs a value".into()))?;
            Ok((object_target(map)?, value))
        }
        _ => Err(RpcError::InvalidParams(
            "write needs `{tag|key, value}` or `tag=..;value=..`".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use r_ems_common::config::{AttributeUpdateConfig, DeviceConfig, RpcMethodConfig, TagConfig};

    use super::*;
    use crate::converter::ConverterRegistry;
    use crate::guard::SessionGuard;
    use crate::session::{MemorySession, MemoryStore};

    async fn pass_through(store: &MemoryStore) -> PassThrough {
        let mut config = DeviceConfig::new("Boiler 1", "boiler");
        config.timeseries.push(TagConfig::new("temp", "Boiler1.Temperature"));
        config.attributes_updates.push(AttributeUpdateConfig {
            key: "setpoint".into(),
            tag: "Boiler1.Setpoint".into(),
        });
        config.rpc_methods.push(RpcMethodConfig {
            method: "reset".into(),
            tag: "Boiler1.Reset".into(),
            value: Some(json!(true)),
        });
        let device =
            Arc::new(Device::from_config(&config, None, &ConverterRegistry::default()).unwrap());
        let devices = Arc::new(IndexMap::from([(device.name().to_owned(), device)]));
        let guard = Arc::new(SessionGuard::new(
            Box::new(MemorySession::with_store(store.clone())),
            Duration::from_millis(50),
        ));
        let metrics = ConnectorMetrics::detached().unwrap();
        let connection = Arc::new(ConnectionManager::new(guard, "srv", "host", metrics.clone()));
        connection.connect().await.unwrap();
        PassThrough::new(devices, connection, "opcda", metrics)
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            device: "Boiler 1".into(),
            data: RpcData {
                id: Some(json!(1)),
                method: method.into(),
                params,
            },
        }
    }

    #[tokio::test]
    async fn methods_are_normalized() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        assert_eq!(pass.normalize_method("get"), "read");
        assert_eq!(pass.normalize_method("opcda_set"), "write");
        assert_eq!(pass.normalize_method("OPCDA_Reset"), "Reset");
        assert_eq!(pass.normalize_method("reset"), "reset");
    }

    #[tokio::test]
    async fn write_accepts_key_value_string() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        let reply = pass
            .handle_rpc(&request("set", json!("tag=setpoint;value=42")))
            .await;
        assert!(reply.success, "{reply:?}");
        assert_eq!(store.value("Boiler1.Setpoint"), Some(TagValue::Int(42)));
    }

    #[tokio::test]
    async fn read_by_mapped_key_returns_value_and_quality() {
        let store = MemoryStore::default();
        store.set("Boiler1.Temperature", 71.5);
        let pass = pass_through(&store).await;
        let reply = pass.handle_rpc(&request("read", json!({"key": "temp"}))).await;
        assert_eq!(
            reply.value,
            Some(json!({"tag": "Boiler1.Temperature", "value": 71.5, "quality": 192}))
        );
    }

    #[tokio::test]
    async fn custom_method_writes_configured_value() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        let reply = pass.handle_rpc(&request("reset", Value::Null)).await;
        assert_eq!(reply, RpcReply::ok(json!("success")));
        assert_eq!(store.value("Boiler1.Reset"), Some(TagValue::Bool(true)));
    }

    #[tokio::test]
    async fn unknown_method_and_device_are_not_found() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        assert_eq!(pass.handle_rpc(&request("explode", Value::Null)).await.code, 404);
        let mut other = request("read", json!("A"));
        other.device = "Nope".into();
        assert_eq!(pass.handle_rpc(&other).await.code, 404);
    }

    #[tokio::test]
    async fn undeclared_methods_share_one_metric_series() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        for i in 0..50 {
            let reply = pass
                .handle_rpc(&request(&format!("junk_{i}"), Value::Null))
                .await;
            assert_eq!(reply.code, 404);
        }
        pass.handle_rpc(&request("reset", Value::Null)).await;
        pass.handle_rpc(&request("get", json!("Boiler1.Temperature")))
            .await;

        assert_eq!(pass.metrics.rpc_calls("unknown", 404), 50);
        assert_eq!(pass.metrics.rpc_calls("reset", 200), 1);
        let series = pass
            .metrics
            .registry()
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "r_ems_opcda_rpc_calls_total")
            .map(|family| family.get_metric().len())
            .unwrap();
        assert_eq!(series, 3);
    }

    #[tokio::test]
    async fn write_without_value_is_invalid() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        let reply = pass.handle_rpc(&request("write", json!({"tag": "A"}))).await;
        assert_eq!(reply.code, 400);
        assert_eq!(store.calls().write, 0);
    }

    #[tokio::test]
    async fn session_errors_are_reported_without_dropping_connection() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        store.fail_next_write(SessionError::Lost("gone".into()));
        let reply = pass
            .handle_rpc(&request("write", json!({"tag": "A", "value": 1})))
            .await;
        assert!(!reply.success);
        assert_eq!(reply.code, 500);
        assert!(pass.connection.is_connected());
    }

    #[tokio::test]
    async fn attribute_updates_write_mapped_keys_only() {
        let store = MemoryStore::default();
        let pass = pass_through(&store).await;
        let mut data = Map::new();
        data.insert("setpoint".into(), json!(55));
        data.insert("unknown".into(), json!(1));
        let outcomes = pass
            .on_attributes_update(&AttributeUpdate {
                device: "Boiler 1".into(),
                data,
            })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].reply.success);
        assert_eq!(outcomes[1].reply.code, 404);
        assert_eq!(store.calls().write, 1);
        assert_eq!(store.value("Boiler1.Setpoint"), Some(TagValue::Int(55)));
    }

    #[test]
    fn reply_serialization_skips_absent_fields() {
        let reply = RpcReply::from_error(&RpcError::MethodNotFound("x".into()));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"success": false, "error": "method `x` not found", "code": 404})
        );
    }
}
