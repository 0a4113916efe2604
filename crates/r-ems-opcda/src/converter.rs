//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Uplink conversion of raw readings into device records."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use r_ems_common::config::{TimestampLocation, ValueType};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::acquisition::AcquisitionUnit;
use crate::device::{Device, Section, Tag};
use crate::error::ConnectorError;
use crate::value::{RawReading, TagValue};

/// One timeseries entry of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEntry {
    pub ts: i64,
    pub values: IndexMap<String, Value>,
}

/// Normalized output of one device for one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedRecord {
    pub device_name: String,
    pub device_type: String,
    pub attributes: Vec<IndexMap<String, Value>>,
    pub telemetry: Vec<TelemetryEntry>,
}

impl ConvertedRecord {
    /// Record carrying only the device identity.
    pub fn identity(device: &Device) -> Self {
        Self {
            device_name: device.name().to_owned(),
            device_type: device.profile().to_owned(),
            attributes: Vec::new(),
            telemetry: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.telemetry.is_empty()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.iter().find_map(|entry| entry.get(key))
    }

    /// Telemetry entry holding `key`.
    pub fn telemetry_value(&self, key: &str) -> Option<(i64, &Value)> {
        self.telemetry
            .iter()
            .find_map(|entry| entry.values.get(key).map(|value| (entry.ts, value)))
    }
}

/// Record plus per-tag bookkeeping of a conversion.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub record: ConvertedRecord,
    pub attempts: usize,
    pub failures: usize,
}

/// Turns one acquisition unit into a record.
///
/// A returned error discards the whole unit; failures of single tags are
/// expected to be counted in [`Conversion::failures`] instead.
pub trait UplinkConverter: Send + Sync + fmt::Debug {
    fn convert(&self, device: &Device, unit: &AcquisitionUnit) -> Result<Conversion, ConnectorError>;
}

/// Converter used for every device unless configured otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpcDaUplinkConverter;

struct ConvertedTag {
    key: String,
    ts: i64,
    value: Value,
}

impl OpcDaUplinkConverter {
    pub fn new() -> Self {
        Self
    }

    fn convert_tag(
        &self,
        device: &Device,
        tag: &Tag,
        reading: &RawReading,
        acquired_at: i64,
    ) -> ConvertedTag {
        let value = if reading.quality.is_good() {
            let value = match tag.value_type {
                Some(value_type) => match coerce(&reading.value, value_type) {
                    Some(coerced) => coerced,
                    None => {
                        warn!(
                            device = %device.name(),
                            key = %tag.key,
                            value = %reading.value,
                            ?value_type,
                            "value type coercion failed, keeping value"
                        );
                        reading.value.clone()
                    }
                },
                None => reading.value.clone(),
            };
            value.to_json()
        } else {
            debug!(
                device = %device.name(),
                key = %tag.key,
                quality = %reading.quality,
                "bad quality reading"
            );
            Value::String(reading.quality.diagnostic())
        };

        let ts = match tag.timestamp_location {
            TimestampLocation::Source => reading
                .timestamp
                .as_ref()
                .and_then(|timestamp| timestamp.to_millis())
                .unwrap_or(acquired_at),
            TimestampLocation::Gateway => acquired_at,
        };

        let key = match device.strategy_for(tag) {
            Some(strategy) => strategy
                .resolve_key(device.name(), &tag.key)
                .unwrap_or_else(|err| {
                    debug!(device = %device.name(), error = %err, "key resolution failed, using raw key");
                    tag.key.clone()
                }),
            None => tag.key.clone(),
        };

        ConvertedTag { key, ts, value }
    }
}

impl UplinkConverter for OpcDaUplinkConverter {
    fn convert(&self, device: &Device, unit: &AcquisitionUnit) -> Result<Conversion, ConnectorError> {
        if device.has_tags() && unit.readings.is_empty() {
            return Err(ConnectorError::Conversion {
                device: device.name().to_owned(),
                reason: "reply carries no readings".into(),
            });
        }
        if unit.readings.len() != device.tags().len() {
            warn!(
                device = %device.name(),
                requested = device.tags().len(),
                received = unit.readings.len(),
                "reply size differs from request"
            );
        }

        let mut record = ConvertedRecord::identity(device);
        let mut failures = 0;
        for (index, tag) in device.tags().iter().enumerate() {
            let converted = reading_for(unit, index, &tag.path)
                .ok_or_else(|| ConnectorError::MissingReading {
                    device: device.name().to_owned(),
                    tag: tag.path.clone(),
                })
                .map(|reading| self.convert_tag(device, tag, reading, unit.acquired_at));
            match converted {
                Ok(ConvertedTag { key, ts, value }) => match tag.section {
                    Section::Attributes => {
                        record.attributes.push(IndexMap::from([(key, value)]));
                    }
                    Section::Timeseries => record.telemetry.push(TelemetryEntry {
                        ts,
                        values: IndexMap::from([(key, value)]),
                    }),
                },
                Err(err) => {
                    failures += 1;
                    warn!(device = %device.name(), key = %tag.key, error = %err, "tag conversion failed");
                }
            }
        }

        Ok(Conversion {
            record,
            attempts: device.tags().len(),
            failures,
        })
    }
}

/// Reading for the tag requested at `index`. Position is trusted only when the
/// path matches; otherwise the reply is searched by path.
fn reading_for<'a>(unit: &'a AcquisitionUnit, index: usize, path: &str) -> Option<&'a RawReading> {
    match unit.readings.get(index) {
        Some(reading) if reading.tag_path == path => Some(reading),
        _ => unit.readings.iter().find(|reading| reading.tag_path == path),
    }
}

fn coerce(value: &TagValue, value_type: ValueType) -> Option<TagValue> {
    match value_type {
        ValueType::Int => match value {
            TagValue::Int(int) => Some(TagValue::Int(*int)),
            TagValue::Float(float) if float.is_finite() => Some(TagValue::Int(float.trunc() as i64)),
            TagValue::Bool(flag) => Some(TagValue::Int(i64::from(*flag))),
            TagValue::Text(text) => {
                let text = text.trim();
                text.parse::<i64>()
                    .ok()
                    .or_else(|| {
                        text.parse::<f64>()
                            .ok()
                            .filter(|float| float.is_finite())
                            .map(|float| float.trunc() as i64)
                    })
                    .map(TagValue::Int)
            }
            _ => None,
        },
        ValueType::Double | ValueType::Float => match value {
            TagValue::Int(int) => Some(TagValue::Float(*int as f64)),
            TagValue::Float(float) => Some(TagValue::Float(*float)),
            TagValue::Bool(flag) => Some(TagValue::Float(if *flag { 1.0 } else { 0.0 })),
            TagValue::Text(text) => text.trim().parse::<f64>().ok().map(TagValue::Float),
            _ => None,
        },
        ValueType::String => match value {
            TagValue::Null => None,
            other => Some(TagValue::Text(other.to_string())),
        },
        ValueType::Bool => match value {
            TagValue::Bool(flag) => Some(TagValue::Bool(*flag)),
            TagValue::Int(int) => Some(TagValue::Bool(*int != 0)),
            TagValue::Float(float) => Some(TagValue::Bool(*float != 0.0)),
            TagValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(TagValue::Bool(true)),
                "false" | "0" | "off" => Some(TagValue::Bool(false)),
                _ => None,
            },
            _ => None,
        },
    }
}

type ConverterFactory = Arc<dyn Fn() -> Arc<dyn UplinkConverter> + Send + Sync>;

/// Converter implementations by identifier, resolved once per device.
#[derive(Clone)]
pub struct ConverterRegistry {
    factories: HashMap<String, ConverterFactory>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ConverterRegistry")
            .field("converters", &names)
            .finish()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("default", || Arc::new(OpcDaUplinkConverter::new()));
        registry.register("opcda", || Arc::new(OpcDaUplinkConverter::new()));
        registry
    }
}

impl ConverterRegistry {
    pub const DEFAULT: &'static str = "default";

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn UplinkConverter> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<dyn UplinkConverter>, ConnectorError> {
        let id = id.unwrap_or(Self::DEFAULT);
        self.factories
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| ConnectorError::UnknownConverter(id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use r_ems_common::config::{DeviceConfig, TagConfig};
    use serde_json::json;

    use super::*;
    use crate::strategy::{ReportStrategy, StrategyError};
    use crate::value::{Quality, SourceTimestamp};

    const ACQUIRED_AT: i64 = 1_700_000_000_000;

    fn device(config: DeviceConfig) -> Arc<Device> {
        Arc::new(Device::from_config(&config, None, &ConverterRegistry::default()).unwrap())
    }

    fn unit(device: &Arc<Device>, readings: Vec<RawReading>) -> AcquisitionUnit {
        AcquisitionUnit {
            device: device.clone(),
            readings,
            acquired_at: ACQUIRED_AT,
        }
    }

    fn convert(device: &Arc<Device>, readings: Vec<RawReading>) -> Conversion {
        OpcDaUplinkConverter::new()
            .convert(device, &unit(device, readings))
            .unwrap()
    }

    #[test]
    fn timestamp_source_uses_reading_instant() {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(
            TagConfig::new("src", "A").with_timestamp_location(TimestampLocation::Source),
        );
        config.timeseries.push(TagConfig::new("gw", "B"));
        config.timeseries.push(
            TagConfig::new("broken", "C").with_timestamp_location(TimestampLocation::Source),
        );
        let device = device(config);
        let conversion = convert(
            &device,
            vec![
                RawReading::new("A", TagValue::Int(1), Quality::GOOD)
                    .with_timestamp(SourceTimestamp::Millis(1_600_000_000_000)),
                RawReading::new("B", TagValue::Int(2), Quality::GOOD)
                    .with_timestamp(SourceTimestamp::Millis(1_600_000_000_000)),
                RawReading::new("C", TagValue::Int(3), Quality::GOOD)
                    .with_timestamp(SourceTimestamp::Text("not a time".into())),
            ],
        );
        let record = conversion.record;
        assert_eq!(record.telemetry_value("src").unwrap().0, 1_600_000_000_000);
        assert_eq!(record.telemetry_value("gw").unwrap().0, ACQUIRED_AT);
        assert_eq!(record.telemetry_value("broken").unwrap().0, ACQUIRED_AT);
    }

    #[test]
    fn coercion_failure_keeps_value() {
        let mut config = DeviceConfig::new("dev", "default");
        config
            .attributes
            .push(TagConfig::new("label", "A").with_type(ValueType::Int));
        config
            .attributes
            .push(TagConfig::new("flag", "B").with_type(ValueType::Bool));
        let device = device(config);
        let conversion = convert(
            &device,
            vec![
                RawReading::new("A", TagValue::Text("abc".into()), Quality::GOOD),
                RawReading::new("B", TagValue::Text("on".into()), Quality::GOOD),
            ],
        );
        assert_eq!(conversion.failures, 0);
        assert_eq!(conversion.record.attribute("label"), Some(&json!("abc")));
        assert_eq!(conversion.record.attribute("flag"), Some(&json!(true)));
    }

    #[test]
    fn reordered_reply_is_matched_by_path() {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("a", "A"));
        config.timeseries.push(TagConfig::new("b", "B"));
        let device = device(config);
        let conversion = convert(
            &device,
            vec![
                RawReading::new("B", TagValue::Int(2), Quality::GOOD),
                RawReading::new("A", TagValue::Int(1), Quality::GOOD),
            ],
        );
        assert_eq!(conversion.record.telemetry_value("a").unwrap().1, &json!(1));
        assert_eq!(conversion.record.telemetry_value("b").unwrap().1, &json!(2));
    }

    #[test]
    fn missing_reading_fails_only_its_tag() {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("a", "A"));
        config.timeseries.push(TagConfig::new("b", "B"));
        config.timeseries.push(TagConfig::new("c", "C"));
        let device = device(config);
        let conversion = convert(
            &device,
            vec![
                RawReading::new("A", TagValue::Float(f64::NAN), Quality::GOOD),
                RawReading::new("B", TagValue::Int(2), Quality::GOOD),
            ],
        );
        assert_eq!(conversion.attempts, 3);
        assert_eq!(conversion.failures, 1);
        assert_eq!(conversion.record.telemetry.len(), 2);
        assert_eq!(conversion.record.telemetry_value("a").unwrap().1, &json!("NaN"));
        assert_eq!(conversion.record.telemetry_value("b").unwrap().1, &json!(2));
        assert!(conversion.record.telemetry_value("c").is_none());
    }

    /// Resolves every key to `<device>.<key>` except the ones listed.
    #[derive(Debug)]
    struct PrefixingStrategy {
        unresolvable: Vec<&'static str>,
    }

    impl ReportStrategy for PrefixingStrategy {
        fn resolve_key(&self, device: &str, key: &str) -> Result<String, StrategyError> {
            if self.unresolvable.contains(&key) {
                return Err(StrategyError::Unresolvable {
                    device: device.to_owned(),
                    key: key.to_owned(),
                    reason: "no mapping".into(),
                });
            }
            Ok(format!("{device}.{key}"))
        }
    }

    #[test]
    fn failed_key_resolution_falls_back_to_raw_key() {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("temp", "A"));
        config.timeseries.push(TagConfig::new("flow", "B"));
        config.attributes.push(TagConfig::new("model", "C"));
        let strategy: Arc<dyn ReportStrategy> = Arc::new(PrefixingStrategy {
            unresolvable: vec!["temp", "model"],
        });
        let device = Arc::new(
            Device::from_config(&config, Some(strategy), &ConverterRegistry::default()).unwrap(),
        );
        let conversion = convert(
            &device,
            vec![
                RawReading::new("A", TagValue::Int(21), Quality::GOOD),
                RawReading::new("B", TagValue::Float(1.5), Quality::GOOD),
                RawReading::new("C", TagValue::Text("X1".into()), Quality::GOOD),
            ],
        );
        assert_eq!(conversion.failures, 0);
        let record = conversion.record;
        assert_eq!(record.telemetry_value("temp").unwrap().1, &json!(21));
        assert_eq!(record.telemetry_value("dev.flow").unwrap().1, &json!(1.5));
        assert!(record.telemetry_value("flow").is_none());
        assert_eq!(record.attribute("model"), Some(&json!("X1")));
    }

    #[test]
    fn empty_reply_fails_the_unit() {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("a", "A"));
        let device = device(config);
        let result = OpcDaUplinkConverter::new().convert(&device, &unit(&device, Vec::new()));
        assert!(matches!(result, Err(ConnectorError::Conversion { .. })));
    }

    #[test]
    fn record_serializes_in_camel_case() {
        let mut config = DeviceConfig::new("dev", "meter");
        config.attributes.push(TagConfig::new("model", "B"));
        let device = device(config);
        let conversion = convert(
            &device,
            vec![RawReading::new("B", TagValue::Text("X1".into()), Quality::GOOD)],
        );
        assert_eq!(
            serde_json::to_value(&conversion.record).unwrap(),
            json!({
                "deviceName": "dev",
                "deviceType": "meter",
                "attributes": [{"model": "X1"}],
                "telemetry": []
            })
        );
    }

    #[test]
    fn registry_resolves_default_and_custom_ids() {
        let mut registry = ConverterRegistry::default();
        assert!(registry.resolve(None).is_ok());
        assert!(registry.resolve(Some("opcda")).is_ok());
        assert!(registry.resolve(Some("custom")).is_err());
        registry.register("custom", || Arc::new(OpcDaUplinkConverter::new()));
        assert!(registry.contains("custom"));
        assert!(registry.resolve(Some("custom")).is_ok());
    }
}
