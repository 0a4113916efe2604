//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Static per-device view of polled tags and write mappings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use r_ems_common::config::{
    DeviceConfig, ReportStrategyConfig, RpcMethodConfig, TimestampLocation, ValueType,
};
use r_ems_common::time::duration_to_millis;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::converter::{ConverterRegistry, UplinkConverter};
use crate::error::ConnectorError;
use crate::strategy::{ConfiguredReportStrategy, ReportStrategy};

/// Record section a tag is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Attributes,
    Timeseries,
}

/// One polled tag of a device.
#[derive(Debug, Clone)]
pub struct Tag {
    pub key: String,
    pub path: String,
    pub section: Section,
    pub timestamp_location: TimestampLocation,
    pub value_type: Option<ValueType>,
    pub report_strategy: Option<Arc<dyn ReportStrategy>>,
}

/// Immutable view of a configured device, built once at startup.
///
/// Tags are ordered attributes first, then timeseries, and [`Device::tag_paths`]
/// follows the same order. A batched read requests the paths in this order so
/// reply position `i` belongs to tag `i`.
#[derive(Debug)]
pub struct Device {
    name: String,
    profile: String,
    tags: Vec<Tag>,
    paths: Vec<String>,
    attribute_updates: IndexMap<String, String>,
    rpc_methods: IndexMap<String, RpcMethodConfig>,
    report_strategy: Option<Arc<dyn ReportStrategy>>,
    converter: Arc<dyn UplinkConverter>,
}

impl Device {
    /// Build a device from configuration.
    ///
    /// `connector_strategy` applies when the device declares none, or declares
    /// one that does not validate.
    pub fn from_config(
        config: &DeviceConfig,
        connector_strategy: Option<Arc<dyn ReportStrategy>>,
        registry: &ConverterRegistry,
    ) -> Result<Self, ConnectorError> {
        config
            .validate()
            .map_err(|err| ConnectorError::InvalidDevice {
                device: config.name.clone(),
                reason: err.to_string(),
            })?;

        let report_strategy = match &config.report_strategy {
            Some(strategy) => match build_strategy(strategy) {
                Ok(strategy) => Some(strategy),
                Err(err) => {
                    error!(
                        device = %config.name,
                        error = %err,
                        "invalid report strategy, using connector strategy"
                    );
                    connector_strategy
                }
            },
            None => connector_strategy,
        };

        let mut tags = Vec::with_capacity(config.attributes.len() + config.timeseries.len());
        for (section, entries) in [
            (Section::Attributes, &config.attributes),
            (Section::Timeseries, &config.timeseries),
        ] {
            for entry in entries {
                let tag_strategy = match &entry.report_strategy {
                    Some(strategy) => build_strategy(strategy)
                        .map_err(|err| {
                            warn!(
                                device = %config.name,
                                key = %entry.key,
                                error = %err,
                                "invalid tag report strategy, using device strategy"
                            );
                        })
                        .ok(),
                    None => None,
                };
                tags.push(Tag {
                    key: entry.key.clone(),
                    path: entry.tag.clone(),
                    section,
                    timestamp_location: entry.timestamp_location,
                    value_type: entry.value_type,
                    report_strategy: tag_strategy,
                });
            }
        }
        let paths = tags.iter().map(|tag| tag.path.clone()).collect();

        let attribute_updates = config
            .attributes_updates
            .iter()
            .map(|update| (update.key.clone(), update.tag.clone()))
            .collect();
        let rpc_methods = config
            .rpc_methods
            .iter()
            .map(|method| (method.method.clone(), method.clone()))
            .collect();

        let converter = registry.resolve(config.converter.as_deref())?;

        Ok(Self {
            name: config.name.clone(),
            profile: config.profile.clone(),
            tags,
            paths,
            attribute_updates,
            rpc_methods,
            report_strategy,
            converter,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Paths in read order.
    pub fn tag_paths(&self) -> &[String] {
        &self.paths
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn tag_by_key(&self, key: &str) -> Option<&Tag> {
        self.tags.iter().find(|tag| tag.key == key)
    }

    pub fn attribute_update_path(&self, key: &str) -> Option<&str> {
        self.attribute_updates.get(key).map(String::as_str)
    }

    /// Tag path for an RPC key: the attribute update map first, then polled tags.
    pub fn resolve_rpc_key(&self, key: &str) -> Option<&str> {
        self.attribute_update_path(key)
            .or_else(|| self.tag_by_key(key).map(|tag| tag.path.as_str()))
    }

    pub fn rpc_method(&self, method: &str) -> Option<&RpcMethodConfig> {
        self.rpc_methods.get(method)
    }

    pub fn report_strategy(&self) -> Option<&Arc<dyn ReportStrategy>> {
        self.report_strategy.as_ref()
    }

    /// Strategy applied to `tag`: its own override, else the device strategy.
    pub fn strategy_for<'a>(&'a self, tag: &'a Tag) -> Option<&'a Arc<dyn ReportStrategy>> {
        tag.report_strategy
            .as_ref()
            .or(self.report_strategy.as_ref())
    }

    pub fn converter(&self) -> &Arc<dyn UplinkConverter> {
        &self.converter
    }
}

pub(crate) fn build_strategy(
    config: &ReportStrategyConfig,
) -> Result<Arc<dyn ReportStrategy>, crate::strategy::StrategyError> {
    let strategy = ConfiguredReportStrategy::from_config(config)?;
    debug!(
        kind = ?strategy.kind(),
        period_ms = strategy.report_period().map(duration_to_millis),
        "report strategy configured"
    );
    Ok(Arc::new(strategy))
}
