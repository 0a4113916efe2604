//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Report strategies applied to telemetry keys."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use r_ems_common::config::{ReportStrategyConfig, ReportStrategyKind};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("report strategy {0:?} requires a report period")]
    MissingPeriod(ReportStrategyKind),
    #[error("report period must be greater than zero")]
    ZeroPeriod,
    #[error("key `{key}` of device `{device}` cannot be resolved: {reason}")]
    Unresolvable {
        device: String,
        key: String,
        reason: String,
    },
}

/// Policy deciding under which key a value is reported.
///
/// Resolution is allowed to fail; callers fall back to the raw key.
pub trait ReportStrategy: Send + Sync + fmt::Debug {
    fn resolve_key(&self, device: &str, key: &str) -> Result<String, StrategyError>;
}

/// Strategy built from configuration. Keys are reported unchanged; kind and
/// period are validated here and logged when the device loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredReportStrategy {
    kind: ReportStrategyKind,
    report_period: Option<Duration>,
}

impl ConfiguredReportStrategy {
    pub fn from_config(config: &ReportStrategyConfig) -> Result<Self, StrategyError> {
        if config.kind.requires_period() {
            match config.report_period {
                None => return Err(StrategyError::MissingPeriod(config.kind)),
                Some(period) if period.is_zero() => return Err(StrategyError::ZeroPeriod),
                Some(_) => {}
            }
        }
        Ok(Self {
            kind: config.kind,
            report_period: config.report_period,
        })
    }

    pub fn kind(&self) -> ReportStrategyKind {
        self.kind
    }

    pub fn report_period(&self) -> Option<Duration> {
        self.report_period
    }
}

impl ReportStrategy for ConfiguredReportStrategy {
    fn resolve_key(&self, _device: &str, key: &str) -> Result<String, StrategyError> {
        Ok(key.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_strategies_need_a_period() {
        let config = ReportStrategyConfig {
            kind: ReportStrategyKind::OnReportPeriod,
            report_period: None,
        };
        assert_eq!(
            ConfiguredReportStrategy::from_config(&config),
            Err(StrategyError::MissingPeriod(ReportStrategyKind::OnReportPeriod))
        );

        let zero = ReportStrategyConfig {
            kind: ReportStrategyKind::OnChangeOrReportPeriod,
            report_period: Some(Duration::ZERO),
        };
        assert_eq!(
            ConfiguredReportStrategy::from_config(&zero),
            Err(StrategyError::ZeroPeriod)
        );
    }

    #[test]
    fn on_change_resolves_keys_unchanged() {
        let strategy = ConfiguredReportStrategy::from_config(&ReportStrategyConfig {
            kind: ReportStrategyKind::OnChange,
            report_period: None,
        })
        .unwrap();
        assert_eq!(strategy.resolve_key("dev", "temp").unwrap(), "temp");
        assert_eq!(strategy.kind(), ReportStrategyKind::OnChange);
        assert_eq!(strategy.report_period(), None);
    }
}
