//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Long-lived conversion worker draining acquisition units."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::acquisition::AcquisitionUnit;
use crate::converter::ConvertedRecord;
use crate::metrics::ConnectorMetrics;
use crate::sink::RecordSink;

/// Converts units from the poll loop and hands the records to the sink.
pub struct ConversionWorker {
    connector_name: String,
    connector_id: String,
    rx: mpsc::Receiver<AcquisitionUnit>,
    sink: Arc<dyn RecordSink>,
    metrics: ConnectorMetrics,
}

impl ConversionWorker {
    pub fn new(
        connector_name: impl Into<String>,
        connector_id: impl Into<String>,
        rx: mpsc::Receiver<AcquisitionUnit>,
        sink: Arc<dyn RecordSink>,
        metrics: ConnectorMetrics,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            connector_id: connector_id.into(),
            rx,
            sink,
            metrics,
        }
    }

    /// Run until shutdown is signalled or the poll loop drops its sender.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!(connector = %self.connector_name, "conversion worker shutdown");
                    break;
                }
                unit = self.rx.recv() => match unit {
                    Some(unit) => self.process(unit).await,
                    None => {
                        debug!(connector = %self.connector_name, "acquisition channel closed");
                        break;
                    }
                },
            }
        }
    }

    async fn process(&self, unit: AcquisitionUnit) {
        self.metrics.inc_received();
        let device = unit.device.clone();
        let record = match device.converter().convert(&device, &unit) {
            Ok(conversion) => {
                if conversion.failures > 0 {
                    warn!(
                        device = %device.name(),
                        attempts = conversion.attempts,
                        failures = conversion.failures,
                        "some tags failed to convert"
                    );
                }
                self.metrics
                    .add_conversion_failures(device.name(), conversion.failures as u64);
                conversion.record
            }
            Err(err) => {
                error!(device = %device.name(), error = %err, "conversion failed, sending identity record");
                self.metrics.add_conversion_failures(device.name(), 1);
                ConvertedRecord::identity(&device)
            }
        };

        match self
            .sink
            .send(&self.connector_name, &self.connector_id, record)
            .await
        {
            Ok(()) => self.metrics.inc_sent(),
            Err(err) => {
                error!(device = %device.name(), error = %err, "sink rejected record")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use r_ems_common::config::{DeviceConfig, TagConfig};

    use super::*;
    use crate::converter::ConverterRegistry;
    use crate::device::Device;
    use crate::sink::ChannelSink;
    use crate::value::{Quality, RawReading, TagValue};

    fn device() -> Arc<Device> {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("a", "A"));
        Arc::new(Device::from_config(&config, None, &ConverterRegistry::default()).unwrap())
    }

    #[tokio::test]
    async fn failed_units_degrade_and_worker_keeps_running() {
        let (tx, rx) = mpsc::channel(4);
        let (sink, mut records) = ChannelSink::new();
        let metrics = ConnectorMetrics::detached().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = ConversionWorker::new("OPC-DA", "opcda", rx, Arc::new(sink), metrics.clone());
        let task = tokio::spawn(worker.run(shutdown_rx));

        let device = device();
        tx.send(AcquisitionUnit {
            device: device.clone(),
            readings: Vec::new(),
            acquired_at: 1,
        })
        .await
        .unwrap();
        tx.send(AcquisitionUnit {
            device: device.clone(),
            readings: vec![RawReading::new("A", TagValue::Int(5), Quality::GOOD)],
            acquired_at: 2,
        })
        .await
        .unwrap();

        let first = records.recv().await.unwrap().record;
        assert!(first.is_empty());
        assert_eq!(first.device_name, "dev");
        let second = records.recv().await.unwrap().record;
        assert_eq!(second.telemetry[0].ts, 2);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.messages_received(), 2);
        assert_eq!(metrics.messages_sent(), 2);
        assert_eq!(metrics.conversion_failures("dev"), 1);
    }

    #[tokio::test]
    async fn worker_exits_when_sender_dropped() {
        let (tx, rx) = mpsc::channel::<AcquisitionUnit>(1);
        let (sink, _records) = ChannelSink::new();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = ConversionWorker::new(
            "OPC-DA",
            "opcda",
            rx,
            Arc::new(sink),
            ConnectorMetrics::detached().unwrap(),
        );
        let task = tokio::spawn(worker.run(shutdown_rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
