//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sinks receiving converted device records."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::converter::ConvertedRecord;

/// Destination of converted records, typically the host's message router.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(
        &self,
        connector_name: &str,
        connector_id: &str,
        record: ConvertedRecord,
    ) -> anyhow::Result<()>;
}

/// Record together with the connector that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedRecord {
    pub connector_name: String,
    pub connector_id: String,
    pub record: ConvertedRecord,
}

/// Forwards records into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DispatchedRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchedRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn send(
        &self,
        connector_name: &str,
        connector_id: &str,
        record: ConvertedRecord,
    ) -> anyhow::Result<()> {
        self.tx
            .send(DispatchedRecord {
                connector_name: connector_name.to_owned(),
                connector_id: connector_id.to_owned(),
                record,
            })
            .map_err(|_| anyhow::anyhow!("record receiver dropped"))
    }
}

/// Logs every record as JSON at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl RecordSink for TracingSink {
    async fn send(
        &self,
        connector_name: &str,
        connector_id: &str,
        record: ConvertedRecord,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&record)?;
        info!(
            connector = connector_name,
            connector_id,
            device = %record.device_name,
            record = %payload,
            "record dispatched"
        );
        Ok(())
    }
}
