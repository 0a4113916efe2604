//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Polling OPC-DA connector library."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Polling connector bridging a tag-addressed OPC-DA source to a record sink.
//!
//! A poll loop reads every device in one batched call per cycle and hands the
//! readings to a conversion worker over a bounded channel. Attribute updates
//! and RPC calls go straight to the session through the same
//! [`guard::SessionGuard`].

pub mod acquisition;
pub mod connection;
pub mod connector;
pub mod converter;
pub mod device;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod rpc;
pub mod session;
pub mod sink;
pub mod strategy;
pub mod value;
pub mod worker;

pub use acquisition::AcquisitionUnit;
pub use connection::{ConnectionManager, ConnectionState};
pub use connector::{
    ConnectorBuilder, ConnectorHandle, ConnectorStatus, OpcDaConnector, StatusProbe,
};
pub use converter::{
    Conversion, ConvertedRecord, ConverterRegistry, OpcDaUplinkConverter, TelemetryEntry,
    UplinkConverter,
};
pub use device::{Device, Section, Tag};
pub use error::{ConnectorError, SessionError};
pub use metrics::{new_registry, ConnectorMetrics, SharedRegistry};
pub use rpc::{AttributeUpdate, AttributeWriteOutcome, RpcData, RpcError, RpcReply, RpcRequest};
pub use session::{MemorySession, MemoryStore, SimulatedSession, TagSession};
pub use sink::{ChannelSink, DispatchedRecord, RecordSink, TracingSink};
pub use strategy::{ConfiguredReportStrategy, ReportStrategy, StrategyError};
pub use value::{Quality, RawReading, SourceTimestamp, TagValue};
