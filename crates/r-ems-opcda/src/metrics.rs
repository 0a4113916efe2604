//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Prometheus instrumentation for the OPC-DA connector."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Shared registry type used across the connector and the daemon exporter.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Counters and gauges recorded by a running connector.
#[derive(Clone, Debug)]
pub struct ConnectorMetrics {
    registry: SharedRegistry,
    poll_cycles: IntCounter,
    read_failures: IntCounterVec,
    messages_received: IntCounter,
    messages_sent: IntCounter,
    conversion_failures: IntCounterVec,
    rpc_calls: IntCounterVec,
    connection_state: IntGauge,
}

impl ConnectorMetrics {
    pub fn new(registry: SharedRegistry) -> prometheus::Result<Self> {
        let poll_cycles = IntCounter::with_opts(Opts::new(
            "r_ems_opcda_poll_cycles_total",
            "Number of completed poll cycles",
        ))?;
        registry.register(Box::new(poll_cycles.clone()))?;

        let read_failures = IntCounterVec::new(
            Opts::new(
                "r_ems_opcda_read_failures_total",
                "Batched reads that failed, per device",
            ),
            &["device"],
        )?;
        registry.register(Box::new(read_failures.clone()))?;

        let messages_received = IntCounter::with_opts(Opts::new(
            "r_ems_opcda_messages_received_total",
            "Acquisition units handed to the conversion worker",
        ))?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_sent = IntCounter::with_opts(Opts::new(
            "r_ems_opcda_messages_sent_total",
            "Converted records accepted by the sink",
        ))?;
        registry.register(Box::new(messages_sent.clone()))?;

        let conversion_failures = IntCounterVec::new(
            Opts::new(
                "r_ems_opcda_conversion_failures_total",
                "Tag or record conversions that failed, per device",
            ),
            &["device"],
        )?;
        registry.register(Box::new(conversion_failures.clone()))?;

        let rpc_calls = IntCounterVec::new(
            Opts::new(
                "r_ems_opcda_rpc_calls_total",
                "RPC and attribute update calls by method and reply code",
            ),
            &["method", "code"],
        )?;
        registry.register(Box::new(rpc_calls.clone()))?;

        let connection_state = IntGauge::with_opts(Opts::new(
            "r_ems_opcda_connection_state",
            "0 disconnected, 1 connecting, 2 connected, 3 stopped",
        ))?;
        registry.register(Box::new(connection_state.clone()))?;

        Ok(Self {
            registry,
            poll_cycles,
            read_failures,
            messages_received,
            messages_sent,
            conversion_failures,
            rpc_calls,
            connection_state,
        })
    }

    /// Metrics bound to a private registry, for connectors nobody scrapes.
    pub fn detached() -> prometheus::Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_poll_cycle(&self) {
        self.poll_cycles.inc();
    }

    pub fn inc_read_failure(&self, device: &str) {
        self.read_failures.with_label_values(&[device]).inc();
    }

    pub fn inc_received(&self) {
        self.messages_received.inc();
    }

    pub fn inc_sent(&self) {
        self.messages_sent.inc();
    }

    pub fn add_conversion_failures(&self, device: &str, count: u64) {
        if count > 0 {
            self.conversion_failures
                .with_label_values(&[device])
                .inc_by(count);
        }
    }

    pub fn inc_rpc(&self, method: &str, code: u16) {
        self.rpc_calls
            .with_label_values(&[method, &code.to_string()])
            .inc();
    }

    pub fn set_connection_state(&self, value: i64) {
        self.connection_state.set(value);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.get()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.get()
    }

    pub fn poll_cycles(&self) -> u64 {
        self.poll_cycles.get()
    }

    pub fn read_failures(&self, device: &str) -> u64 {
        self.read_failures.with_label_values(&[device]).get()
    }

    pub fn conversion_failures(&self, device: &str) -> u64 {
        self.conversion_failures.with_label_values(&[device]).get()
    }

    pub fn rpc_calls(&self, method: &str, code: u16) -> u64 {
        self.rpc_calls
            .with_label_values(&[method, &code.to_string()])
            .get()
    }

    pub fn connection_state(&self) -> i64 {
        self.connection_state.get()
    }
}
