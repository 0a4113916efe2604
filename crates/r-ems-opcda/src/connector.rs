//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connector assembly, poll loop and shutdown handle."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use r_ems_common::config::{ConnectorConfig, ServerConfig};
use r_ems_common::time::duration_to_millis;
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::acquisition::{acquire, AcquisitionUnit};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::converter::ConverterRegistry;
use crate::device::{build_strategy, Device};
use crate::error::ConnectorError;
use crate::guard::SessionGuard;
use crate::metrics::ConnectorMetrics;
use crate::rpc::{AttributeUpdate, AttributeWriteOutcome, PassThrough, RpcError, RpcReply, RpcRequest};
use crate::session::TagSession;
use crate::sink::RecordSink;
use crate::worker::ConversionWorker;

/// Assembles an [`OpcDaConnector`] from configuration and collaborators.
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    session: Box<dyn TagSession>,
    sink: Arc<dyn RecordSink>,
    metrics: Option<ConnectorMetrics>,
    registry: ConverterRegistry,
}

impl ConnectorBuilder {
    pub fn new(
        config: ConnectorConfig,
        session: Box<dyn TagSession>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            config,
            session,
            sink,
            metrics: None,
            registry: ConverterRegistry::default(),
        }
    }

    /// Record into `metrics` instead of a private registry.
    pub fn with_metrics(mut self, metrics: ConnectorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_converter_registry(mut self, registry: ConverterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Result<OpcDaConnector, ConnectorError> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ConnectorMetrics::detached()?,
        };

        let connector_strategy = match &self.config.report_strategy {
            Some(config) => match build_strategy(config) {
                Ok(strategy) => Some(strategy),
                Err(err) => {
                    error!(connector = %self.config.name, error = %err, "invalid connector report strategy, ignoring");
                    None
                }
            },
            None => None,
        };

        let mut devices = IndexMap::with_capacity(self.config.devices.len());
        for device_config in &self.config.devices {
            let device =
                Device::from_config(device_config, connector_strategy.clone(), &self.registry)?;
            debug!(
                connector = %self.config.name,
                device = %device.name(),
                tags = device.tags().len(),
                "device loaded"
            );
            devices.insert(device.name().to_owned(), Arc::new(device));
        }
        let devices = Arc::new(devices);

        let server = self.config.server.clone();
        let guard = Arc::new(SessionGuard::new(self.session, server.timeout));
        let connection = Arc::new(ConnectionManager::new(
            guard,
            server.name.clone(),
            server.host.clone(),
            metrics.clone(),
        ));
        let pass_through = PassThrough::new(
            devices.clone(),
            connection.clone(),
            &self.config.connector_type,
            metrics.clone(),
        );

        Ok(OpcDaConnector {
            name: self.config.name,
            id: self.config.id,
            server,
            devices,
            connection,
            pass_through,
            sink: self.sink,
            metrics,
        })
    }
}

/// Configured connector that has not been started yet.
pub struct OpcDaConnector {
    name: String,
    id: String,
    server: ServerConfig,
    devices: Arc<IndexMap<String, Arc<Device>>>,
    connection: Arc<ConnectionManager>,
    pass_through: PassThrough,
    sink: Arc<dyn RecordSink>,
    metrics: ConnectorMetrics,
}

impl OpcDaConnector {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    /// Spawn the poll loop and the conversion worker.
    pub fn start(self) -> ConnectorHandle {
        let (tx, rx) = mpsc::channel(self.server.queue_capacity);
        let (shutdown, _) = broadcast::channel(4);

        let worker = ConversionWorker::new(
            self.name.clone(),
            self.id.clone(),
            rx,
            self.sink.clone(),
            self.metrics.clone(),
        );
        let worker_task = tokio::spawn(worker.run(shutdown.subscribe()));

        let poll_loop = PollLoop {
            name: self.name.clone(),
            server: self.server.clone(),
            devices: self.devices.clone(),
            connection: self.connection.clone(),
            tx,
            metrics: self.metrics.clone(),
        };
        let poll_task = tokio::spawn(poll_loop.run(shutdown.subscribe()));

        info!(
            connector = %self.name,
            server = %self.server.name,
            host = %self.server.host,
            devices = self.devices.len(),
            "opc-da connector started"
        );

        ConnectorHandle {
            name: self.name,
            shutdown,
            poll_task,
            worker_task,
            stop_timeout: self.server.stop_timeout,
            devices: self.devices,
            connection: self.connection,
            pass_through: self.pass_through,
            metrics: self.metrics,
        }
    }
}

/// Point-in-time view of a running connector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub state: ConnectionState,
    pub devices: usize,
    pub poll_cycles: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Clone)]
pub struct StatusProbe {
    name: String,
    devices: usize,
    connection: Arc<ConnectionManager>,
    metrics: ConnectorMetrics,
}

impl StatusProbe {
    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            name: self.name.clone(),
            state: self.connection.state(),
            devices: self.devices,
            poll_cycles: self.metrics.poll_cycles(),
            messages_received: self.metrics.messages_received(),
            messages_sent: self.metrics.messages_sent(),
        }
    }
}

/// Handle to a running connector.
#[derive(Debug)]
pub struct ConnectorHandle {
    name: String,
    shutdown: broadcast::Sender<()>,
    poll_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
    stop_timeout: Duration,
    devices: Arc<IndexMap<String, Arc<Device>>>,
    connection: Arc<ConnectionManager>,
    pass_through: PassThrough,
    metrics: ConnectorMetrics,
}

impl ConnectorHandle {
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn metrics(&self) -> &ConnectorMetrics {
        &self.metrics
    }

    pub fn pass_through(&self) -> &PassThrough {
        &self.pass_through
    }

    pub async fn on_attributes_update(
        &self,
        update: &AttributeUpdate,
    ) -> Result<Vec<AttributeWriteOutcome>, RpcError> {
        self.pass_through.on_attributes_update(update).await
    }

    pub async fn handle_rpc(&self, request: &RpcRequest) -> RpcReply {
        self.pass_through.handle_rpc(request).await
    }

    pub fn status(&self) -> ConnectorStatus {
        self.status_probe().status()
    }

    /// Cloneable status source that outlives borrows of the handle.
    pub fn status_probe(&self) -> StatusProbe {
        StatusProbe {
            name: self.name.clone(),
            devices: self.devices.len(),
            connection: self.connection.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Signal stop and wait for both tasks up to the configured ceiling.
    ///
    /// Returns `false` when the tasks did not stop in time. The connector is
    /// marked stopped either way; a poll loop still inside a session call
    /// closes the session itself once that call returns.
    pub async fn shutdown(self) -> bool {
        let _ = self.shutdown.send(());
        let poll_task = self.poll_task;
        let worker_task = self.worker_task;
        let joined = tokio::time::timeout(self.stop_timeout, async move {
            if let Err(err) = poll_task.await {
                error!(error = %err, "poll loop join error");
            }
            if let Err(err) = worker_task.await {
                error!(error = %err, "conversion worker join error");
            }
        })
        .await;
        let stopped = joined.is_ok();
        if !stopped {
            error!(
                connector = %self.name,
                timeout_ms = duration_to_millis(self.stop_timeout),
                "connector tasks failed to stop in time"
            );
        }
        if tokio::time::timeout(self.stop_timeout, self.connection.stop())
            .await
            .is_err()
        {
            warn!(connector = %self.name, "session close did not finish in time");
        }
        info!(connector = %self.name, "opc-da connector stopped");
        stopped
    }
}

struct PollLoop {
    name: String,
    server: ServerConfig,
    devices: Arc<IndexMap<String, Arc<Device>>>,
    connection: Arc<ConnectionManager>,
    tx: mpsc::Sender<AcquisitionUnit>,
    metrics: ConnectorMetrics,
}

enum Flow {
    Continue,
    Stop,
}

impl PollLoop {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut next_poll = Instant::now();
        loop {
            if stop_requested(&mut shutdown) {
                break;
            }

            if !self.connection.is_connected() {
                self.connection.disconnect().await;
                match self.connection.connect().await {
                    Ok(()) => next_poll = Instant::now(),
                    Err(err) => {
                        warn!(
                            connector = %self.name,
                            error = %err,
                            retry_ms = duration_to_millis(self.server.reconnect_delay),
                            "connect failed, retrying"
                        );
                        if let Flow::Stop = pause(&mut shutdown, self.server.reconnect_delay).await
                        {
                            break;
                        }
                    }
                }
                continue;
            }

            let now = Instant::now();
            if now >= next_poll {
                next_poll = now + self.server.poll_period;
                if let Flow::Stop = self.poll_devices(&mut shutdown).await {
                    break;
                }
                self.metrics.inc_poll_cycle();
            } else {
                let idle = self.server.idle_tick.min(next_poll - now);
                if let Flow::Stop = pause(&mut shutdown, idle).await {
                    break;
                }
            }
        }
        self.connection.stop().await;
        debug!(connector = %self.name, "poll loop exited");
    }

    async fn poll_devices(&self, shutdown: &mut broadcast::Receiver<()>) -> Flow {
        for device in self.devices.values() {
            if !device.has_tags() {
                continue;
            }
            if !self.connection.is_connected() {
                break;
            }
            match acquire(self.connection.guard(), device).await {
                Ok(unit) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => return Flow::Stop,
                        sent = self.tx.send(unit) => {
                            if sent.is_err() {
                                error!(connector = %self.name, "conversion worker is gone");
                                return Flow::Stop;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(device = %device.name(), error = %err, "batched read failed, skipping device");
                    self.metrics.inc_read_failure(device.name());
                    self.connection.mark_lost(&err);
                }
            }
        }
        Flow::Continue
    }
}

fn stop_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

async fn pause(shutdown: &mut broadcast::Receiver<()>, duration: Duration) -> Flow {
    tokio::select! {
        _ = shutdown.recv() => Flow::Stop,
        _ = tokio::time::sleep(duration) => Flow::Continue,
    }
}

#[cfg(test)]
mod tests {
    use r_ems_common::config::{DeviceConfig, TagConfig};

    use super::*;
    use crate::session::{MemorySession, MemoryStore};
    use crate::sink::ChannelSink;

    fn config() -> ConnectorConfig {
        let mut device = DeviceConfig::new("dev", "default");
        device.timeseries.push(TagConfig::new("a", "A"));
        let mut config = ConnectorConfig::default();
        config.server.poll_period = Duration::from_millis(20);
        config.server.idle_tick = Duration::from_millis(5);
        config.server.reconnect_delay = Duration::from_millis(10);
        config.server.stop_timeout = Duration::from_secs(1);
        config.devices.push(device);
        config
    }

    #[test]
    fn unknown_converter_fails_the_build() {
        let mut config = config();
        config.devices[0].converter = Some("nope".into());
        let (sink, _rx) = ChannelSink::new();
        let result =
            ConnectorBuilder::new(config, Box::new(MemorySession::new()), Arc::new(sink)).build();
        assert!(matches!(result, Err(ConnectorError::UnknownConverter(_))));
    }

    #[test]
    fn custom_converters_come_from_the_registry() {
        let mut config = config();
        config.devices[0].converter = Some("site".into());
        let mut registry = ConverterRegistry::default();
        registry.register("site", || Arc::new(crate::converter::OpcDaUplinkConverter::new()));
        let (sink, _rx) = ChannelSink::new();
        let connector =
            ConnectorBuilder::new(config, Box::new(MemorySession::new()), Arc::new(sink))
                .with_converter_registry(registry)
                .build()
                .unwrap();
        assert_eq!(connector.devices().count(), 1);
    }

    #[tokio::test]
    async fn polls_and_stops() {
        let store = MemoryStore::default();
        store.set("A", 1_i64);
        let (sink, mut rx) = ChannelSink::new();
        let handle = ConnectorBuilder::new(
            config(),
            Box::new(MemorySession::with_store(store.clone())),
            Arc::new(sink),
        )
        .build()
        .unwrap()
        .start();

        let dispatched = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatched.connector_id, "opcda");
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert!(handle.status().messages_received >= 1);

        assert!(handle.shutdown().await);
        assert!(!store.is_connected());
    }
}
