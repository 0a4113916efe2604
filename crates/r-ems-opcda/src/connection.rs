//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connection lifecycle of the tag session."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::guard::SessionGuard;
use crate::metrics::ConnectorMetrics;

/// Lifecycle state of the session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

impl ConnectionState {
    pub fn gauge_value(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Stopped => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Drives connect, disconnect and loss detection for one session.
///
/// There is no heartbeat: loss is reported by whoever sees a failed read or
/// write through [`ConnectionManager::mark_lost`].
#[derive(Debug)]
pub struct ConnectionManager {
    guard: Arc<SessionGuard>,
    server: String,
    host: String,
    state: Mutex<ConnectionState>,
    metrics: ConnectorMetrics,
}

impl ConnectionManager {
    pub fn new(
        guard: Arc<SessionGuard>,
        server: impl Into<String>,
        host: impl Into<String>,
        metrics: ConnectorMetrics,
    ) -> Self {
        metrics.set_connection_state(ConnectionState::Disconnected.gauge_value());
        Self {
            guard,
            server: server.into(),
            host: host.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            metrics,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    /// Move to `next` unless already stopped. Returns whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Stopped || *state == next {
            return false;
        }
        let previous = *state;
        *state = next;
        debug!(from = %previous, to = %next, "connection state change");
        self.metrics.set_connection_state(next.gauge_value());
        true
    }

    /// Open the session. On success the server info is probed and logged;
    /// probe failures do not affect the outcome.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Stopped {
            return Err(SessionError::Other("connector is stopped".into()));
        }
        self.transition(ConnectionState::Connecting);
        info!(server = %self.server, host = %self.host, "connecting to opc-da server");
        match self.guard.connect(&self.server, &self.host).await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                info!(server = %self.server, "connected to opc-da server");
                match self.guard.info().await {
                    Ok(details) => {
                        for (key, value) in details {
                            debug!(server = %self.server, %key, %value, "server info");
                        }
                    }
                    Err(err) => {
                        warn!(server = %self.server, error = %err, "server info probe failed")
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Close the session. Safe to call any number of times; errors are logged.
    pub async fn disconnect(&self) {
        if let Err(err) = self.guard.close().await {
            debug!(server = %self.server, error = %err, "close failed, ignoring");
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Record a failed call. Session-level failures send the state back to
    /// `Disconnected` so the run loop reconnects.
    pub fn mark_lost(&self, error: &SessionError) -> bool {
        if !error.is_session_lost() {
            return false;
        }
        let changed = self.transition(ConnectionState::Disconnected);
        if changed {
            warn!(server = %self.server, error = %error, "opc-da session lost");
        }
        changed
    }

    /// Enter the terminal state and close the session.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            *state = ConnectionState::Stopped;
        }
        self.metrics
            .set_connection_state(ConnectionState::Stopped.gauge_value());
        if let Err(err) = self.guard.close().await {
            debug!(server = %self.server, error = %err, "close on stop failed");
        }
    }
}
