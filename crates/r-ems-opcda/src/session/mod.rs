//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tag session contract and bundled implementations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use r_ems_common::config::SessionKind;

use crate::error::SessionError;
use crate::value::{RawReading, TagValue};

pub mod memory;
pub mod simulated;

pub use memory::{MemorySession, MemoryStore, SessionCalls};
pub use simulated::SimulatedSession;

/// Contract implemented by clients of a tag-addressed data source.
///
/// Implementations are only required to be `Send`: every call is serialized by
/// [`crate::guard::SessionGuard`], so no internal synchronization is assumed.
#[async_trait]
pub trait TagSession: Send {
    /// Open a session against `server` running on `host`.
    async fn connect(&mut self, server: &str, host: &str) -> Result<(), SessionError>;

    /// Close the session. Closing an already closed session succeeds.
    async fn close(&mut self) -> Result<(), SessionError>;

    /// Read all `paths` in one call. The reply preserves request order.
    async fn read(
        &mut self,
        paths: &[String],
        timeout: Duration,
    ) -> Result<Vec<RawReading>, SessionError>;

    /// Write a single value.
    async fn write(
        &mut self,
        path: &str,
        value: &TagValue,
        timeout: Duration,
    ) -> Result<(), SessionError>;

    /// Diagnostic key/value pairs describing the server.
    async fn info(&mut self) -> Result<Vec<(String, String)>, SessionError>;
}

/// Build the session implementation selected in configuration.
pub fn from_kind(kind: SessionKind) -> Box<dyn TagSession> {
    match kind {
        SessionKind::Simulated => Box::new(SimulatedSession::new()),
        SessionKind::Memory => Box::new(MemorySession::new()),
    }
}
