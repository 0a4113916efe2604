//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single serialization point around the live tag session."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::SessionError;
use crate::session::TagSession;
use crate::value::{RawReading, TagValue};

/// Owns the session and serializes every call into it.
///
/// Polling, RPC reads and RPC writes all go through here. The call timeout is
/// forwarded to the session; the guard does not cancel calls that ignore it.
pub struct SessionGuard {
    session: Mutex<Box<dyn TagSession>>,
    timeout: Duration,
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SessionGuard {
    pub fn new(session: Box<dyn TagSession>, timeout: Duration) -> Self {
        Self {
            session: Mutex::new(session),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn connect(&self, server: &str, host: &str) -> Result<(), SessionError> {
        self.session.lock().await.connect(server, host).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.session.lock().await.close().await
    }

    /// One batched read across `paths`.
    pub async fn read(&self, paths: &[String]) -> Result<Vec<RawReading>, SessionError> {
        let mut session = self.session.lock().await;
        trace!(tags = paths.len(), "batched read");
        session.read(paths, self.timeout).await
    }

    /// Read a single tag and return its reading.
    pub async fn read_one(&self, path: &str) -> Result<RawReading, SessionError> {
        let paths = [path.to_owned()];
        let readings = self.read(&paths).await?;
        readings
            .into_iter()
            .find(|reading| reading.tag_path == path)
            .ok_or_else(|| SessionError::Other(format!("no reading returned for {path}")))
    }

    pub async fn write(&self, path: &str, value: &TagValue) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        trace!(tag = path, "write");
        session.write(path, value, self.timeout).await
    }

    pub async fn info(&self) -> Result<Vec<(String, String)>, SessionError> {
        self.session.lock().await.info().await
    }
}
