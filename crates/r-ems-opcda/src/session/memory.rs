//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Deterministic in-memory tag session."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::TagSession;
use crate::error::SessionError;
use crate::value::{Quality, RawReading, SourceTimestamp, TagValue};

#[derive(Debug, Clone)]
struct StoredTag {
    value: TagValue,
    quality: Quality,
    timestamp: Option<SourceTimestamp>,
}

/// Number of calls that reached the session, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCalls {
    pub connect: usize,
    pub close: usize,
    pub read: usize,
    pub write: usize,
    pub info: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    tags: HashMap<String, StoredTag>,
    connected: Option<(String, String)>,
    calls: SessionCalls,
    failing_connects: usize,
    read_failures: VecDeque<SessionError>,
    write_failures: VecDeque<SessionError>,
    info_failure: Option<SessionError>,
    reverse_replies: bool,
    read_delay: Option<Duration>,
    rejected_paths: HashSet<String>,
    omitted_paths: HashSet<String>,
}

/// Shared handle to the state behind a [`MemorySession`].
///
/// The session itself is moved into the connector; tests keep a store handle to
/// seed tags, script failures and inspect the calls that were made.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    /// Seed a tag with a good-quality value.
    pub fn set(&self, path: impl Into<String>, value: impl Into<TagValue>) {
        self.set_reading(path, value.into(), Quality::GOOD, None);
    }

    pub fn set_reading(
        &self,
        path: impl Into<String>,
        value: TagValue,
        quality: Quality,
        timestamp: Option<SourceTimestamp>,
    ) {
        self.inner.lock().tags.insert(
            path.into(),
            StoredTag {
                value,
                quality,
                timestamp,
            },
        );
    }

    pub fn value(&self, path: &str) -> Option<TagValue> {
        self.inner.lock().tags.get(path).map(|tag| tag.value.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected.is_some()
    }

    pub fn calls(&self) -> SessionCalls {
        self.inner.lock().calls
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.inner.lock().failing_connects = count;
    }

    /// Queue an error returned by the next read call.
    pub fn fail_next_read(&self, error: SessionError) {
        self.inner.lock().read_failures.push_back(error);
    }

    /// Queue an error returned by the next write call.
    pub fn fail_next_write(&self, error: SessionError) {
        self.inner.lock().write_failures.push_back(error);
    }

    pub fn fail_info(&self, error: SessionError) {
        self.inner.lock().info_failure = Some(error);
    }

    /// Return batched replies in reverse order.
    pub fn reverse_replies(&self, enabled: bool) {
        self.inner.lock().reverse_replies = enabled;
    }

    /// Fail every batched read that includes `path` with a rejection. The
    /// session stays connected.
    pub fn reject_reads_of(&self, path: impl Into<String>) {
        self.inner.lock().rejected_paths.insert(path.into());
    }

    /// Leave `path` out of batched replies.
    pub fn omit_from_replies(&self, path: impl Into<String>) {
        self.inner.lock().omitted_paths.insert(path.into());
    }

    /// Delay every read, emulating a slow server.
    pub fn delay_reads(&self, delay: Duration) {
        self.inner.lock().read_delay = Some(delay);
    }

    /// Simulate the server dropping the session.
    pub fn drop_connection(&self) {
        self.inner.lock().connected = None;
    }
}

/// Tag session backed by a [`MemoryStore`]. Unknown tags read as BAD quality.
#[derive(Debug, Default)]
pub struct MemorySession {
    store: MemoryStore,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }
}

#[async_trait]
impl TagSession for MemorySession {
    async fn connect(&mut self, server: &str, host: &str) -> Result<(), SessionError> {
        let mut inner = self.store.inner.lock();
        inner.calls.connect += 1;
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(SessionError::ConnectFailed {
                server: server.to_owned(),
                host: host.to_owned(),
                reason: "server unavailable".into(),
            });
        }
        if inner.connected.is_some() {
            return Err(SessionError::Other("already connected".into()));
        }
        inner.connected = Some((server.to_owned(), host.to_owned()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let mut inner = self.store.inner.lock();
        inner.calls.close += 1;
        inner.connected = None;
        Ok(())
    }

    async fn read(
        &mut self,
        paths: &[String],
        _timeout: Duration,
    ) -> Result<Vec<RawReading>, SessionError> {
        let delay = self.store.inner.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.store.inner.lock();
        inner.calls.read += 1;
        if let Some(error) = inner.read_failures.pop_front() {
            return Err(error);
        }
        if inner.connected.is_none() {
            return Err(SessionError::NotConnected);
        }
        if let Some(path) = paths.iter().find(|path| inner.rejected_paths.contains(*path)) {
            return Err(SessionError::Rejected {
                tag: path.clone(),
                reason: "access denied".into(),
            });
        }
        let mut readings: Vec<RawReading> = paths
            .iter()
            .filter(|path| !inner.omitted_paths.contains(*path))
            .map(|path| match inner.tags.get(path) {
                Some(tag) => RawReading {
                    tag_path: path.clone(),
                    value: tag.value.clone(),
                    quality: tag.quality,
                    timestamp: tag.timestamp.clone(),
                },
                None => RawReading::new(path.clone(), TagValue::Null, Quality::BAD),
            })
            .collect();
        if inner.reverse_replies {
            readings.reverse();
        }
        Ok(readings)
    }

    async fn write(
        &mut self,
        path: &str,
        value: &TagValue,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        let mut inner = self.store.inner.lock();
        inner.calls.write += 1;
        if let Some(error) = inner.write_failures.pop_front() {
            return Err(error);
        }
        if inner.connected.is_none() {
            return Err(SessionError::NotConnected);
        }
        inner.tags.insert(
            path.to_owned(),
            StoredTag {
                value: value.clone(),
                quality: Quality::GOOD,
                timestamp: None,
            },
        );
        Ok(())
    }

    async fn info(&mut self) -> Result<Vec<(String, String)>, SessionError> {
        let mut inner = self.store.inner.lock();
        inner.calls.info += 1;
        if let Some(error) = inner.info_failure.clone() {
            return Err(error);
        }
        let Some((server, host)) = inner.connected.clone() else {
            return Err(SessionError::NotConnected);
        };
        Ok(vec![
            ("Server Name".into(), server),
            ("Host".into(), host),
            ("Vendor".into(), "R-EMS in-memory session".into()),
            ("Tags".into(), inner.tags.len().to_string()),
        ])
    }
}
