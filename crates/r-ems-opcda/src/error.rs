//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for the OPC-DA connector stages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Failure reported by a tag session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("connection to {server} on {host} failed: {reason}")]
    ConnectFailed {
        server: String,
        host: String,
        reason: String,
    },
    #[error("session lost: {0}")]
    Lost(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("tag {tag} rejected the request: {reason}")]
    Rejected { tag: String, reason: String },
    #[error("{0}")]
    Other(String),
}

impl SessionError {
    /// Whether the live session should be considered gone.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected | SessionError::Lost(_) | SessionError::Timeout(_)
        )
    }
}

/// Errors surfaced by device loading and the conversion stage.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no converter registered under `{0}`")]
    UnknownConverter(String),
    #[error("device `{device}` is invalid: {reason}")]
    InvalidDevice { device: String, reason: String },
    #[error("reply for device `{device}` carries no reading for tag `{tag}`")]
    MissingReading { device: String, tag: String },
    #[error("conversion of device `{device}` failed: {reason}")]
    Conversion { device: String, reason: String },
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}
