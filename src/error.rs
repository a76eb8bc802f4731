use std::io;

use thiserror::Error;

/// Errors produced by the tap.
///
/// Per-frame failures are absorbed by the pipeline and only show up in the
/// statistics; control operations hand these back to the caller.
#[derive(Error, Debug)]
pub enum TapError {
    /// The work-item pool of a device is empty.
    #[error("work-item pool exhausted on device {device}")]
    ResourceExhausted { device: String },

    /// Unknown device, chain, filter, rule or listener.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Malformed argument, unknown layer/subtype or unresolvable reference.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transmission to listener {listener} failed: {source}")]
    TransmissionFailure {
        listener: u32,
        #[source]
        source: io::Error,
    },

    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("tap table error: {0}")]
    Table(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TapError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        TapError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TapError::InvalidArgument(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TapError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, TapError>;
