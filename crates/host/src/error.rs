//! Driver error types

use msc_proto::bot::CswStatus;
use msc_proto::{DescriptorError, ProtoError};
use thiserror::Error;

/// Errors reported by a host library implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("out of memory")]
    NoMemory,

    #[error("not found")]
    NotFound,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid state")]
    InvalidState,

    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors returned by every driver entry point
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MscError {
    /// Unknown handle or rejected configuration field
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation attempted in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The device does not describe a compatible Bulk-Only interface
    #[error("device not supported: {0}")]
    NotSupported(#[from] DescriptorError),

    /// Requested length does not fit the transfer buffer
    #[error("transfer of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    InvalidSize { requested: usize, capacity: usize },

    #[error("out of memory")]
    NoMemory,

    /// The endpoint reported a stall condition
    #[error("endpoint {endpoint:#04x} stalled")]
    Stall { endpoint: u8 },

    /// Transport failure or unexpected device behaviour
    #[error("internal error: {0}")]
    Internal(String),

    /// The transfer did not complete in time and was flushed
    #[error("transfer on endpoint {endpoint:#04x} timed out")]
    Timeout { endpoint: u8 },

    /// The device reported a failed SCSI command in its status wrapper
    #[error("SCSI command {opcode:#04x} failed: {status:?}")]
    CommandFailed { opcode: u8, status: CswStatus },

    /// Host library error not otherwise classified
    #[error("host library error: {0}")]
    Host(#[source] HostError),
}

impl MscError {
    /// Whether this error belongs to the internal (transport) class
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            MscError::Internal(_)
                | MscError::Timeout { .. }
                | MscError::CommandFailed { .. }
                | MscError::Host(_)
        )
    }
}

impl From<HostError> for MscError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NoMemory => MscError::NoMemory,
            other => MscError::Host(other),
        }
    }
}

impl From<ProtoError> for MscError {
    fn from(err: ProtoError) -> Self {
        MscError::Internal(err.to_string())
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, MscError>;
