//! Wire-level error types

use thiserror::Error;

/// Errors produced while walking a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// No SCSI-transparent Bulk-Only Transport interface in the configuration
    ///
    /// This is a classification result ("not a mass storage device"), not a
    /// transient failure.
    #[error("no mass storage bulk-only interface found")]
    NoMscInterface,

    /// The MSC interface does not carry one bulk IN and one bulk OUT endpoint
    #[error("mass storage interface {interface} has {found} usable bulk endpoint(s), need IN + OUT")]
    MissingEndpoints { interface: u8, found: usize },

    /// A descriptor header is inconsistent with the surrounding data
    #[error("malformed descriptor at offset {offset}")]
    Malformed { offset: usize },
}

/// Errors produced by the BOT and SCSI codecs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Command block empty or longer than the 16 bytes a CBW can carry
    #[error("invalid command block length {len} (must be 1-16)")]
    BadCommandLength { len: usize },

    /// Buffer shorter than the structure being decoded
    #[error("short response: needed {needed} bytes, got {actual}")]
    ShortResponse { needed: usize, actual: usize },

    /// Command Status Wrapper did not start with 'USBS'
    #[error("invalid CSW signature {0:#010x}")]
    BadSignature(u32),

    /// Command Status Wrapper answered a different command
    #[error("CSW tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: u32, actual: u32 },

    /// Reserved status value in the Command Status Wrapper
    #[error("invalid CSW status {0:#04x}")]
    BadStatus(u8),

    /// READ CAPACITY(10) returned the last LBA 0xFFFFFFFF
    #[error("capacity exceeds the READ CAPACITY(10) range")]
    CapacityOverflow,
}

/// Type alias for codec results
pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_endpoints_display() {
        let err = DescriptorError::MissingEndpoints {
            interface: 3,
            found: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("interface 3"));
        assert!(msg.contains("1 usable"));
    }

    #[test]
    fn test_tag_mismatch_display() {
        let err = ProtoError::TagMismatch {
            expected: 7,
            actual: 9,
        };
        assert_eq!(err.to_string(), "CSW tag mismatch: expected 7, got 9");
    }
}
