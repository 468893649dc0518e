//! Bulk-Only Transport wrappers
//!
//! Every SCSI command travels as a 31-byte Command Block Wrapper on the bulk
//! OUT endpoint, an optional data stage, and a 13-byte Command Status
//! Wrapper on the bulk IN endpoint. All multi-byte fields are little-endian.

use crate::error::{ProtoError, Result};
use crate::types::Direction;
use byteorder::{ByteOrder, LittleEndian};

/// 'USBC'
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// 'USBS'
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Encoded CBW length
pub const CBW_LEN: usize = 31;
/// Encoded CSW length
pub const CSW_LEN: usize = 13;

/// Class-specific request: Bulk-Only Mass Storage Reset
pub const REQUEST_BULK_ONLY_RESET: u8 = 0xff;
/// Class-specific request: Get Max LUN
pub const REQUEST_GET_MAX_LUN: u8 = 0xfe;

/// Command Block Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    /// Echoed back in the matching CSW
    pub tag: u32,
    /// Bytes the host expects to move in the data stage
    pub data_transfer_length: u32,
    /// Data stage direction (ignored when the length is zero)
    pub direction: Direction,
    /// Logical unit (low 4 bits)
    pub lun: u8,
    cb_len: u8,
    cb: [u8; 16],
}

impl CommandBlockWrapper {
    /// Wrap a SCSI command block
    pub fn new(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        command: &[u8],
    ) -> Result<Self> {
        if command.is_empty() || command.len() > 16 {
            return Err(ProtoError::BadCommandLength { len: command.len() });
        }

        let mut cb = [0u8; 16];
        cb[..command.len()].copy_from_slice(command);

        Ok(Self {
            tag,
            data_transfer_length,
            direction,
            lun: lun & 0x0f,
            cb_len: command.len() as u8,
            cb,
        })
    }

    /// The wrapped command block
    pub fn command(&self) -> &[u8] {
        &self.cb[..self.cb_len as usize]
    }

    /// Serialize into exactly 31 bytes
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut buf = [0u8; CBW_LEN];
        LittleEndian::write_u32(&mut buf[0..4], CBW_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], self.tag);
        LittleEndian::write_u32(&mut buf[8..12], self.data_transfer_length);
        buf[12] = match self.direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        buf[13] = self.lun;
        buf[14] = self.cb_len;
        buf[15..31].copy_from_slice(&self.cb);
        buf
    }

    /// Parse a CBW, as a device would
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < CBW_LEN {
            return Err(ProtoError::ShortResponse {
                needed: CBW_LEN,
                actual: buf.len(),
            });
        }

        let signature = LittleEndian::read_u32(&buf[0..4]);
        if signature != CBW_SIGNATURE {
            return Err(ProtoError::BadSignature(signature));
        }

        let cb_len = buf[14] as usize;
        if cb_len == 0 || cb_len > 16 {
            return Err(ProtoError::BadCommandLength { len: cb_len });
        }

        Self::new(
            LittleEndian::read_u32(&buf[4..8]),
            LittleEndian::read_u32(&buf[8..12]),
            Direction::of_endpoint(buf[12]),
            buf[13],
            &buf[15..15 + cb_len],
        )
    }
}

/// bCSWStatus values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    /// Command passed
    Passed,
    /// Command failed; REQUEST SENSE tells why
    Failed,
    /// Phase error; the device needs a reset recovery
    PhaseError,
}

impl CswStatus {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x00 => Ok(CswStatus::Passed),
            0x01 => Ok(CswStatus::Failed),
            0x02 => Ok(CswStatus::PhaseError),
            other => Err(ProtoError::BadStatus(other)),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            CswStatus::Passed => 0x00,
            CswStatus::Failed => 0x01,
            CswStatus::PhaseError => 0x02,
        }
    }
}

/// Command Status Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// Tag of the CBW this answers
    pub tag: u32,
    /// Difference between expected and processed data stage bytes
    pub data_residue: u32,
    /// Command outcome
    pub status: CswStatus,
}

impl CommandStatusWrapper {
    /// Decode and check a CSW against the tag of the command it answers
    pub fn parse(buf: &[u8], expected_tag: u32) -> Result<Self> {
        if buf.len() < CSW_LEN {
            return Err(ProtoError::ShortResponse {
                needed: CSW_LEN,
                actual: buf.len(),
            });
        }

        let signature = LittleEndian::read_u32(&buf[0..4]);
        if signature != CSW_SIGNATURE {
            return Err(ProtoError::BadSignature(signature));
        }

        let tag = LittleEndian::read_u32(&buf[4..8]);
        if tag != expected_tag {
            return Err(ProtoError::TagMismatch {
                expected: expected_tag,
                actual: tag,
            });
        }

        Ok(Self {
            tag,
            data_residue: LittleEndian::read_u32(&buf[8..12]),
            status: CswStatus::from_byte(buf[12])?,
        })
    }

    /// Serialize into exactly 13 bytes, as a device would
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut buf = [0u8; CSW_LEN];
        LittleEndian::write_u32(&mut buf[0..4], CSW_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], self.tag);
        LittleEndian::write_u32(&mut buf[8..12], self.data_residue);
        buf[12] = self.status.to_byte();
        buf
    }
}
