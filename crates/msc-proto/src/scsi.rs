//! SCSI command blocks and response parsing
//!
//! Only the commands a Bulk-Only host needs to bring a unit up: INQUIRY,
//! TEST UNIT READY, REQUEST SENSE and READ CAPACITY(10).

use crate::error::{ProtoError, Result};
use byteorder::{BigEndian, ByteOrder};

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const READ_CAPACITY_10: u8 = 0x25;

/// Standard INQUIRY allocation length
pub const INQUIRY_LEN: usize = 36;
/// Fixed-format sense data length
pub const SENSE_LEN: usize = 18;
/// READ CAPACITY(10) parameter data length
pub const READ_CAPACITY_10_LEN: usize = 8;

/// SCSI sense key (byte 2, low nibble, of fixed-format sense data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    VolumeOverflow,
    Miscompare,
    Reserved(u8),
}

impl SenseKey {
    pub fn from_nibble(key: u8) -> Self {
        match key & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xa => SenseKey::CopyAborted,
            0xb => SenseKey::AbortedCommand,
            0xd => SenseKey::VolumeOverflow,
            0xe => SenseKey::Miscompare,
            other => SenseKey::Reserved(other),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            SenseKey::NoSense => 0x0,
            SenseKey::RecoveredError => 0x1,
            SenseKey::NotReady => 0x2,
            SenseKey::MediumError => 0x3,
            SenseKey::HardwareError => 0x4,
            SenseKey::IllegalRequest => 0x5,
            SenseKey::UnitAttention => 0x6,
            SenseKey::DataProtect => 0x7,
            SenseKey::BlankCheck => 0x8,
            SenseKey::VendorSpecific => 0x9,
            SenseKey::CopyAborted => 0xa,
            SenseKey::AbortedCommand => 0xb,
            SenseKey::VolumeOverflow => 0xd,
            SenseKey::Miscompare => 0xe,
            SenseKey::Reserved(k) => k & 0x0f,
        }
    }

    /// Keys for which a unit that failed TEST UNIT READY may still come up
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SenseKey::NotReady | SenseKey::UnitAttention | SenseKey::NoSense
        )
    }
}

/// Decoded fixed-format sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: SenseKey,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl SenseData {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, 14)?;
        Ok(Self {
            key: SenseKey::from_nibble(buf[2]),
            asc: buf[12],
            ascq: buf[13],
        })
    }

    /// Encode as 18 bytes of fixed-format, current-error sense data
    pub fn to_bytes(&self) -> [u8; SENSE_LEN] {
        let mut buf = [0u8; SENSE_LEN];
        buf[0] = 0x70;
        buf[2] = self.key.to_nibble();
        buf[7] = (SENSE_LEN - 8) as u8;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

/// Standard INQUIRY data, identification fields only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    /// Peripheral device type (0 = direct access block device)
    pub device_type: u8,
    /// Removable medium bit
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryData {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, INQUIRY_LEN)?;
        Ok(Self {
            device_type: buf[0] & 0x1f,
            removable: buf[1] & 0x80 != 0,
            vendor: ascii_field(&buf[8..16]),
            product: ascii_field(&buf[16..32]),
            revision: ascii_field(&buf[32..36]),
        })
    }
}

/// READ CAPACITY(10) parameter data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Logical block length in bytes
    pub block_size: u32,
    /// Number of blocks (last LBA + 1)
    pub block_count: u32,
}

impl Capacity {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, READ_CAPACITY_10_LEN)?;
        let last_lba = BigEndian::read_u32(&buf[0..4]);
        let block_count = last_lba
            .checked_add(1)
            .ok_or(ProtoError::CapacityOverflow)?;
        Ok(Self {
            block_count,
            block_size: BigEndian::read_u32(&buf[4..8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; READ_CAPACITY_10_LEN] {
        let mut buf = [0u8; READ_CAPACITY_10_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.block_count.wrapping_sub(1));
        BigEndian::write_u32(&mut buf[4..8], self.block_size);
        buf
    }
}

pub fn inquiry_cdb() -> [u8; 6] {
    [INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0]
}

pub fn test_unit_ready_cdb() -> [u8; 6] {
    [TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn request_sense_cdb() -> [u8; 6] {
    [REQUEST_SENSE, 0, 0, 0, SENSE_LEN as u8, 0]
}

pub fn read_capacity_10_cdb() -> [u8; 10] {
    [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtoError::ShortResponse {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect::<String>()
        .trim_end()
        .to_string()
}
