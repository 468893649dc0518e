//! Configuration descriptor walking
//!
//! Pure functions over a raw USB configuration descriptor (the configuration
//! header followed by its interface, endpoint and class-specific
//! descriptors). Nothing here performs I/O.
//!
//! The walk honours `wTotalLength`, clamped to the bytes actually present,
//! and stops at the first header that cannot be valid (`bLength < 2` or a
//! length running past the end of the data).

use crate::error::DescriptorError;
use crate::types::{DeviceDescriptor, Direction, MscConfig};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Write;

/// bDescriptorType: device
pub const DT_DEVICE: u8 = 0x01;
/// bDescriptorType: configuration
pub const DT_CONFIGURATION: u8 = 0x02;
/// bDescriptorType: string
pub const DT_STRING: u8 = 0x03;
/// bDescriptorType: interface
pub const DT_INTERFACE: u8 = 0x04;
/// bDescriptorType: endpoint
pub const DT_ENDPOINT: u8 = 0x05;

/// bInterfaceClass for mass storage
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;
/// bInterfaceSubClass: SCSI transparent command set
pub const SCSI_COMMAND_SET: u8 = 0x06;
/// bInterfaceProtocol: Bulk-Only Transport
pub const BULK_ONLY_TRANSPORT: u8 = 0x50;

/// bmAttributes transfer type mask and the bulk value
const EP_TRANSFER_TYPE_MASK: u8 = 0x03;
const EP_TRANSFER_TYPE_BULK: u8 = 0x02;

/// wMaxPacketSize bits 10..0 carry the packet size
const EP_MPS_MASK: u16 = 0x07ff;

const INTERFACE_DESC_LEN: usize = 9;
const ENDPOINT_DESC_LEN: usize = 7;

/// Capacity of the fixed text fields in device info, terminator included
pub const MSC_STR_DESC_SIZE: usize = 16;

/// A located SCSI / Bulk-Only interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MscInterface {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alt_setting: u8,
    /// Byte offset of the interface descriptor inside the configuration
    pub offset: usize,
}

/// One descriptor inside a configuration
#[derive(Debug, Clone, Copy)]
struct RawDescriptor<'a> {
    offset: usize,
    kind: u8,
    bytes: &'a [u8],
}

/// Iterator over the descriptors of a configuration, starting at `offset`
struct Descriptors<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Descriptors<'a> {
    fn new(config: &'a [u8], offset: usize) -> Self {
        Self {
            data: &config[..total_length(config)],
            offset,
        }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = RawDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.get(self.offset..)?;
        if remaining.len() < 2 {
            return None;
        }

        let len = remaining[0] as usize;
        if len < 2 || len > remaining.len() {
            return None;
        }

        let desc = RawDescriptor {
            offset: self.offset,
            kind: remaining[1],
            bytes: &remaining[..len],
        };
        self.offset += len;
        Some(desc)
    }
}

/// Declared total length of a configuration, clamped to the data present
fn total_length(config: &[u8]) -> usize {
    if config.len() >= 4 && config[1] == DT_CONFIGURATION {
        (LittleEndian::read_u16(&config[2..4]) as usize).min(config.len())
    } else {
        config.len()
    }
}

/// Find the first SCSI-transparent Bulk-Only interface, in declared order
///
/// `None` is a definitive classification: the configuration does not
/// describe a mass storage device this driver can serve.
pub fn find_msc_interface(config: &[u8]) -> Option<MscInterface> {
    Descriptors::new(config, 0)
        .filter(|d| d.kind == DT_INTERFACE && d.bytes.len() >= INTERFACE_DESC_LEN)
        .find(|d| {
            d.bytes[5] == USB_CLASS_MASS_STORAGE
                && d.bytes[6] == SCSI_COMMAND_SET
                && d.bytes[7] == BULK_ONLY_TRANSPORT
        })
        .map(|d| MscInterface {
            number: d.bytes[2],
            alt_setting: d.bytes[3],
            offset: d.offset,
        })
}

/// Extract interface number and bulk endpoints of the MSC interface
///
/// Scans the endpoint descriptors that follow the interface descriptor up to
/// the next interface boundary, skipping class-specific descriptors and
/// non-bulk endpoints. Each bulk endpoint is classified by its direction
/// bit; the IN endpoint also yields its max packet size.
pub fn extract_configuration(config: &[u8]) -> Result<MscConfig, DescriptorError> {
    let iface = find_msc_interface(config).ok_or(DescriptorError::NoMscInterface)?;

    let mut cfg = MscConfig {
        iface_num: iface.number,
        alt_setting: iface.alt_setting,
        ..MscConfig::default()
    };
    let mut bulk_in = false;
    let mut bulk_out = false;
    let mut found = 0;

    // Skip the interface descriptor itself
    for desc in Descriptors::new(config, iface.offset).skip(1) {
        match desc.kind {
            DT_INTERFACE => break,
            DT_ENDPOINT => {
                if desc.bytes.len() < ENDPOINT_DESC_LEN {
                    return Err(DescriptorError::Malformed {
                        offset: desc.offset,
                    });
                }
                if desc.bytes[3] & EP_TRANSFER_TYPE_MASK != EP_TRANSFER_TYPE_BULK {
                    continue;
                }

                let address = desc.bytes[2];
                match Direction::of_endpoint(address) {
                    Direction::In if !bulk_in => {
                        cfg.bulk_in_ep = address;
                        cfg.bulk_in_mps = LittleEndian::read_u16(&desc.bytes[4..6]) & EP_MPS_MASK;
                        bulk_in = true;
                    }
                    Direction::Out if !bulk_out => {
                        cfg.bulk_out_ep = address;
                        bulk_out = true;
                    }
                    _ => {}
                }

                found += 1;
                if found == 2 {
                    break;
                }
            }
            _ => {}
        }
    }

    if bulk_in && bulk_out {
        Ok(cfg)
    } else {
        Err(DescriptorError::MissingEndpoints {
            interface: iface.number,
            found,
        })
    }
}

/// Round a bulk IN length up to a whole number of max-size packets
pub fn round_up_to_mps(len: usize, mps: u16) -> usize {
    let mps = mps as usize;
    if mps == 0 {
        return len;
    }
    len.div_ceil(mps) * mps
}

/// Decode a USB string descriptor into at most `max_chars` code units
///
/// The character count comes from `bLength`, not from the buffer size. Code
/// units that do not form valid UTF-16 decode to U+FFFD.
pub fn decode_string_descriptor(desc: &[u8], max_chars: usize) -> String {
    if desc.len() < 2 {
        return String::new();
    }

    let len = (desc[0] as usize).min(desc.len());
    let count = (len.saturating_sub(2) / 2).min(max_chars);
    let units = desc[2..2 + count * 2].chunks_exact(2).map(LittleEndian::read_u16);

    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Render device and configuration descriptors as indented text
pub fn describe(device: &DeviceDescriptor, config: &[u8]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Device descriptor: idVendor {:#06x} idProduct {:#06x} class {:#04x}/{:#04x}/{:#04x} bMaxPacketSize0 {} configurations {}",
        device.vendor_id,
        device.product_id,
        device.class,
        device.subclass,
        device.protocol,
        device.max_packet_size_0,
        device.num_configurations
    );

    for desc in Descriptors::new(config, 0) {
        let b = desc.bytes;
        match desc.kind {
            DT_CONFIGURATION if b.len() >= 9 => {
                let _ = writeln!(
                    out,
                    "Configuration descriptor: wTotalLength {} interfaces {} value {} attributes {:#04x} max power {}mA",
                    LittleEndian::read_u16(&b[2..4]),
                    b[4],
                    b[5],
                    b[7],
                    u16::from(b[8]) * 2
                );
            }
            DT_INTERFACE if b.len() >= INTERFACE_DESC_LEN => {
                let _ = writeln!(
                    out,
                    "  Interface {} alt {}: endpoints {} class {:#04x}/{:#04x}/{:#04x}",
                    b[2], b[3], b[4], b[5], b[6], b[7]
                );
            }
            DT_ENDPOINT if b.len() >= ENDPOINT_DESC_LEN => {
                let _ = writeln!(
                    out,
                    "    Endpoint {:#04x}: attributes {:#04x} wMaxPacketSize {} interval {}",
                    b[2],
                    b[3],
                    LittleEndian::read_u16(&b[4..6]),
                    b[6]
                );
            }
            kind => {
                let _ = writeln!(
                    out,
                    "  Descriptor type {:#04x}, {} bytes",
                    kind,
                    b.len()
                );
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msc_config(endpoints: &[[u8; 7]]) -> Vec<u8> {
        let mut data = vec![0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32];
        data.extend_from_slice(&[
            0x09,
            0x04,
            0x00,
            0x00,
            endpoints.len() as u8,
            0x08,
            0x06,
            0x50,
            0x00,
        ]);
        for ep in endpoints {
            data.extend_from_slice(ep);
        }
        let total = data.len() as u16;
        data[2..4].copy_from_slice(&total.to_le_bytes());
        data
    }

    const BULK_IN_64: [u8; 7] = [0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00];
    const BULK_OUT_64: [u8; 7] = [0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00];

    #[test]
    fn test_extract_in_then_out() {
        let cfg = extract_configuration(&msc_config(&[BULK_IN_64, BULK_OUT_64])).unwrap();
        assert_eq!(cfg.iface_num, 0);
        assert_eq!(cfg.bulk_in_ep, 0x81);
        assert_eq!(cfg.bulk_in_mps, 64);
        assert_eq!(cfg.bulk_out_ep, 0x02);
    }

    #[test]
    fn test_extract_out_then_in() {
        let cfg = extract_configuration(&msc_config(&[BULK_OUT_64, BULK_IN_64])).unwrap();
        assert_eq!(cfg.bulk_in_ep, 0x81);
        assert_eq!(cfg.bulk_out_ep, 0x02);
    }

    #[test]
    fn test_single_endpoint_not_supported() {
        let err = extract_configuration(&msc_config(&[BULK_IN_64])).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::MissingEndpoints {
                interface: 0,
                found: 1
            }
        );
    }

    #[test]
    fn test_endpoints_after_next_interface_are_ignored() {
        let mut data = msc_config(&[BULK_IN_64]);
        data.extend_from_slice(&[0x09, 0x04, 0x01, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&BULK_OUT_64);
        let total = data.len() as u16;
        data[2..4].copy_from_slice(&total.to_le_bytes());

        assert!(matches!(
            extract_configuration(&data),
            Err(DescriptorError::MissingEndpoints { found: 1, .. })
        ));
    }

    #[test]
    fn test_high_bandwidth_bits_masked() {
        let ep_in = [0x07, 0x05, 0x81, 0x02, 0x00, 0x1a, 0x00]; // 0x1a00 -> 512 + mult bits
        let cfg = extract_configuration(&msc_config(&[ep_in, BULK_OUT_64])).unwrap();
        assert_eq!(cfg.bulk_in_mps, 512);
    }

    #[test]
    fn test_total_length_bounds_the_walk() {
        let mut data = msc_config(&[BULK_IN_64, BULK_OUT_64]);
        // Declare only the header and interface
        data[2..4].copy_from_slice(&18u16.to_le_bytes());
        assert!(find_msc_interface(&data).is_some());
        assert!(matches!(
            extract_configuration(&data),
            Err(DescriptorError::MissingEndpoints { found: 0, .. })
        ));
    }

    #[test]
    fn test_zero_length_descriptor_stops_walk() {
        let data = [0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, 0x00, 0x04];
        assert_eq!(find_msc_interface(&data), None);
    }

    #[test]
    fn test_round_up_to_mps() {
        assert_eq!(round_up_to_mps(13, 64), 64);
        assert_eq!(round_up_to_mps(64, 64), 64);
        assert_eq!(round_up_to_mps(65, 64), 128);
        assert_eq!(round_up_to_mps(0, 512), 0);
        assert_eq!(round_up_to_mps(36, 0), 36);
    }

    #[test]
    fn test_decode_string_descriptor() {
        // "USB" as UTF-16LE
        let desc = [0x08, 0x03, b'U', 0, b'S', 0, b'B', 0];
        assert_eq!(decode_string_descriptor(&desc, 15), "USB");
        assert_eq!(decode_string_descriptor(&desc, 2), "US");
    }

    #[test]
    fn test_decode_string_uses_blength() {
        // bLength says two characters even though more bytes follow
        let desc = [0x06, 0x03, b'A', 0, b'B', 0, b'C', 0];
        assert_eq!(decode_string_descriptor(&desc, 15), "AB");
        assert_eq!(decode_string_descriptor(&[], 15), "");
    }

    #[test]
    fn test_describe_lists_endpoints() {
        let text = describe(
            &DeviceDescriptor::default(),
            &msc_config(&[BULK_IN_64, BULK_OUT_64]),
        );
        assert!(text.contains("Interface 0 alt 0"));
        assert!(text.contains("Endpoint 0x81"));
        assert!(text.contains("Endpoint 0x02"));
    }
}
