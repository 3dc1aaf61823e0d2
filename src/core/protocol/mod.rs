//! Wire protocol
//!
//! Provides the frame codec and its helpers:
//! - Protocol constants (header bytes, field widths, byte order)
//! - LRC checksum
//! - Stream framing (command, device-info and log frames)
//! - Structured diagnostic log decoding
//! - Decoded payload values

pub mod checksum;
pub mod diag;
pub mod framing;
pub mod value;

pub use diag::{DiagDecoder, DiagTable, DiagTableError, ValueType};
pub use framing::{encode_frame, Frame, FrameCodec, FrameKind, FramePayload, StreamDecoder};
pub use value::{DecodeFn, Decoded, StatusCode};

use serde::{Deserialize, Serialize};

/// Byte order (endianness)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Little endian (LSB first)
    #[default]
    Little,
    /// Big endian (MSB first)
    Big,
}

impl ByteOrder {
    /// Read an unsigned integer of up to 8 bytes
    pub fn read_uint(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            Self::Little => bytes.iter().rev().take(8).fold(0, fold),
            Self::Big => bytes.iter().take(8).fold(0, fold),
        }
    }

    /// Write `value` into exactly `width` bytes, truncating high bytes
    pub fn write_uint(self, value: u64, width: usize) -> Vec<u8> {
        let mut out: Vec<u8> = (0..width)
            .map(|i| if i < 8 { (value >> (8 * i)) as u8 } else { 0 })
            .collect();
        if self == Self::Big {
            out.reverse();
        }
        out
    }
}

/// Protocol constants, fixed for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Header of host → device frames
    pub downlink_header: u8,
    /// Headers of device → host frames
    pub uplink_headers: Vec<u8>,
    /// Header used to build default uplink headers of operations
    pub uplink_code: u8,
    /// Header of plain-text log frames (generic frame shape)
    pub log_header: u8,
    /// Header of structured diagnostic log frames
    pub diag_header: u8,
    /// Model id width in bytes
    pub model_size: usize,
    /// Opcode width in bytes
    pub opcode_size: usize,
    /// Length field width in bytes
    pub length_size: usize,
    /// Length field byte order
    pub byte_order: ByteOrder,
    /// Checksum width in bytes
    pub checksum_size: usize,
    /// Recognise marker-less device-info frames (`uplink_code 00 00`)
    pub device_info_frames: bool,
    /// Longest device-info frame; a header with no checksum match within
    /// this many bytes is skipped as garbage
    pub device_info_max_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            downlink_header: 0xAA,
            uplink_headers: vec![0xBB, 0xDD],
            uplink_code: 0xBB,
            log_header: 0xFF,
            diag_header: 0xC7,
            model_size: 1,
            opcode_size: 1,
            length_size: 2,
            byte_order: ByteOrder::Little,
            checksum_size: 1,
            device_info_frames: true,
            device_info_max_size: 64,
        }
    }
}

impl ProtocolConfig {
    /// Header marker width
    pub const HEADER_SIZE: usize = 1;

    /// Header + model + opcode
    pub fn protocol_size(&self) -> usize {
        Self::HEADER_SIZE + self.model_size + self.opcode_size
    }

    /// Offset of the first payload byte
    pub fn payload_index(&self) -> usize {
        self.protocol_size() + self.length_size
    }

    /// Smallest complete frame
    pub fn min_frame_size(&self) -> usize {
        self.payload_index() + self.checksum_size
    }

    /// Whether `byte` is a log frame header
    pub fn is_log_header(&self, byte: u8) -> bool {
        byte == self.log_header || byte == self.diag_header
    }

    /// Whether `byte` starts any known frame
    pub fn is_known_header(&self, byte: u8) -> bool {
        byte == self.downlink_header || self.is_log_header(byte) || self.uplink_headers.contains(&byte)
    }

    /// Reserved device-info header: `uplink_code` followed by zero model and opcode
    pub fn device_info_header(&self) -> Vec<u8> {
        let mut header = vec![self.uplink_code];
        header.resize(self.protocol_size(), 0);
        header
    }

    /// Zero-pad `field` on the right to `width` bytes
    pub fn pad(field: &[u8], width: usize) -> Vec<u8> {
        let mut out = field.to_vec();
        if out.len() < width {
            out.resize(width, 0);
        }
        out
    }

    /// Full downlink header for an operation
    pub fn downlink_header_for(&self, model_id: &[u8], opcode: &[u8]) -> Vec<u8> {
        let mut header = vec![self.downlink_header];
        header.extend(Self::pad(model_id, self.model_size));
        header.extend(Self::pad(opcode, self.opcode_size));
        header
    }

    /// Full uplink header for an operation
    pub fn uplink_header_for(&self, model_id: &[u8], opcode: &[u8]) -> Vec<u8> {
        let mut header = vec![self.uplink_code];
        header.extend(Self::pad(model_id, self.model_size));
        header.extend(Self::pad(opcode, self.opcode_size));
        header
    }
}
