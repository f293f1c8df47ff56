//! Ring Frame Protocol
//!
//! This module contains the wire format for communicating with the ring
//! and the GATT identifiers it exposes.

use crate::infrastructure::bluetooth::error::{FrameError, RingError};
use uuid::Uuid;

/// Ring BLE primary service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x000002fd_3c17_d293_8e48_14fe2e4da212);

/// Write characteristic UUID (0xFD03) - where command frames are sent
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fd03_0000_1000_8000_00805f9b34fb);

/// Notify characteristic UUID (0xFD04) - where response frames arrive
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fd04_0000_1000_8000_00805f9b34fb);

/// Bluetooth base UUID, used to expand 16-bit short identifiers
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

pub const FRAME_SIZE: usize = 16;
pub const PAYLOAD_SIZE: usize = 14;
pub const OPCODE_MASK: u8 = 0x7F;

/// One frame's payload bytes
pub type Packet = [u8; PAYLOAD_SIZE];

/// A validated 16-byte frame
///
/// # Frame Structure (16 bytes)
///
/// ```text
/// [0]     : Opcode (bit 7 reserved, cleared on encode)
/// [1-14]  : Payload (zero padded)
/// [15]    : CRC8 = sum(bytes[0..15]) mod 256
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; FRAME_SIZE],
}

impl Frame {
    /// Build a frame for `opcode` carrying up to 14 payload bytes.
    pub fn encode(opcode: u8, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { len: payload.len() });
        }

        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = opcode & OPCODE_MASK;
        bytes[1..1 + payload.len()].copy_from_slice(payload);
        bytes[FRAME_SIZE - 1] = checksum(&bytes);

        Ok(Self { bytes })
    }

    /// Validate raw notification bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let bytes: [u8; FRAME_SIZE] = raw
            .try_into()
            .map_err(|_| FrameError::InvalidLength { len: raw.len() })?;

        let expected = checksum(&bytes);
        let actual = bytes[FRAME_SIZE - 1];
        if expected != actual {
            return Err(FrameError::InvalidChecksum { expected, actual });
        }

        Ok(Self { bytes })
    }

    pub fn opcode(&self) -> u8 {
        extract_opcode(&self.bytes)
    }

    pub fn payload(&self) -> Packet {
        let mut packet = [0u8; PAYLOAD_SIZE];
        packet.copy_from_slice(&self.bytes[1..FRAME_SIZE - 1]);
        packet
    }

    pub fn crc(&self) -> u8 {
        self.bytes[FRAME_SIZE - 1]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.bytes
    }

    /// Space separated hex, for frame logging
    pub fn to_hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Additive CRC8 over the first 15 bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .take(FRAME_SIZE - 1)
        .fold(0u8, |crc, b| crc.wrapping_add(*b))
}

/// Opcode of a raw frame with the reserved bit masked off.
///
/// Returns 0 for empty input rather than failing.
pub fn extract_opcode(bytes: &[u8]) -> u8 {
    bytes.first().map(|b| b & OPCODE_MASK).unwrap_or(0)
}

/// Parse a UUID string as reported by an adapter.
///
/// Accepts the full 128-bit form and 16-bit short forms (`fd03`, `0xFD03`),
/// which are expanded against the Bluetooth base UUID.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, RingError> {
    let trimmed = uuid_str.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4 {
        let value = u16::from_str_radix(short, 16)
            .map_err(|_| RingError::InvalidUuid(uuid_str.to_string()))?;
        return Ok(Uuid::from_u128(BASE_UUID | ((value as u128) << 96)));
    }

    Uuid::parse_str(trimmed).map_err(|_| RingError::InvalidUuid(uuid_str.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::encode(0x03, &[]).unwrap();
        assert_eq!(frame.as_bytes()[0], 0x03);
        assert_eq!(frame.crc(), 0x03);

        let frame = Frame::encode(0x44, &[0x25, 0x01, 0x15]).unwrap();
        assert_eq!(&frame.as_bytes()[..5], &[0x44, 0x25, 0x01, 0x15, 0x00]);
        assert_eq!(frame.crc(), 0x44 + 0x25 + 0x01 + 0x15);
    }

    #[test]
    fn test_encode_clears_reserved_bit() {
        let frame = Frame::encode(0x95, &[0x01]).unwrap();
        assert_eq!(frame.opcode(), 0x15);
        assert_eq!(frame.as_bytes()[0], 0x15);
    }

    #[test]
    fn test_encode_rejects_large_payload() {
        assert_eq!(
            Frame::encode(0x01, &[0u8; 15]),
            Err(FrameError::PayloadTooLarge { len: 15 })
        );
        assert!(Frame::encode(0x01, &[0xFF; 14]).is_ok());
    }

    #[test]
    fn test_checksum_wraps() {
        let frame = Frame::encode(0x7F, &[0xFF; 14]).unwrap();
        let expected = (0x7Fu32 + 14 * 0xFF) % 256;
        assert_eq!(frame.crc() as u32, expected);
    }

    #[test]
    fn test_decode_returns_encoded_fields() {
        let payloads: [&[u8]; 4] = [&[], &[0x01], &[0xAA, 0xBB, 0xCC], &[0x5A; 14]];
        for opcode in [0x00, 0x15, 0x1E, 0x7F] {
            for payload in payloads {
                let frame = Frame::encode(opcode, payload).unwrap();
                let decoded = Frame::decode(frame.as_bytes()).unwrap();
                assert_eq!(decoded.opcode(), opcode);
                assert_eq!(&decoded.payload()[..payload.len()], payload);
                assert!(decoded.payload()[payload.len()..].iter().all(|b| *b == 0));
            }
        }
    }

    #[test]
    fn test_any_single_bit_flip_fails_checksum() {
        let frame = Frame::encode(0x15, &[0x00, 0x03, 0x10, 0x20]).unwrap();
        for byte in 0..FRAME_SIZE {
            for bit in 0..8 {
                let mut raw = *frame.as_bytes();
                raw[byte] ^= 1 << bit;
                assert!(
                    matches!(Frame::decode(&raw), Err(FrameError::InvalidChecksum { .. })),
                    "byte {} bit {}",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            Frame::decode(&[0u8; 15]),
            Err(FrameError::InvalidLength { len: 15 })
        );
        assert_eq!(
            Frame::decode(&[0u8; 20]),
            Err(FrameError::InvalidLength { len: 20 })
        );
    }

    #[test]
    fn test_extract_opcode() {
        assert_eq!(extract_opcode(&[]), 0);
        assert_eq!(extract_opcode(&[0x9E, 0x00]), 0x1E);
        assert_eq!(extract_opcode(&[0x73]), 0x73);
    }

    #[test]
    fn test_parse_uuid() {
        assert_eq!(parse_uuid("fd03").unwrap(), WRITE_CHAR_UUID);
        assert_eq!(parse_uuid("0xFD04").unwrap(), NOTIFY_CHAR_UUID);
        assert_eq!(
            parse_uuid("000002FD-3C17-D293-8E48-14FE2E4DA212").unwrap(),
            SERVICE_UUID
        );
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_uuid("zz01").is_err());
    }
}
