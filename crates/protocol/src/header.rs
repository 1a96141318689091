//! Fixed message header
//!
//! Every message on the control socket starts with four little-endian `u32`
//! fields:
//!
//! ```text
//! [length][version][message][tag]
//! ```
//!
//! `length` counts the whole message including these 16 bytes.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Size of the encoded header in bytes
pub const HEADER_SIZE: usize = 16;

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total message size, header included
    pub length: u32,
    /// Payload encoding (0 binary, 1 plist)
    pub version: u32,
    /// Message type code
    pub message: u32,
    /// Correlation tag echoed in replies (0 for pushes)
    pub tag: u32,
}

impl Header {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::IncompleteHeader {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        Ok(Header {
            length: LittleEndian::read_u32(&bytes[0..4]),
            version: LittleEndian::read_u32(&bytes[4..8]),
            message: LittleEndian::read_u32(&bytes[8..12]),
            tag: LittleEndian::read_u32(&bytes[12..16]),
        })
    }

    /// Append the encoded header to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        // Writes into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(self.length);
        let _ = out.write_u32::<LittleEndian>(self.version);
        let _ = out.write_u32::<LittleEndian>(self.message);
        let _ = out.write_u32::<LittleEndian>(self.tag);
    }

    /// Check the declared length against the header size and `max`
    pub fn validate_length(&self, max: usize) -> Result<()> {
        if self.length as usize > max {
            return Err(ProtocolError::MessageTooLong {
                length: self.length,
                max,
            });
        }
        if (self.length as usize) < HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                length: self.length,
                min: HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Number of payload bytes following the header
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}
