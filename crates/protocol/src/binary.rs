//! Binary payload encoding (wire version 0)
//!
//! Layouts, all little endian except the connect port:
//!
//! ```text
//! CONNECT       [device_id: u32][port: u16 big-endian][reserved: u16]
//! RESULT        [code: u32]
//! DEVICE_ADD    [device_id: u32][product_id: u16][serial: 256 bytes, NUL padded]
//!               [padding: u16][location: u32]
//! DEVICE_REMOVE [device_id: u32]
//! DEVICE_PAIRED [device_id: u32]
//! ```

use crate::error::{ProtocolError, Result};
use crate::messages::{Reply, Request};
use crate::types::{DeviceRecord, MessageType};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

/// Size of the CONNECT payload
pub const CONNECT_PAYLOAD_SIZE: usize = 8;

/// Size of the serial number field in a device record
pub const SERIAL_FIELD_SIZE: usize = 256;

/// Size of the DEVICE_ADD payload
pub const DEVICE_RECORD_SIZE: usize = 4 + 2 + SERIAL_FIELD_SIZE + 2 + 4;

/// Decode a binary request
///
/// Unknown message codes decode to [`Request::Unknown`] so the caller can
/// answer them; only a truncated CONNECT payload is an error.
pub fn decode_request(message: u32, payload: &[u8]) -> Result<Request> {
    match MessageType::from_code(message) {
        Some(MessageType::Listen) => Ok(Request::Listen),
        Some(MessageType::Connect) => {
            if payload.len() < CONNECT_PAYLOAD_SIZE {
                return Err(ProtocolError::TruncatedPayload {
                    what: "connect",
                    expected: CONNECT_PAYLOAD_SIZE,
                    actual: payload.len(),
                });
            }
            Ok(Request::Connect {
                device_id: Some(LittleEndian::read_u32(&payload[0..4])),
                port: Some(BigEndian::read_u16(&payload[4..6])),
            })
        }
        _ => Ok(Request::Unknown {
            name: format!("binary message {}", message),
        }),
    }
}

/// Encode a reply as a binary payload
///
/// Returns the message type and payload, or `None` for replies that only
/// exist as property lists.
pub fn encode_reply(reply: &Reply) -> Option<(MessageType, Vec<u8>)> {
    match reply {
        Reply::Result(code) => Some((MessageType::Result, u32_payload(code.0))),
        Reply::DeviceAttached(device) => Some((MessageType::DeviceAdd, device_record(device))),
        Reply::DeviceDetached(id) => Some((MessageType::DeviceRemove, u32_payload(*id))),
        Reply::DevicePaired(id) => Some((MessageType::DevicePaired, u32_payload(*id))),
        Reply::DeviceList(_) | Reply::ListenerList(_) | Reply::Buid(_) | Reply::PairRecord(_) => {
            None
        }
    }
}

fn u32_payload(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    let _ = out.write_u32::<LittleEndian>(value);
    out
}

fn device_record(device: &DeviceRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(DEVICE_RECORD_SIZE);
    let _ = out.write_u32::<LittleEndian>(device.id);
    let _ = out.write_u16::<LittleEndian>(device.product_id);

    // Serial is truncated to leave room for the terminating NUL
    let serial = device.serial.as_bytes();
    let copied = serial.len().min(SERIAL_FIELD_SIZE - 1);
    out.extend_from_slice(&serial[..copied]);
    out.resize(out.len() + SERIAL_FIELD_SIZE - copied, 0);

    let _ = out.write_u16::<LittleEndian>(0);
    let _ = out.write_u32::<LittleEndian>(device.location);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    fn device() -> DeviceRecord {
        DeviceRecord {
            id: 3,
            serial: "00008030-001A".to_string(),
            location: (1 << 16) | 4,
            product_id: 0x12a8,
            speed: 480_000_000,
        }
    }

    #[test]
    fn test_decode_connect() {
        let payload = [5, 0, 0, 0, 0xf2, 0x7e, 0, 0];
        let request = decode_request(MessageType::Connect.code(), &payload).unwrap();
        assert_eq!(
            request,
            Request::Connect {
                device_id: Some(5),
                port: Some(62078),
            }
        );
    }

    #[test]
    fn test_decode_truncated_connect() {
        let err = decode_request(MessageType::Connect.code(), &[1, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedPayload {
                what: "connect",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_listen_ignores_payload() {
        assert_eq!(
            decode_request(MessageType::Listen.code(), &[]).unwrap(),
            Request::Listen
        );
    }

    #[test]
    fn test_decode_unknown_code() {
        let request = decode_request(42, &[]).unwrap();
        assert!(matches!(request, Request::Unknown { .. }));

        // A RESULT sent by a client is not a request either
        let request = decode_request(MessageType::Result.code(), &[0; 4]).unwrap();
        assert!(matches!(request, Request::Unknown { .. }));
    }

    #[test]
    fn test_encode_result() {
        let (ty, payload) = encode_reply(&Reply::Result(ResultCode::BAD_VERSION)).unwrap();
        assert_eq!(ty, MessageType::Result);
        assert_eq!(payload, vec![6, 0, 0, 0]);
    }

    #[test]
    fn test_encode_device_record_layout() {
        let (ty, payload) = encode_reply(&Reply::DeviceAttached(device())).unwrap();
        assert_eq!(ty, MessageType::DeviceAdd);
        assert_eq!(payload.len(), DEVICE_RECORD_SIZE);
        assert_eq!(LittleEndian::read_u32(&payload[0..4]), 3);
        assert_eq!(LittleEndian::read_u16(&payload[4..6]), 0x12a8);
        assert_eq!(&payload[6..19], b"00008030-001A");
        assert_eq!(payload[19], 0);
        assert_eq!(
            LittleEndian::read_u32(&payload[DEVICE_RECORD_SIZE - 4..]),
            (1 << 16) | 4
        );
    }

    #[test]
    fn test_encode_long_serial_is_nul_terminated() {
        let mut dev = device();
        dev.serial = "A".repeat(400);
        let (_, payload) = encode_reply(&Reply::DeviceAttached(dev)).unwrap();
        assert_eq!(payload.len(), DEVICE_RECORD_SIZE);
        assert_eq!(payload[6 + SERIAL_FIELD_SIZE - 1], 0);
        assert_eq!(payload[6 + SERIAL_FIELD_SIZE - 2], b'A');
    }

    #[test]
    fn test_plist_only_replies_have_no_binary_form() {
        assert!(encode_reply(&Reply::Buid("B".to_string())).is_none());
        assert!(encode_reply(&Reply::PairRecord(vec![1, 2])).is_none());
    }
}
