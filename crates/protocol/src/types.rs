//! Wire-level type definitions
//!
//! Message type codes, result codes, payload encodings and the records that
//! the daemon reports about devices and listening clients.

use serde::{Deserialize, Serialize};

/// Message type code carried in every header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Result of a request (binary encoding)
    Result,
    /// Binary connect request
    Connect,
    /// Binary listen request
    Listen,
    /// Device attached notification (binary encoding)
    DeviceAdd,
    /// Device detached notification (binary encoding)
    DeviceRemove,
    /// Device paired notification (binary encoding)
    DevicePaired,
    /// XML property list request or reply
    Plist,
}

impl MessageType {
    /// Numeric code on the wire
    pub const fn code(self) -> u32 {
        match self {
            MessageType::Result => 1,
            MessageType::Connect => 2,
            MessageType::Listen => 3,
            MessageType::DeviceAdd => 4,
            MessageType::DeviceRemove => 5,
            MessageType::DevicePaired => 6,
            MessageType::Plist => 8,
        }
    }

    /// Look up a message type by its wire code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(MessageType::Result),
            2 => Some(MessageType::Connect),
            3 => Some(MessageType::Listen),
            4 => Some(MessageType::DeviceAdd),
            5 => Some(MessageType::DeviceRemove),
            6 => Some(MessageType::DevicePaired),
            8 => Some(MessageType::Plist),
            _ => None,
        }
    }
}

/// Result code sent back in `Result` replies
///
/// Besides the protocol's own codes, raw OS error numbers from the
/// pairing-record store are passed through unchanged, so this is an open
/// newtype rather than a closed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    pub const BAD_COMMAND: ResultCode = ResultCode(1);
    pub const BAD_DEVICE: ResultCode = ResultCode(2);
    pub const CONNECTION_REFUSED: ResultCode = ResultCode(3);
    pub const BAD_VERSION: ResultCode = ResultCode(6);

    /// Wrap a raw OS error number
    pub fn from_errno(errno: i32) -> Self {
        ResultCode(errno.unsigned_abs())
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::OK
    }
}

/// Payload encoding a client speaks
///
/// Chosen per client by the first message it sends; the numeric value is
/// also what goes into the header's `version` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireVersion {
    /// Fixed binary payloads
    #[default]
    Binary,
    /// XML property list payloads
    Plist,
}

impl WireVersion {
    pub const fn code(self) -> u32 {
        match self {
            WireVersion::Binary => 0,
            WireVersion::Plist => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(WireVersion::Binary),
            1 => Some(WireVersion::Plist),
            _ => None,
        }
    }
}

/// A device as reported to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Daemon-assigned device id
    pub id: u32,
    /// USB serial number string
    pub serial: String,
    /// `(bus << 16) | address`
    pub location: u32,
    /// USB product id
    pub product_id: u16,
    /// Negotiated connection speed in bits per second
    pub speed: u64,
}

/// Metadata a client declares about itself in plist requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub bundle_id: Option<String>,
    pub client_version: Option<String>,
    pub prog_name: Option<String>,
    pub lib_version: Option<u64>,
}

/// One entry of a `ListListeners` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEntry {
    /// Sequence number of the listening client
    pub number: u32,
    /// Metadata the listening client declared
    pub info: ClientInfo,
}

impl ListenerEntry {
    /// Program name, or "unknown" when the client never declared one
    pub fn prog_name(&self) -> &str {
        self.info.prog_name.as_deref().unwrap_or("unknown")
    }

    /// `<number>-<progname>`
    pub fn id_string(&self) -> String {
        format!("{}-{}", self.number, self.prog_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        for ty in [
            MessageType::Result,
            MessageType::Connect,
            MessageType::Listen,
            MessageType::DeviceAdd,
            MessageType::DeviceRemove,
            MessageType::DevicePaired,
            MessageType::Plist,
        ] {
            assert_eq!(MessageType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(MessageType::from_code(7), None);
        assert_eq!(MessageType::from_code(0), None);
    }

    #[test]
    fn test_result_code_from_errno() {
        assert_eq!(ResultCode::from_errno(22), ResultCode(22));
        assert_eq!(ResultCode::from_errno(-2), ResultCode(2));
        assert!(ResultCode::OK.is_ok());
        assert!(!ResultCode::BAD_DEVICE.is_ok());
    }

    #[test]
    fn test_wire_version() {
        assert_eq!(WireVersion::default(), WireVersion::Binary);
        assert_eq!(WireVersion::from_code(1), Some(WireVersion::Plist));
        assert_eq!(WireVersion::from_code(2), None);
    }

    #[test]
    fn test_listener_id_string() {
        let mut entry = ListenerEntry {
            number: 7,
            info: ClientInfo::default(),
        };
        assert_eq!(entry.id_string(), "7-unknown");

        entry.info.prog_name = Some("idevicesyslog".to_string());
        assert_eq!(entry.id_string(), "7-idevicesyslog");
    }
}
