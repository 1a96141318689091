//! Logical requests and replies
//!
//! Both wire encodings decode into the same [`Request`] and encode from the
//! same [`Reply`], so the daemon's command handling never sees which encoding
//! a client used.

use crate::types::{DeviceRecord, ListenerEntry, ResultCode};

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Switch the connection to device notifications
    Listen,
    /// Open a logical connection to `port` on a device
    ///
    /// Binary requests always carry both fields; plist requests may omit
    /// either one. `port` is already in host byte order.
    Connect {
        device_id: Option<u32>,
        port: Option<u16>,
    },
    ListDevices,
    ListListeners,
    ReadBuid,
    ReadPairRecord {
        record_id: Option<String>,
    },
    SavePairRecord {
        record_id: Option<String>,
        record_data: Option<Vec<u8>>,
        device_id: Option<u32>,
    },
    DeletePairRecord {
        record_id: Option<String>,
    },
    /// Anything the daemon does not understand; answered with BADCOMMAND
    Unknown { name: String },
}

impl Request {
    /// Short name for log lines
    pub fn name(&self) -> &str {
        match self {
            Request::Listen => "Listen",
            Request::Connect { .. } => "Connect",
            Request::ListDevices => "ListDevices",
            Request::ListListeners => "ListListeners",
            Request::ReadBuid => "ReadBUID",
            Request::ReadPairRecord { .. } => "ReadPairRecord",
            Request::SavePairRecord { .. } => "SavePairRecord",
            Request::DeletePairRecord { .. } => "DeletePairRecord",
            Request::Unknown { name } => name,
        }
    }
}

/// A reply or notification queued for a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Numeric result of a request
    Result(ResultCode),
    /// A device is (or became) available
    DeviceAttached(DeviceRecord),
    /// A device went away
    DeviceDetached(u32),
    /// A device finished pairing
    DevicePaired(u32),
    /// Full device enumeration
    DeviceList(Vec<DeviceRecord>),
    /// All clients currently listening
    ListenerList(Vec<ListenerEntry>),
    /// The daemon's persistent unique id
    Buid(String),
    /// Raw pairing record bytes
    PairRecord(Vec<u8>),
}

impl Reply {
    /// Replies that exist only as property lists
    ///
    /// These answer plist-only requests, so they are always encoded as
    /// plists regardless of the client's recorded wire version.
    pub fn is_plist_only(&self) -> bool {
        matches!(
            self,
            Reply::DeviceList(_) | Reply::ListenerList(_) | Reply::Buid(_) | Reply::PairRecord(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_names() {
        assert_eq!(Request::ReadBuid.name(), "ReadBUID");
        assert_eq!(
            Request::Unknown {
                name: "Frobnicate".to_string()
            }
            .name(),
            "Frobnicate"
        );
    }

    #[test]
    fn test_plist_only_replies() {
        assert!(Reply::Buid("X".to_string()).is_plist_only());
        assert!(Reply::DeviceList(Vec::new()).is_plist_only());
        assert!(!Reply::Result(ResultCode::OK).is_plist_only());
        assert!(!Reply::DeviceDetached(1).is_plist_only());
    }
}
