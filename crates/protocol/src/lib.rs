//! Control-socket protocol for the usbmux daemon
//!
//! This crate defines the framing and the two payload encodings spoken on
//! the daemon's client socket. It performs no I/O: callers hand it complete
//! messages and get back typed requests, or hand it replies and get back
//! framed bytes.
//!
//! # Example
//!
//! ```
//! use protocol::{Header, Reply, ResultCode, WireVersion, encode_reply};
//!
//! let bytes = encode_reply(WireVersion::Binary, 7, &Reply::Result(ResultCode::OK)).unwrap();
//! let header = Header::decode(&bytes).unwrap();
//! assert_eq!(header.tag, 7);
//! assert_eq!(header.length as usize, bytes.len());
//! ```

pub mod binary;
pub mod codec;
pub mod error;
pub mod header;
pub mod messages;
pub mod types;
pub mod xml;

pub use codec::{Decoded, decode_request, encode_reply, frame};
pub use error::{ProtocolError, Result};
pub use header::{HEADER_SIZE, Header};
pub use messages::{Reply, Request};
pub use types::{ClientInfo, DeviceRecord, ListenerEntry, MessageType, ResultCode, WireVersion};
