//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every variant describes a message that cannot be acted upon. Variants for
/// which [`ProtocolError::is_fatal`] holds are framing errors, and the
/// offending connection is closed without a reply. A truncated binary payload
/// is answered with BADCOMMAND instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a full header were supplied
    #[error("Incomplete header: expected {expected} bytes, got {actual}")]
    IncompleteHeader { expected: usize, actual: usize },

    /// Declared message length is smaller than the header itself
    #[error("Message too short: {length} bytes (header is {min})")]
    MessageTooShort { length: u32, min: usize },

    /// Declared message length exceeds the receive buffer
    #[error("Message too long: {length} bytes (max: {max})")]
    MessageTooLong { length: u32, max: usize },

    /// Payload could not be parsed as an XML property list
    #[error("Malformed plist payload: {0}")]
    Plist(#[from] plist::Error),

    /// Plist payload parsed, but its root is not a dictionary
    #[error("Plist payload root is not a dictionary")]
    NotADictionary,

    /// Plist dictionary lacks a string `MessageType` entry
    #[error("Plist payload has no string MessageType")]
    MissingMessageType,

    /// Binary payload is shorter than its fixed layout
    #[error("Truncated {what} payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ProtocolError {
    /// Whether the connection must be closed instead of answered
    ///
    /// A truncated binary payload still arrived in a well-formed frame, so it
    /// is answered like any other bad command.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::TruncatedPayload { .. })
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
