//! Asynchronous transfer backend seam

use super::UsbError;
use nix::poll::PollFlags;
use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

/// Backend-assigned handle for one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

/// How a transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map a `libusb_transfer_status` value
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TransferStatus::Completed,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }

    /// Expected outcomes while a device is going away
    pub fn is_teardown(self) -> bool {
        matches!(self, TransferStatus::Cancelled | TransferStatus::NoDevice)
    }
}

/// A finished transfer, already released by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// Bytes actually transferred; the received data for inbound transfers
    pub data: Vec<u8>,
}

/// Submission and completion of bulk transfers on one claimed interface
pub trait TransferBackend: Send {
    /// Submit one bulk transfer; `buffer` is sent (OUT) or filled (IN)
    fn submit_bulk(&mut self, endpoint: u8, buffer: Vec<u8>) -> Result<TransferId, UsbError>;

    /// Request cancellation; completion still arrives through `take_completions`
    fn cancel(&mut self, id: TransferId) -> Result<(), UsbError>;

    /// Pump the event source for up to `timeout`
    ///
    /// The source may be shared with other backends, so a pump can queue
    /// completions on any of them.
    fn pump(&mut self, timeout: Duration) -> Result<(), UsbError>;

    /// Release and return every completion queued on this backend
    fn take_completions(&mut self) -> Vec<Completion>;

    /// Descriptors the outer loop should poll for this backend
    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)>;

    /// Release the interface and close the handle
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TransferStatus::from_code(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_code(1), TransferStatus::Error);
        assert_eq!(TransferStatus::from_code(3), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from_code(6), TransferStatus::Overflow);
        assert_eq!(TransferStatus::from_code(42), TransferStatus::Error);
    }

    #[test]
    fn test_teardown_statuses() {
        assert!(TransferStatus::Cancelled.is_teardown());
        assert!(TransferStatus::NoDevice.is_teardown());
        assert!(!TransferStatus::Stall.is_teardown());
        assert!(!TransferStatus::Completed.is_teardown());
    }
}
