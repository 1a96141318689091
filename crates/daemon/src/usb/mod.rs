//! USB transfer engine
//!
//! Bulk transfers are submitted through a [`TransferBackend`] and tracked by
//! the owning [`UsbDevice`] until their completion is drained. Pumping the
//! event source only queues completions on the backend that submitted them;
//! they are observed in [`UsbDevice::dispatch_completions`], so nothing is
//! freed from within the event pump that reported it.

pub mod backend;
pub mod device;
pub mod libusb;

pub use backend::{Completion, TransferBackend, TransferId, TransferStatus};
pub use device::{RxCallback, RxCompletion, UsbDevice, UsbDeviceInfo};
pub use libusb::{LibusbBackend, LibusbContext};

use std::time::Duration;
use thiserror::Error;

/// Size of one inbound bulk read
pub const USB_MRU: usize = 16384;

/// Event pump timeout while draining a disconnecting device
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum UsbError {
    /// The device handle has already been torn down
    #[error("Device is disconnected")]
    Disconnected,

    /// A receive was requested while the device is being drained
    #[error("Device is draining transfers")]
    Draining,

    /// No interface with a usbmux endpoint pair was found
    #[error("No usbmux interface on device {bus}-{address}")]
    NoInterface { bus: u8, address: u8 },

    /// No device at the requested bus and address
    #[error("No device at {bus}-{address}")]
    NotFound { bus: u8, address: u8 },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Negotiated speed in bits per second
pub fn speed_bps(speed: rusb::Speed) -> u64 {
    match speed {
        rusb::Speed::Low => 1_500_000,
        rusb::Speed::Full => 12_000_000,
        rusb::Speed::High => 480_000_000,
        rusb::Speed::Super => 5_000_000_000,
        rusb::Speed::SuperPlus => 10_000_000_000,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_bps() {
        assert_eq!(speed_bps(rusb::Speed::High), 480_000_000);
        assert_eq!(speed_bps(rusb::Speed::Super), 5_000_000_000);
        assert_eq!(speed_bps(rusb::Speed::Unknown), 0);
    }

    #[test]
    fn test_error_display() {
        let err = UsbError::NoInterface { bus: 1, address: 4 };
        assert_eq!(err.to_string(), "No usbmux interface on device 1-4");
        let err: UsbError = rusb::Error::Pipe.into();
        assert!(err.to_string().starts_with("USB error"));
    }
}
