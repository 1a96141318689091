//! Per-device transfer context

use super::backend::{Completion, TransferBackend, TransferId, TransferStatus};
use super::{DRAIN_TIMEOUT, USB_MRU, UsbError};
use common::PointerSet;
use nix::poll::PollFlags;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Handler for one finished inbound transfer
///
/// Runs with the device borrowed mutably so it can resubmit through
/// [`UsbDevice::start_receive_loop`].
pub type RxCallback = Arc<dyn Fn(&mut UsbDevice, RxCompletion) + Send + Sync>;

/// Result of one inbound transfer
pub struct RxCompletion {
    pub status: TransferStatus,
    pub data: Vec<u8>,
    /// The handler that received this completion, for resubmission
    pub callback: RxCallback,
}

impl fmt::Debug for RxCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxCompletion")
            .field("status", &self.status)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Static facts about an opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub serial: String,
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub max_packet_size: u16,
    pub speed: u64,
    pub product_id: u16,
}

pub struct UsbDevice {
    backend: Option<Box<dyn TransferBackend>>,
    info: UsbDeviceInfo,
    alive: bool,
    draining: bool,
    rx: PointerSet<TransferId>,
    tx: PointerSet<TransferId>,
    rx_callbacks: HashMap<TransferId, RxCallback>,
}

impl UsbDevice {
    pub fn new(backend: Box<dyn TransferBackend>, info: UsbDeviceInfo) -> Self {
        Self {
            backend: Some(backend),
            info,
            alive: true,
            draining: false,
            rx: PointerSet::new(),
            tx: PointerSet::new(),
            rx_callbacks: HashMap::new(),
        }
    }

    /// Submit `data` as one outbound bulk transfer
    ///
    /// A length that is an exact multiple of the endpoint's max packet size
    /// is followed by a zero-length transfer.
    pub fn send(&mut self, data: Vec<u8>) -> Result<(), UsbError> {
        let backend = self.backend.as_mut().ok_or(UsbError::Disconnected)?;
        let length = data.len();
        let (bus, address) = (self.info.bus, self.info.address);

        let id = backend.submit_bulk(self.info.ep_out, data).inspect_err(|e| {
            error!(
                "Failed to submit TX transfer len {} to device {}-{}: {}",
                length, bus, address, e
            );
        })?;
        self.tx.insert(id);
        trace!("TX {} len {} to device {}-{}", id, length, bus, address);

        let packet = usize::from(self.info.max_packet_size);
        if packet != 0 && length % packet == 0 {
            debug!("Send ZLP to device {}-{}", bus, address);
            let zlp = backend.submit_bulk(self.info.ep_out, Vec::new()).inspect_err(|e| {
                error!(
                    "Failed to submit TX ZLP transfer to device {}-{}: {}",
                    bus, address, e
                );
            })?;
            self.tx.insert(zlp);
        }
        Ok(())
    }

    /// Submit one inbound transfer of [`USB_MRU`] bytes
    ///
    /// Single shot: `callback` runs once, and must call this again to keep
    /// receiving.
    pub fn start_receive_loop(&mut self, callback: RxCallback) -> Result<(), UsbError> {
        if self.draining {
            return Err(UsbError::Draining);
        }
        let backend = self.backend.as_mut().ok_or(UsbError::Disconnected)?;

        let id = backend
            .submit_bulk(self.info.ep_in, vec![0u8; USB_MRU])
            .inspect_err(|e| {
                error!(
                    "Failed to submit RX transfer to device {}-{}: {}",
                    self.info.bus, self.info.address, e
                );
            })?;
        self.rx.insert(id);
        self.rx_callbacks.insert(id, callback);
        Ok(())
    }

    /// Pump backend events once, then dispatch this device's completions
    ///
    /// Completions the pump queues for other devices stay on their queues
    /// until those devices call [`UsbDevice::dispatch_completions`].
    pub fn process_events(&mut self, timeout: Duration) -> Result<usize, UsbError> {
        let backend = self.backend.as_mut().ok_or(UsbError::Disconnected)?;
        backend.pump(timeout)?;
        Ok(self.dispatch_completions())
    }

    /// Dispatch completions already queued on this device without pumping
    ///
    /// Returns how many completions were handled.
    pub fn dispatch_completions(&mut self) -> usize {
        let Some(backend) = self.backend.as_mut() else {
            return 0;
        };
        let completions = backend.take_completions();
        let count = completions.len();

        for completion in completions {
            if self.tx.remove(&completion.id) {
                self.complete_tx(&completion);
            } else if self.rx.remove(&completion.id) {
                self.complete_rx(completion);
            } else {
                warn!(
                    "Completion for untracked transfer {} on device {}-{}",
                    completion.id, self.info.bus, self.info.address
                );
            }
        }
        count
    }

    fn complete_tx(&mut self, completion: &Completion) {
        let (bus, address) = (self.info.bus, self.info.address);
        trace!(
            "TX callback dev {}-{} {} len {} status {:?}",
            bus,
            address,
            completion.id,
            completion.data.len(),
            completion.status
        );

        if completion.status == TransferStatus::Completed {
            return;
        }
        if completion.status.is_teardown() {
            info!(
                "Device {}-{} TX ended during teardown: {:?}",
                bus, address, completion.status
            );
            return;
        }
        match completion.status {
            TransferStatus::TimedOut => {
                error!("TX transfer timed out for device {}-{}", bus, address)
            }
            TransferStatus::Stall => {
                error!("TX transfer stalled for device {}-{}", bus, address)
            }
            TransferStatus::Overflow => {
                error!("TX transfer overflow for device {}-{}", bus, address)
            }
            _ => error!("Device {}-{} TX aborted due to error", bus, address),
        }

        // Reaped by the owner on a later pass
        self.alive = false;
    }

    fn complete_rx(&mut self, completion: Completion) {
        let Some(callback) = self.rx_callbacks.remove(&completion.id) else {
            warn!("RX {} completed without a handler", completion.id);
            return;
        };
        let rx = RxCompletion {
            status: completion.status,
            data: completion.data,
            callback: Arc::clone(&callback),
        };
        callback(self, rx);
    }

    /// Cancel everything in flight, wait for every completion, then close
    pub fn disconnect(&mut self) -> Result<(), UsbError> {
        let backend = self.backend.as_mut().ok_or(UsbError::Disconnected)?;
        let (bus, address) = (self.info.bus, self.info.address);
        self.draining = true;

        for id in self.rx.iter() {
            debug!("Cancelling RX {} on device {}-{}", id, bus, address);
            if let Err(e) = backend.cancel(*id) {
                warn!("Failed to cancel RX {}: {}", id, e);
            }
        }
        for id in self.tx.iter() {
            debug!("Cancelling TX {} on device {}-{}", id, bus, address);
            if let Err(e) = backend.cancel(*id) {
                warn!("Failed to cancel TX {}: {}", id, e);
            }
        }

        while !self.rx.is_empty() || !self.tx.is_empty() {
            if let Err(e) = self.process_events(DRAIN_TIMEOUT) {
                error!(
                    "Event handling failed while draining device {}-{}: {}",
                    bus, address, e
                );
                break;
            }
        }

        self.rx_callbacks.clear();
        if let Some(mut backend) = self.backend.take() {
            backend.release();
        }
        info!("Disconnected device {}-{}", bus, address);
        Ok(())
    }

    /// Cleared once an outbound transfer fails
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    pub fn in_flight(&self) -> (usize, usize) {
        (self.rx.len(), self.tx.len())
    }

    pub fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        self.backend
            .as_ref()
            .map(|backend| backend.poll_fds())
            .unwrap_or_default()
    }

    pub fn bus(&self) -> u8 {
        self.info.bus
    }

    pub fn address(&self) -> u8 {
        self.info.address
    }

    pub fn serial(&self) -> &str {
        if self.backend.is_none() {
            return "";
        }
        &self.info.serial
    }

    pub fn location(&self) -> u32 {
        if self.backend.is_none() {
            return 0;
        }
        (u32::from(self.info.bus) << 16) | u32::from(self.info.address)
    }

    pub fn product_id(&self) -> u16 {
        if self.backend.is_none() {
            return 0;
        }
        self.info.product_id
    }

    pub fn speed(&self) -> u64 {
        if self.backend.is_none() {
            return 0;
        }
        self.info.speed
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if self.backend.is_some() {
            let _ = self.disconnect();
        }
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("info", &self.info)
            .field("alive", &self.alive)
            .field("connected", &self.backend.is_some())
            .field("rx", &self.rx.len())
            .field("tx", &self.tx.len())
            .finish()
    }
}
