//! libusb-backed transfers
//!
//! rusb only exposes synchronous transfers, so submission goes through the
//! raw `libusb1-sys` bindings it re-exports. The C completion callback does
//! nothing but queue `(transfer, status, length)` on the backend that
//! submitted it; transfers are freed later in
//! [`LibusbBackend::take_completions`], outside libusb's own event handling.
//!
//! Every backend shares one [`Context`], so pumping through any of them can
//! complete transfers belonging to another.

use super::backend::{Completion, TransferBackend, TransferId, TransferStatus};
use super::device::{UsbDevice, UsbDeviceInfo};
use super::{UsbError, speed_bps};
use nix::poll::PollFlags;
use rusb::ffi::{self, constants::*};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Interface class/subclass/protocol of the usbmux function
const MUX_CLASS: u8 = 0xff;
const MUX_SUBCLASS: u8 = 0xfe;
const MUX_PROTOCOL: u8 = 2;

/// Vendor id of the devices that expose the mux interface
const APPLE_VENDOR_ID: u16 = 0x05ac;

#[derive(Debug)]
struct RawCompletion {
    transfer: usize,
    status: c_int,
    actual_length: c_int,
}

type CompletionQueue = Mutex<Vec<RawCompletion>>;

struct InFlight {
    id: TransferId,
    transfer: *mut ffi::libusb_transfer,
    buffer: Vec<u8>,
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back a transfer this module submitted, whose
    // user_data points at the owning backend's queue. The backend keeps that
    // queue alive while any transfer is in flight.
    unsafe {
        let queue = &*((*transfer).user_data as *const CompletionQueue);
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RawCompletion {
                transfer: transfer as usize,
                status: (*transfer).status,
                actual_length: (*transfer).actual_length,
            });
    }
}

fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn context_poll_fds(context: &Context) -> Vec<(RawFd, PollFlags)> {
    let mut fds = Vec::new();

    // SAFETY: libusb returns a NULL-terminated array that stays valid until
    // it is passed to libusb_free_pollfds.
    unsafe {
        let list = ffi::libusb_get_pollfds(context.as_raw());
        if list.is_null() {
            return fds;
        }
        let mut cursor = list;
        while !(*cursor).is_null() {
            let pollfd = &**cursor;
            fds.push((pollfd.fd, PollFlags::from_bits_truncate(pollfd.events)));
            cursor = cursor.add(1);
        }
        ffi::libusb_free_pollfds(list);
    }
    fds
}

/// Shared libusb context for every opened device
#[derive(Clone)]
pub struct LibusbContext {
    context: Context,
}

impl LibusbContext {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new()?;
        debug!("Initialized libusb context");
        Ok(Self { context })
    }

    pub fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        context_poll_fds(&self.context)
    }

    /// Pump libusb once; completions stay queued on their backends
    pub fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the device at `bus`-`address` and claim its mux interface
    pub fn open(&self, bus: u8, address: u8) -> Result<UsbDevice, UsbError> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(UsbError::NotFound { bus, address })?;

        let descriptor = device.device_descriptor()?;
        if descriptor.vendor_id() != APPLE_VENDOR_ID {
            warn!(
                "Device {}-{} has vendor id {:04x}, trying anyway",
                bus,
                address,
                descriptor.vendor_id()
            );
        }

        let (interface, ep_in, ep_out, max_packet_size) = find_mux_interface(&device)
            .ok_or(UsbError::NoInterface { bus, address })?;

        let mut handle = device.open()?;
        let serial = descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .unwrap_or_default();

        if let Ok(true) = handle.kernel_driver_active(interface) {
            if let Err(e) = handle.detach_kernel_driver(interface) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        }
        handle.claim_interface(interface)?;

        let info = UsbDeviceInfo {
            bus,
            address,
            serial,
            interface,
            ep_in,
            ep_out,
            max_packet_size,
            speed: speed_bps(device.speed()),
            product_id: descriptor.product_id(),
        };
        info!(
            "Opened device {}-{} serial {} interface {} (in {:#04x}, out {:#04x}, mps {})",
            bus, address, info.serial, interface, ep_in, ep_out, max_packet_size
        );

        let backend = LibusbBackend::new(self.context.clone(), handle, interface);
        Ok(UsbDevice::new(Box::new(backend), info))
    }
}

/// Interface number, IN endpoint, OUT endpoint and OUT max packet size
fn find_mux_interface(device: &Device<Context>) -> Option<(u8, u8, u8, u16)> {
    let config = device.active_config_descriptor().ok()?;

    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            if alt.class_code() != MUX_CLASS
                || alt.sub_class_code() != MUX_SUBCLASS
                || alt.protocol_code() != MUX_PROTOCOL
            {
                continue;
            }

            let mut ep_in = None;
            let mut ep_out = None;
            for endpoint in alt.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => ep_in = Some(endpoint.address()),
                    Direction::Out => {
                        ep_out = Some((endpoint.address(), endpoint.max_packet_size()))
                    }
                }
            }

            if let (Some(ep_in), Some((ep_out, mps))) = (ep_in, ep_out) {
                return Some((alt.interface_number(), ep_in, ep_out, mps));
            }
        }
    }
    None
}

/// Transfers on one claimed interface of an open device
pub struct LibusbBackend {
    context: Context,
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    queue: Arc<CompletionQueue>,
    in_flight: HashMap<usize, InFlight>,
    next_id: u64,
}

// SAFETY: the raw transfer pointers are only touched through `&mut self`,
// and libusb permits submitting, cancelling and freeing transfers from any
// thread.
unsafe impl Send for LibusbBackend {}

impl LibusbBackend {
    pub fn new(context: Context, handle: DeviceHandle<Context>, interface: u8) -> Self {
        Self {
            context,
            handle: Some(handle),
            interface,
            queue: Arc::new(Mutex::new(Vec::new())),
            in_flight: HashMap::new(),
            next_id: 0,
        }
    }
}

impl TransferBackend for LibusbBackend {
    fn submit_bulk(&mut self, endpoint: u8, mut buffer: Vec<u8>) -> Result<TransferId, UsbError> {
        let handle = self.handle.as_ref().ok_or(UsbError::Disconnected)?;
        let length = c_int::try_from(buffer.len()).map_err(|_| rusb::Error::InvalidParam)?;

        // SAFETY: a fresh transfer with no isochronous packets.
        let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(rusb::Error::NoMem.into());
        }

        // SAFETY: `transfer` is non-null and exclusively ours until
        // submitted. The buffer's heap storage moves into `in_flight` below
        // without reallocating, so the pointer stays valid until the
        // completion is drained.
        let rc = unsafe {
            (*transfer).dev_handle = handle.as_raw();
            (*transfer).flags = 0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK as _;
            (*transfer).timeout = 0;
            (*transfer).length = length;
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).callback = transfer_callback;
            (*transfer).user_data = Arc::as_ptr(&self.queue) as *mut c_void;
            ffi::libusb_submit_transfer(transfer)
        };
        if rc < 0 {
            // SAFETY: never submitted, so libusb holds no reference.
            unsafe { ffi::libusb_free_transfer(transfer) };
            return Err(error_from_code(rc).into());
        }

        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.in_flight.insert(
            transfer as usize,
            InFlight {
                id,
                transfer,
                buffer,
            },
        );
        trace!("Submitted {} on endpoint {:#04x}", id, endpoint);
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId) -> Result<(), UsbError> {
        let Some(entry) = self.in_flight.values().find(|e| e.id == id) else {
            return Ok(());
        };

        // SAFETY: the transfer is still in flight; it is freed only once its
        // completion has been drained.
        let rc = unsafe { ffi::libusb_cancel_transfer(entry.transfer) };
        match rc {
            0 | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            rc => Err(error_from_code(rc).into()),
        }
    }

    fn pump(&mut self, timeout: Duration) -> Result<(), UsbError> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn take_completions(&mut self) -> Vec<Completion> {
        let raw = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        let mut completions = Vec::with_capacity(raw.len());

        for done in raw {
            let Some(mut entry) = self.in_flight.remove(&done.transfer) else {
                warn!("Completion for unknown transfer {:#x}", done.transfer);
                continue;
            };

            // SAFETY: libusb has run this transfer's callback and no longer
            // references it.
            unsafe { ffi::libusb_free_transfer(entry.transfer) };

            entry.buffer.truncate(usize::try_from(done.actual_length).unwrap_or(0));
            completions.push(Completion {
                id: entry.id,
                status: TransferStatus::from_code(done.status),
                data: entry.buffer,
            });
        }
        completions
    }

    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        context_poll_fds(&self.context)
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.interface) {
                debug!("Failed to release interface {}: {}", self.interface, e);
            }
        }
    }
}

impl Drop for LibusbBackend {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        // libusb may still write into these; leak rather than free
        warn!(
            "Dropping USB backend with {} transfers in flight",
            self.in_flight.len()
        );
        std::mem::forget(Arc::clone(&self.queue));
        for (_, entry) in self.in_flight.drain() {
            std::mem::forget(entry.buffer);
        }
    }
}
