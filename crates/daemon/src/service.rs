//! Outer event loop
//!
//! One thread builds the poll set, waits, and routes readiness: the
//! listening socket to `accept`, client sockets to the protocol engine and
//! libusb descriptors to the transfer engine. Devices whose transfers failed
//! are reaped at the end of each pass.

use crate::client::ClientRegistry;
use crate::config::DaemonConfig;
use crate::device::{DeviceManager, DeviceTable};
use crate::pollset::{FdOwner, PollSet};
use crate::store::FilePairRecordStore;
use crate::usb::{LibusbContext, RxCallback, RxCompletion, TransferStatus, UsbDevice};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use protocol::DeviceRecord;
use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: nix::libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Stop the loop on SIGINT and SIGTERM
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {} handler", signal))?;
    }
    Ok(())
}

pub struct Daemon {
    socket_path: PathBuf,
    poll_timeout: Duration,
    listener: UnixListener,
    registry: Arc<ClientRegistry>,
    devices: Arc<DeviceTable>,
    usb: Option<LibusbContext>,
    attached: Vec<(u32, UsbDevice)>,
    next_device_id: u32,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// Bind the client socket and set up collaborators
    pub fn bind(config: &DaemonConfig) -> Result<Self> {
        let socket_path = config.daemon.socket_path.clone();
        if socket_path.exists() {
            fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket {}", socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listening socket non-blocking")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o666))
            .with_context(|| format!("Failed to set permissions on {}", socket_path.display()))?;
        info!("Listening on {}", socket_path.display());

        let devices = Arc::new(DeviceTable::new());
        let records = Arc::new(FilePairRecordStore::new(&config.storage.config_dir));
        debug!("Pair records in {}", records.dir().display());
        let registry = Arc::new(ClientRegistry::new(
            Arc::clone(&devices) as Arc<dyn DeviceManager>,
            records,
            config.clients.clone(),
        ));

        let usb = match LibusbContext::new() {
            Ok(context) => Some(context),
            Err(e) => {
                warn!("USB unavailable, serving clients only: {}", e);
                None
            }
        };

        Ok(Self {
            socket_path,
            poll_timeout: config.daemon.poll_timeout(),
            listener,
            registry,
            devices,
            usb,
            attached: Vec::new(),
            next_device_id: 1,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Flag that stops `run` at the end of the current pass
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Open the device at `bus`-`address` and announce it to listeners
    pub fn attach(&mut self, bus: u8, address: u8) -> Result<u32> {
        let usb = self.usb.as_ref().context("USB is not available")?;
        let mut device = usb
            .open(bus, address)
            .with_context(|| format!("Failed to open device {}-{}", bus, address))?;

        let id = self.next_device_id;
        self.next_device_id += 1;

        let receive: RxCallback = Arc::new(move |dev: &mut UsbDevice, rx: RxCompletion| {
            trace!("Device {} received {} bytes", id, rx.data.len());
            if rx.status != TransferStatus::Completed {
                debug!("Device {} receive loop stopped: {:?}", id, rx.status);
                return;
            }
            if let Err(e) = dev.start_receive_loop(rx.callback) {
                error!("Device {} failed to resubmit receive: {}", id, e);
            }
        });
        device
            .start_receive_loop(receive)
            .with_context(|| format!("Failed to start receiving from device {}-{}", bus, address))?;

        let record = DeviceRecord {
            id,
            serial: device.serial().to_string(),
            location: device.location(),
            product_id: device.product_id(),
            speed: device.speed(),
        };
        self.devices.insert(record.clone());
        self.attached.push((id, device));
        self.registry.device_added(&record);
        info!("Attached device {} ({}) at {}-{}", id, record.serial, bus, address);
        Ok(id)
    }

    /// Serve until SIGINT, SIGTERM or the shutdown handle is set
    pub fn run(&mut self) -> Result<()> {
        let mut pollset = PollSet::new(self.listener.as_raw_fd());

        while !self.should_stop() {
            pollset.reset();
            self.registry.poll_fds(&mut pollset);
            if let Some(usb) = &self.usb {
                for (fd, events) in usb.poll_fds() {
                    pollset.add_usb(fd, events);
                }
            }

            match pollset.wait(self.poll_timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll() failed"),
            }

            if pollset.listener_ready() {
                if let Err(e) = self.registry.accept(&self.listener) {
                    debug!("Accept failed: {}", e);
                }
            }

            let mut usb_ready = false;
            for (owner, fd, events) in pollset.ready() {
                match owner {
                    FdOwner::Client => self.registry.process(fd, events),
                    FdOwner::Usb => usb_ready = true,
                    FdOwner::Listener => {}
                }
            }
            if usb_ready {
                self.pump_usb();
            }
            self.reap_dead_devices();
        }

        info!("Shutting down");
        self.shutdown();
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }

    /// Pump the shared libusb context once, then dispatch every device
    ///
    /// A single pump can complete transfers of any attached device, so no
    /// device pumps on its own here.
    fn pump_usb(&mut self) {
        if let Some(usb) = &self.usb {
            if let Err(e) = usb.handle_events(Duration::ZERO) {
                error!("libusb event handling failed: {}", e);
            }
        }
        self.dispatch_usb();
    }

    fn dispatch_usb(&mut self) {
        for (id, device) in &mut self.attached {
            let handled = device.dispatch_completions();
            if handled > 0 {
                trace!("Device {} handled {} completions", id, handled);
            }
        }
    }

    /// Disconnect devices whose transfers failed
    ///
    /// Draining a device pumps the shared context, which can queue
    /// completions on the survivors; those are dispatched before returning.
    fn reap_dead_devices(&mut self) {
        while self.attached.iter().any(|(_, device)| !device.is_alive()) {
            let (dead, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.attached)
                .into_iter()
                .partition(|(_, device)| !device.is_alive());
            self.attached = alive;

            for (id, mut device) in dead {
                warn!(
                    "Device {} at {}-{} is no longer alive, removing",
                    id,
                    device.bus(),
                    device.address()
                );
                if let Err(e) = device.disconnect() {
                    debug!("Device {} was already disconnected: {}", id, e);
                }
                self.devices.remove(id);
                self.registry.device_removed(id);
            }
            self.dispatch_usb();
        }
    }

    fn shutdown(&mut self) {
        self.registry.shutdown();
        for (id, mut device) in self.attached.drain(..) {
            if let Err(e) = device.disconnect() {
                debug!("Device {} was already disconnected: {}", id, e);
            }
        }
        if let Err(e) = fs::remove_file(&self.socket_path) {
            warn!("Failed to remove {}: {}", self.socket_path.display(), e);
        }
    }
}
