//! Client registry and protocol engine
//!
//! Every client connection lives in one [`ClientRegistry`] behind a single
//! mutex. The lock is taken for each registry operation and released before
//! calling out to the device manager or the pairing-record store, so those
//! collaborators are free to call back into the registry (for example to
//! deliver a connect result from inside `start_connect`).

mod commands;
mod connection;
pub mod peer;
pub mod state;

pub use peer::PeerInfo;
pub use state::ClientState;

use crate::config::ClientSettings;
use crate::device::DeviceManager;
use crate::pollset::PollSet;
use crate::store::PairRecordStore;
use common::{MessageBuffer, PointerSet};
use connection::{Client, configure_socket};
use nix::poll::PollFlags;
use protocol::{DeviceRecord, ProtocolError, Reply, ResultCode};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Sequence number of a client, assigned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client {0} is not registered")]
    NotFound(ClientId),

    #[error("{op} is not valid in state {state}")]
    InvalidState {
        op: &'static str,
        state: ClientState,
    },

    #[error("Illegal client state transition {from} -> {to}")]
    IllegalTransition { from: ClientState, to: ClientState },

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] common::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What `process` decided to do once the lock is released
enum Route {
    Device { device: u32 },
    Message(Vec<u8>),
    Close(ClientError),
}

struct Registry {
    clients: PointerSet<Client>,
    next_number: u32,
}

impl Registry {
    fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.find_mut(|c| c.id == id)
    }
}

pub struct ClientRegistry {
    inner: Mutex<Registry>,
    devices: Arc<dyn DeviceManager>,
    records: Arc<dyn PairRecordStore>,
    settings: ClientSettings,
}

impl ClientRegistry {
    pub fn new(
        devices: Arc<dyn DeviceManager>,
        records: Arc<dyn PairRecordStore>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            inner: Mutex::new(Registry {
                clients: PointerSet::new(),
                next_number: 0,
            }),
            devices,
            records,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept one pending connection from `listener`
    pub fn accept(&self, listener: &UnixListener) -> Result<ClientId, ClientError> {
        let (stream, _) = listener.accept().inspect_err(|e| {
            error!("accept() failed: {}", e);
        })?;
        self.register(stream)
    }

    /// Take ownership of a connected socket as a new client
    pub fn register(&self, stream: UnixStream) -> Result<ClientId, ClientError> {
        configure_socket(&stream, self.settings.socket_buffer_size)?;

        let input = MessageBuffer::with_capacity(self.settings.input_buffer_size)?;
        let output = MessageBuffer::with_capacity(self.settings.output_buffer_size)?;
        let peer = PeerInfo::of(&stream);

        let mut inner = self.lock();
        let id = ClientId(inner.next_number);
        inner.next_number = inner.next_number.wrapping_add(1);

        let client = Client::new(id, stream, peer, input, output);
        info!("New client {} on fd {}: {}", id, client.fd(), client.peer);
        inner.clients.insert(client);
        Ok(id)
    }

    /// Raw receive for a connected client
    pub fn read(&self, id: ClientId, buf: &mut [u8]) -> Result<usize, ClientError> {
        let mut inner = self.lock();
        let client = inner.get_mut(id).ok_or(ClientError::NotFound(id))?;
        if client.state != ClientState::Connected {
            error!("Attempted to read from client {} in state {}", id, client.state);
            return Err(ClientError::InvalidState {
                op: "read",
                state: client.state,
            });
        }
        Ok(client.stream.read(buf)?)
    }

    /// Raw send for a connected client; a full socket reports zero bytes
    pub fn write(&self, id: ClientId, buf: &[u8]) -> Result<usize, ClientError> {
        let mut inner = self.lock();
        let client = inner.get_mut(id).ok_or(ClientError::NotFound(id))?;
        if client.state != ClientState::Connected {
            error!("Attempted to write to client {} in state {}", id, client.state);
            return Err(ClientError::InvalidState {
                op: "write",
                state: client.state,
            });
        }
        match client.stream.write(buf) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Set the poll interest of a client handed to the device manager
    ///
    /// While the connect reply is still flushing the mask is only recorded.
    pub fn set_interest(&self, id: ClientId, events: PollFlags) -> Result<(), ClientError> {
        let mut inner = self.lock();
        let client = inner.get_mut(id).ok_or(ClientError::NotFound(id))?;
        match client.state {
            ClientState::Connected => client.interest = events,
            ClientState::Connecting2 => client.desired = events,
            state => {
                error!("Attempted to set events on client {} in state {}", id, state);
                return Err(ClientError::InvalidState {
                    op: "set_interest",
                    state,
                });
            }
        }
        Ok(())
    }

    /// Add every live client to `set`
    pub fn poll_fds(&self, set: &mut PollSet) {
        let inner = self.lock();
        for client in inner.clients.iter() {
            if client.state != ClientState::Dead {
                set.add_client(client.fd(), client.interest);
            }
        }
    }

    /// Handle readiness `events` reported for `fd`
    ///
    /// Reads take priority over writes; at most one of the two runs per call.
    pub fn process(&self, fd: RawFd, events: PollFlags) {
        let (id, route) = {
            let mut inner = self.lock();
            let Some(client) = inner.clients.find_mut(|c| c.fd() == fd) else {
                warn!("Readiness for unknown client fd {}", fd);
                return;
            };
            let id = client.id;

            let readable =
                events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
            let route = match client.state {
                ClientState::Dead => return,
                ClientState::Connected => Route::Device {
                    device: client.connect_device,
                },
                _ if readable && client.input.is_some() => match client.read_message() {
                    Ok(Some(message)) => Route::Message(message),
                    Ok(None) => return,
                    Err(e) => Route::Close(e),
                },
                _ if readable => Route::Close(ClientError::PeerClosed),
                _ if events.contains(PollFlags::POLLOUT) => match client.flush() {
                    Ok(()) => return,
                    Err(e) => Route::Close(e),
                },
                _ => return,
            };
            (id, route)
        };

        match route {
            Route::Device { device } => self.devices.client_process(device, id, events),
            Route::Message(message) => self.handle_message(id, &message),
            Route::Close(reason) => {
                match reason {
                    ClientError::PeerClosed => debug!("Client {} connection closed", id),
                    reason => error!("Client {} failed: {}", id, reason),
                }
                self.close(id);
            }
        }
    }

    /// Deliver the outcome of an asynchronous connect
    ///
    /// Dead or already-removed clients ignore the result.
    pub fn notify_connect(&self, id: ClientId, result: ResultCode) -> Result<(), ClientError> {
        let mut inner = self.lock();
        let Some(client) = inner.get_mut(id) else {
            debug!("Connect result for removed client {}", id);
            return Ok(());
        };

        match client.state {
            ClientState::Dead => Ok(()),
            ClientState::Connecting1 => {
                let tag = client.connect_tag;
                client.queue(tag, &Reply::Result(result));
                if result.is_ok() {
                    client.set_state(ClientState::Connecting2)?;
                    client.interest = PollFlags::POLLOUT;
                    client.input = None;
                } else {
                    client.set_state(ClientState::Command)?;
                }
                Ok(())
            }
            state => {
                error!("Client {} got a connect result in state {}", id, state);
                Err(ClientError::InvalidState {
                    op: "notify_connect",
                    state,
                })
            }
        }
    }

    /// Tear a client down; repeated calls are no-ops
    pub fn close(&self, id: ClientId) {
        let abort = {
            let mut inner = self.lock();
            let Some(client) = inner.get_mut(id) else {
                return;
            };
            let pending = match client.state {
                ClientState::Dead => return,
                ClientState::Connecting1 | ClientState::Connecting2 => {
                    Some(client.connect_device)
                }
                _ => None,
            };
            info!("Disconnecting client {} on fd {}: {}", id, client.fd(), client.peer);
            client.state = ClientState::Dead;

            if pending.is_none() {
                inner.clients.remove_where(|c| c.id == id);
                return;
            }
            pending
        };

        if let Some(device) = abort {
            self.devices.abort_connect(device, id);
        }
        self.lock().clients.remove_where(|c| c.id == id);
    }

    /// Close every client
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = self.lock().clients.iter().map(|c| c.id).collect();
        info!("Closing {} clients", ids.len());
        for id in ids {
            self.close(id);
        }
    }

    /// A device became available; listeners are told about it
    pub fn device_added(&self, device: &DeviceRecord) {
        self.devices.set_visible(device.id);
        let notified = self.broadcast(&Reply::DeviceAttached(device.clone()));
        debug!("Device {} added, {} listeners notified", device.id, notified);
    }

    pub fn device_removed(&self, device_id: u32) {
        let notified = self.broadcast(&Reply::DeviceDetached(device_id));
        debug!("Device {} removed, {} listeners notified", device_id, notified);
    }

    pub fn device_paired(&self, device_id: u32) {
        let notified = self.broadcast(&Reply::DevicePaired(device_id));
        debug!("Device {} paired, {} listeners notified", device_id, notified);
    }

    /// Queue `reply` to every listening client; returns how many got it
    fn broadcast(&self, reply: &Reply) -> usize {
        let mut inner = self.lock();
        let mut count = 0;
        for client in inner.clients.iter_mut() {
            if client.state == ClientState::Listen {
                client.queue(0, reply);
                count += 1;
            }
        }
        count
    }

    /// Queue a reply to one client
    fn reply(&self, id: ClientId, tag: u32, reply: &Reply) {
        if let Some(client) = self.lock().get_mut(id) {
            client.queue(tag, reply);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, id: ClientId) -> Option<ClientState> {
        self.lock().get(id).map(|c| c.state)
    }

    pub fn interest(&self, id: ClientId) -> Option<PollFlags> {
        self.lock().get(id).map(|c| c.interest)
    }

    pub fn fd(&self, id: ClientId) -> Option<RawFd> {
        self.lock().get(id).map(|c| c.fd())
    }

    /// Whether the client still owns an input or output buffer
    pub fn buffers(&self, id: ClientId) -> Option<(bool, bool)> {
        self.lock()
            .get(id)
            .map(|c| (c.input.is_some(), c.output.is_some()))
    }
}
