//! One client connection: socket, buffers and framing I/O

use super::peer::PeerInfo;
use super::{ClientError, ClientId, ClientState};
use common::MessageBuffer;
use nix::poll::PollFlags;
use nix::sys::socket::{setsockopt, sockopt};
use protocol::{ClientInfo, HEADER_SIZE, Header, Reply, WireVersion};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, error, trace, warn};

/// Output buffers grow in whole blocks of this size
pub(crate) const OUTPUT_BLOCK: usize = 4096;

pub(crate) struct Client {
    pub(crate) id: ClientId,
    pub(crate) stream: UnixStream,
    pub(crate) peer: PeerInfo,
    pub(crate) state: ClientState,
    pub(crate) version: WireVersion,
    /// Present until the client leaves CONNECTING1 successfully
    pub(crate) input: Option<MessageBuffer>,
    /// Present until the client reaches CONNECTED
    pub(crate) output: Option<MessageBuffer>,
    /// What the poll set watches now
    pub(crate) interest: PollFlags,
    /// Applied once the connect reply has flushed
    pub(crate) desired: PollFlags,
    pub(crate) connect_tag: u32,
    pub(crate) connect_device: u32,
    pub(crate) info: ClientInfo,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        stream: UnixStream,
        peer: PeerInfo,
        input: MessageBuffer,
        output: MessageBuffer,
    ) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ClientState::Command,
            version: WireVersion::Binary,
            input: Some(input),
            output: Some(output),
            interest: PollFlags::POLLIN,
            desired: PollFlags::POLLIN,
            connect_tag: 0,
            connect_device: 0,
            info: ClientInfo::default(),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn set_state(&mut self, next: ClientState) -> Result<(), ClientError> {
        let next = self.state.transition(next)?;
        debug!("Client {} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Frame `reply` into the output buffer and ask for write readiness
    ///
    /// Encoding or growth failures drop this reply only.
    pub(crate) fn queue(&mut self, tag: u32, reply: &Reply) {
        let bytes = match protocol::encode_reply(self.version, tag, reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Client {} failed to encode reply: {}", self.id, e);
                return;
            }
        };

        let Some(output) = self.output.as_mut() else {
            warn!(
                "Client {} has no output buffer in state {}, dropping reply",
                self.id, self.state
            );
            return;
        };

        if let Err(e) = output.append_growing(&bytes, OUTPUT_BLOCK) {
            error!(
                "Client {} reply of {} bytes dropped: {}",
                self.id,
                bytes.len(),
                e
            );
            return;
        }
        trace!(
            "Client {} queued {} bytes (pending {})",
            self.id,
            bytes.len(),
            output.len()
        );
        self.interest |= PollFlags::POLLOUT;
    }

    /// Try one send of everything pending
    ///
    /// An `Err` means the connection must be closed.
    pub(crate) fn flush(&mut self) -> Result<(), ClientError> {
        let Some(output) = self.output.as_mut() else {
            self.interest.remove(PollFlags::POLLOUT);
            return Ok(());
        };

        if output.is_empty() {
            warn!("Client {} is writable but has nothing to send", self.id);
            self.interest.remove(PollFlags::POLLOUT);
            return Ok(());
        }

        let sent = match self.stream.write(output.as_slice()) {
            Ok(0) => return Err(ClientError::PeerClosed),
            Ok(sent) => sent,
            Err(e) if is_transient(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if sent < output.len() {
            trace!("Client {} short send {}/{}", self.id, sent, output.len());
            output.consume(sent);
            return Ok(());
        }

        output.clear();
        self.interest.remove(PollFlags::POLLOUT);
        if self.state == ClientState::Connecting2 {
            self.set_state(ClientState::Connected)?;
            self.interest = self.desired;
            self.output = None;
        }
        Ok(())
    }

    /// Advance input reassembly by at most one read per phase
    ///
    /// Returns a complete message, or `None` when more bytes are needed. A
    /// read that completes the header defers the body to the next readiness
    /// event.
    pub(crate) fn read_message(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        let Some(input) = self.input.as_mut() else {
            return Err(ClientError::InvalidState {
                op: "read_message",
                state: self.state,
            });
        };

        let mut did_read = false;
        if input.len() < HEADER_SIZE {
            if !fill(input, &mut self.stream, HEADER_SIZE)? || input.len() < HEADER_SIZE {
                return Ok(None);
            }
            did_read = true;
        }

        let header = Header::decode(input.as_slice())?;
        header.validate_length(input.capacity())?;
        let length = header.length as usize;

        if input.len() < length {
            if did_read {
                return Ok(None);
            }
            if !fill(input, &mut self.stream, length)? || input.len() < length {
                return Ok(None);
            }
        }

        let message = input.as_slice()[..length].to_vec();
        input.clear();
        Ok(Some(message))
    }
}

/// One read toward `target`; `false` when the socket had nothing
fn fill(
    input: &mut MessageBuffer,
    stream: &mut UnixStream,
    target: usize,
) -> Result<bool, ClientError> {
    match input.fill_from(stream, target) {
        Ok(0) => Err(ClientError::PeerClosed),
        Ok(_) => Ok(true),
        Err(e) if is_transient(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Apply non-blocking mode and buffer sizes to an accepted socket
///
/// Only non-blocking mode is required; the rest is logged and ignored.
pub(crate) fn configure_socket(stream: &UnixStream, buffer_size: usize) -> io::Result<()> {
    stream.set_nonblocking(true)?;

    if let Err(e) = setsockopt(stream, sockopt::SndBuf, &buffer_size) {
        warn!("Could not set send buffer for client socket: {}", e);
    }
    if let Err(e) = setsockopt(stream, sockopt::RcvBuf, &buffer_size) {
        warn!("Could not set receive buffer for client socket: {}", e);
    }
    // Unix sockets have no Nagle; this only matters for TCP listeners
    if let Err(e) = setsockopt(stream, sockopt::TcpNoDelay, &true) {
        trace!("TCP_NODELAY not applied: {}", e);
    }
    Ok(())
}
