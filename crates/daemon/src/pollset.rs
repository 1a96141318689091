//! Per-iteration poll set
//!
//! Rebuilt from scratch every loop pass. The listening socket always sits in
//! slot 0; clients and USB descriptors follow in whatever order they were
//! added.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// Who a descriptor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdOwner {
    Listener,
    Client,
    Usb,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    owner: FdOwner,
    fd: RawFd,
    events: PollFlags,
    revents: PollFlags,
}

#[derive(Debug)]
pub struct PollSet {
    slots: Vec<Slot>,
}

impl PollSet {
    /// Create a set with the listening socket in slot 0
    pub fn new(listener: RawFd) -> Self {
        Self {
            slots: vec![Slot {
                owner: FdOwner::Listener,
                fd: listener,
                events: PollFlags::POLLIN,
                revents: PollFlags::empty(),
            }],
        }
    }

    /// Drop everything but the listener
    pub fn reset(&mut self) {
        self.slots.truncate(1);
        if let Some(listener) = self.slots.first_mut() {
            listener.revents = PollFlags::empty();
        }
    }

    pub fn add(&mut self, owner: FdOwner, fd: RawFd, events: PollFlags) {
        self.slots.push(Slot {
            owner,
            fd,
            events,
            revents: PollFlags::empty(),
        });
    }

    pub fn add_client(&mut self, fd: RawFd, events: PollFlags) {
        self.add(FdOwner::Client, fd, events);
    }

    pub fn add_usb(&mut self, fd: RawFd, events: PollFlags) {
        self.add(FdOwner::Usb, fd, events);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until a descriptor is ready or `timeout` elapses
    ///
    /// Returns the number of ready descriptors.
    pub fn wait(&mut self, timeout: Duration) -> nix::Result<usize> {
        let millis = u16::try_from(timeout.as_millis())
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX);

        let mut fds: Vec<PollFd<'_>> = self
            .slots
            .iter()
            .map(|slot| {
                // SAFETY: every descriptor belongs to the listener, a
                // registered client or the USB context, all of which outlive
                // this call. poll reports POLLNVAL for a stale number rather
                // than touching it.
                let fd = unsafe { BorrowedFd::borrow_raw(slot.fd) };
                PollFd::new(fd, slot.events)
            })
            .collect();

        let ready = poll(&mut fds, millis)?;

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
            .collect();
        drop(fds);

        for (slot, revents) in self.slots.iter_mut().zip(revents) {
            slot.revents = revents;
        }

        Ok(ready.max(0) as usize)
    }

    /// Whether the listening socket has a pending connection
    pub fn listener_ready(&self) -> bool {
        self.slots
            .first()
            .is_some_and(|slot| slot.revents.contains(PollFlags::POLLIN))
    }

    /// Descriptors other than the listener that reported readiness
    pub fn ready(&self) -> impl Iterator<Item = (FdOwner, RawFd, PollFlags)> + '_ {
        self.slots
            .iter()
            .skip(1)
            .filter(|slot| !slot.revents.is_empty())
            .map(|slot| (slot.owner, slot.fd, slot.revents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_reset_keeps_listener() {
        let mut set = PollSet::new(3);
        set.add_client(7, PollFlags::POLLIN);
        set.add_usb(9, PollFlags::POLLIN | PollFlags::POLLOUT);
        assert_eq!(set.len(), 3);

        set.reset();
        assert_eq!(set.len(), 1);
        assert!(!set.listener_ready());
    }

    #[test]
    fn test_wait_reports_readiness() {
        let (listener_side, mut listener_peer) = UnixStream::pair().unwrap();
        let (client_side, mut client_peer) = UnixStream::pair().unwrap();
        let (idle_side, _idle_peer) = UnixStream::pair().unwrap();

        let mut set = PollSet::new(listener_side.as_raw_fd());
        set.add_client(client_side.as_raw_fd(), PollFlags::POLLIN);
        set.add_client(idle_side.as_raw_fd(), PollFlags::POLLIN);

        client_peer.write_all(b"x").unwrap();
        let ready = set.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(ready, 1);
        assert!(!set.listener_ready());

        let ready: Vec<_> = set.ready().collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, FdOwner::Client);
        assert_eq!(ready[0].1, client_side.as_raw_fd());
        assert!(ready[0].2.contains(PollFlags::POLLIN));

        listener_peer.write_all(b"y").unwrap();
        set.wait(Duration::from_millis(100)).unwrap();
        assert!(set.listener_ready());
    }

    #[test]
    fn test_wait_times_out() {
        let (side, _peer) = UnixStream::pair().unwrap();
        let mut set = PollSet::new(side.as_raw_fd());
        assert_eq!(set.wait(Duration::from_millis(5)).unwrap(), 0);
        assert_eq!(set.ready().count(), 0);
    }
}
