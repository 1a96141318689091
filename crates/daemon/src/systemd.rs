//! systemd sd-notify integration
//!
//! Every call is a no-op unless the daemon runs under systemd with
//! `Type=notify`, in which case `NOTIFY_SOCKET` names the datagram socket to
//! report to.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var_os(NOTIFY_SOCKET).is_some()
}

fn notify(message: &str) -> Result<()> {
    let Ok(socket_path) = env::var(NOTIFY_SOCKET) else {
        debug!("NOTIFY_SOCKET not set, skipping {}", message);
        return Ok(());
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    debug!("Notified systemd: {}", message);
    Ok(())
}

/// The listening socket is bound and clients can connect
pub fn notify_ready() -> Result<()> {
    notify("READY=1")
}

pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1")
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={}", status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_delivers_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        // SAFETY: no other test in this crate touches NOTIFY_SOCKET
        unsafe { env::set_var(NOTIFY_SOCKET, &path) };
        let ready = notify_ready();
        let status = notify_status("Listening");
        unsafe { env::remove_var(NOTIFY_SOCKET) };

        ready.unwrap();
        status.unwrap();

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"READY=1");
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"STATUS=Listening");

        assert!(notify_stopping().is_ok());
    }
}
