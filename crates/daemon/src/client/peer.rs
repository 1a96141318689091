//! Best-effort peer process identification for log lines

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::fmt;
use std::fs;
use std::os::unix::net::UnixStream;

const UNKNOWN: &str = "unknown";

/// Who is on the other end of a client socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub pid: Option<i32>,
    pub name: String,
}

impl PeerInfo {
    pub fn unknown() -> Self {
        Self {
            pid: None,
            name: UNKNOWN.to_string(),
        }
    }

    /// Look up the peer of `stream`; never fails
    pub fn of(stream: &UnixStream) -> Self {
        let Ok(creds) = getsockopt(stream, PeerCredentials) else {
            return Self::unknown();
        };
        let pid = creds.pid();

        let name = if pid == std::process::id() as i32 {
            env!("CARGO_PKG_NAME").to_string()
        } else {
            process_name(pid).unwrap_or_else(|| UNKNOWN.to_string())
        };

        Self {
            pid: Some(pid),
            name,
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{}[{}]", self.name, pid),
            None => f.write_str(&self.name),
        }
    }
}

/// Executable name of `pid` from its command line
fn process_name(pid: i32) -> Option<String> {
    let cmdline = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let argv0 = cmdline.split(|&b| b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }
    let argv0 = String::from_utf8_lossy(argv0);
    let name = argv0.rsplit('/').next().unwrap_or(&argv0);
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_named() {
        let (a, _b) = UnixStream::pair().unwrap();
        let peer = PeerInfo::of(&a);
        assert_eq!(peer.pid, Some(std::process::id() as i32));
        assert_eq!(peer.name, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn test_display() {
        assert_eq!(PeerInfo::unknown().to_string(), "unknown");
        let peer = PeerInfo {
            pid: Some(42),
            name: "idevicesyslog".to_string(),
        };
        assert_eq!(peer.to_string(), "idevicesyslog[42]");
    }

    #[test]
    fn test_missing_process() {
        assert_eq!(process_name(-1), None);
    }
}
