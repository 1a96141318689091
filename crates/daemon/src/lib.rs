//! usbmux daemon
//!
//! Multiplexes client connections on a local Unix socket onto USB devices.
//! Clients speak the framed usbmux protocol (binary or plist payloads) to
//! list and watch devices, manage pairing records and open connections to
//! device ports.

pub mod client;
pub mod config;
pub mod device;
pub mod pollset;
pub mod service;
pub mod store;
pub mod systemd;
pub mod usb;

pub use client::{ClientError, ClientId, ClientRegistry, ClientState, PeerInfo};
pub use config::DaemonConfig;
pub use device::{DeviceManager, DeviceTable};
pub use pollset::{FdOwner, PollSet};
pub use service::Daemon;
pub use store::{FilePairRecordStore, PairRecordStore};
