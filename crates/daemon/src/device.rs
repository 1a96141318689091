//! Device manager seam
//!
//! The client engine never talks to USB devices directly. Everything it needs
//! from the device side goes through [`DeviceManager`]: enumeration, starting
//! and aborting logical connections, and driving connected clients.

use crate::client::ClientId;
use nix::poll::PollFlags;
use protocol::{DeviceRecord, ResultCode};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, trace};

/// Operations the client engine consumes from the device side
///
/// Implementations must not call back into the registry while holding a lock
/// the registry might also need. The registry never holds its own lock while
/// calling any of these methods.
pub trait DeviceManager: Send + Sync {
    /// Current devices in attach order; hidden devices only when asked for
    fn device_list(&self, include_hidden: bool) -> Vec<DeviceRecord>;

    /// Begin a logical connection to `port` on `device_id` for `client`
    ///
    /// `Ok` means the attempt is in flight and the result will arrive later
    /// through `ClientRegistry::notify_connect`. `Err` carries the result
    /// code to send back right away.
    fn start_connect(&self, device_id: u32, port: u16, client: ClientId)
    -> Result<(), ResultCode>;

    /// Drop any half-open state for `client`; must finish before returning
    fn abort_connect(&self, device_id: u32, client: ClientId);

    /// Drive I/O for a client that has reached the connected state
    fn client_process(&self, device_id: u32, client: ClientId, events: PollFlags);

    /// Make a device visible to Listen and ListDevices
    fn set_visible(&self, device_id: u32);
}

#[derive(Debug, Clone)]
struct Entry {
    record: DeviceRecord,
    visible: bool,
}

/// In-memory device table
///
/// Records attached devices and their visibility. Logical connections are
/// refused: relaying bytes to a device is handled by a separate component.
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: Mutex<Vec<Entry>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device; it stays hidden until `set_visible`
    ///
    /// Re-adding a known id replaces its record and keeps its visibility.
    pub fn insert(&self, record: DeviceRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == record.id) {
            entry.record = record;
            return;
        }
        debug!("Device {} ({}) added", record.id, record.serial);
        entries.push(Entry {
            record,
            visible: false,
        });
    }

    /// Forget a device, returning its record
    pub fn remove(&self, device_id: u32) -> Option<DeviceRecord> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(|e| e.record.id == device_id)?;
        let entry = entries.remove(index);
        debug!("Device {} ({}) removed", device_id, entry.record.serial);
        Some(entry.record)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_visible(&self, device_id: u32) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.record.id == device_id && e.visible)
    }
}

impl DeviceManager for DeviceTable {
    fn device_list(&self, include_hidden: bool) -> Vec<DeviceRecord> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| include_hidden || e.visible)
            .map(|e| e.record.clone())
            .collect()
    }

    fn start_connect(
        &self,
        device_id: u32,
        port: u16,
        client: ClientId,
    ) -> Result<(), ResultCode> {
        if !self.is_visible(device_id) {
            debug!(
                "Client {} asked for unknown device {}",
                client, device_id
            );
            return Err(ResultCode::BAD_DEVICE);
        }

        info!(
            "Refusing connection from client {} to device {} port {}: no connection relay",
            client, device_id, port
        );
        Err(ResultCode::CONNECTION_REFUSED)
    }

    fn abort_connect(&self, device_id: u32, client: ClientId) {
        debug!("Abort connect for client {} on device {}", client, device_id);
    }

    fn client_process(&self, device_id: u32, client: ClientId, events: PollFlags) {
        trace!(
            "Ignoring events {:?} for client {} on device {}",
            events, client, device_id
        );
    }

    fn set_visible(&self, device_id: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == device_id) {
            entry.visible = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32) -> DeviceRecord {
        DeviceRecord {
            id,
            serial: format!("udid-{}", id),
            location: (2 << 16) | id,
            product_id: 0x12a8,
            speed: 480_000_000,
        }
    }

    #[test]
    fn test_hidden_until_visible() {
        let table = DeviceTable::new();
        table.insert(record(1));
        table.insert(record(2));

        assert!(table.device_list(false).is_empty());
        assert_eq!(table.device_list(true).len(), 2);

        table.set_visible(2);
        let visible = table.device_list(false);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, 2);
    }

    #[test]
    fn test_list_keeps_attach_order() {
        let table = DeviceTable::new();
        for id in [5, 3, 9] {
            table.insert(record(id));
            table.set_visible(id);
        }
        let ids: Vec<_> = table.device_list(false).iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_reinsert_replaces_record() {
        let table = DeviceTable::new();
        table.insert(record(1));
        table.set_visible(1);

        let mut updated = record(1);
        updated.speed = 5_000_000_000;
        table.insert(updated);

        assert_eq!(table.len(), 1);
        assert_eq!(table.device_list(false)[0].speed, 5_000_000_000);
    }

    #[test]
    fn test_remove() {
        let table = DeviceTable::new();
        table.insert(record(4));
        assert_eq!(table.remove(4).map(|r| r.id), Some(4));
        assert!(table.remove(4).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_start_connect_results() {
        let table = DeviceTable::new();
        table.insert(record(1));

        // Hidden devices cannot be connected to
        assert_eq!(
            table.start_connect(1, 62078, ClientId(0)),
            Err(ResultCode::BAD_DEVICE)
        );

        table.set_visible(1);
        assert_eq!(
            table.start_connect(1, 62078, ClientId(0)),
            Err(ResultCode::CONNECTION_REFUSED)
        );
        assert_eq!(
            table.start_connect(7, 62078, ClientId(0)),
            Err(ResultCode::BAD_DEVICE)
        );
    }
}
