//! Request dispatch for clients in the command state

use super::{ClientId, ClientRegistry, ClientState};
use crate::store::errno_of;
use nix::errno::Errno;
use protocol::{
    Decoded, Header, ListenerEntry, Reply, Request, ResultCode, WireVersion, decode_request,
};
use tracing::{debug, error, info, warn};

impl ClientRegistry {
    /// Validate and run one complete framed message
    pub(super) fn handle_message(&self, id: ClientId, message: &[u8]) {
        let header = match Header::decode(message) {
            Ok(header) => header,
            Err(e) => {
                error!("Client {} sent an undecodable header: {}", id, e);
                self.close(id);
                return;
            }
        };
        let tag = header.tag;

        let request = {
            let mut inner = self.lock();
            let Some(client) = inner.get_mut(id) else {
                return;
            };

            if client.state != ClientState::Command {
                error!(
                    "Client {} command received in the wrong state {}",
                    id, client.state
                );
                client.queue(tag, &Reply::Result(ResultCode::BAD_COMMAND));
                if let Err(e) = client.flush() {
                    debug!("Client {} best-effort reply not sent: {}", id, e);
                }
                drop(inner);
                self.close(id);
                return;
            }

            if WireVersion::from_code(header.version).is_none() {
                error!(
                    "Client {} version mismatch: expected 0 or 1, got {}",
                    id, header.version
                );
                client.queue(tag, &Reply::Result(ResultCode::BAD_VERSION));
                return;
            }

            match decode_request(&header, message) {
                Ok(Decoded::Binary(request)) => request,
                Ok(Decoded::Plist { request, info }) => {
                    client.version = WireVersion::Plist;
                    client.info = info;
                    request
                }
                Err(e) if e.is_fatal() => {
                    error!("Client {} sent a malformed message: {}", id, e);
                    drop(inner);
                    self.close(id);
                    return;
                }
                Err(e) => {
                    warn!("Client {} sent a bad command: {}", id, e);
                    client.queue(tag, &Reply::Result(ResultCode::BAD_COMMAND));
                    return;
                }
            }
        };

        debug!("Client {} command {} tag {}", id, request.name(), tag);
        self.dispatch(id, tag, request);
    }

    fn dispatch(&self, id: ClientId, tag: u32, request: Request) {
        match request {
            Request::Listen => self.start_listen(id, tag),
            Request::Connect { device_id, port } => self.start_connect(id, tag, device_id, port),
            Request::ListDevices => {
                let devices = self.devices.device_list(false);
                self.reply(id, tag, &Reply::DeviceList(devices));
            }
            Request::ListListeners => self.send_listener_list(id, tag),
            Request::ReadBuid => {
                let reply = match self.records.system_buid() {
                    Ok(buid) => Reply::Buid(buid),
                    Err(e) => {
                        error!("Could not read system BUID: {}", e);
                        Reply::Result(ResultCode::from_errno(errno_of(&e)))
                    }
                };
                self.reply(id, tag, &reply);
            }
            Request::ReadPairRecord { record_id } => {
                let reply = self.read_pair_record(record_id.as_deref());
                self.reply(id, tag, &reply);
            }
            Request::SavePairRecord {
                record_id,
                record_data,
                device_id,
            } => {
                let result = self.save_pair_record(record_id, record_data, device_id);
                self.reply(id, tag, &Reply::Result(result));
            }
            Request::DeletePairRecord { record_id } => {
                let result = match record_id {
                    None => errno_result(Errno::EINVAL),
                    Some(record_id) => match self.records.delete_record(&record_id) {
                        Ok(()) => ResultCode::OK,
                        Err(e) => {
                            warn!("Could not delete pair record {}: {}", record_id, e);
                            ResultCode::from_errno(errno_of(&e))
                        }
                    },
                };
                self.reply(id, tag, &Reply::Result(result));
            }
            Request::Unknown { name } => {
                error!("Unexpected command '{}' received from client {}", name, id);
                self.reply(id, tag, &Reply::Result(ResultCode::BAD_COMMAND));
            }
        }
    }

    fn start_listen(&self, id: ClientId, tag: u32) {
        let devices = self.devices.device_list(false);

        let mut inner = self.lock();
        let Some(client) = inner.get_mut(id) else {
            return;
        };
        client.queue(tag, &Reply::Result(ResultCode::OK));
        if let Err(e) = client.set_state(ClientState::Listen) {
            error!("Client {} cannot listen: {}", id, e);
            return;
        }
        for device in devices {
            client.queue(0, &Reply::DeviceAttached(device));
        }
    }

    fn start_connect(&self, id: ClientId, tag: u32, device_id: Option<u32>, port: Option<u16>) {
        let Some(device_id) = device_id else {
            error!("Client {} sent a connect request without device id", id);
            self.reply(id, tag, &Reply::Result(ResultCode::BAD_DEVICE));
            return;
        };
        let Some(port) = port else {
            error!("Client {} sent a connect request without port number", id);
            self.reply(id, tag, &Reply::Result(ResultCode::BAD_COMMAND));
            return;
        };

        // Enter CONNECTING1 first; the result may arrive before start_connect returns
        {
            let mut inner = self.lock();
            let Some(client) = inner.get_mut(id) else {
                return;
            };
            if let Err(e) = client.set_state(ClientState::Connecting1) {
                error!("Client {} cannot connect: {}", id, e);
                return;
            }
            client.connect_tag = tag;
            client.connect_device = device_id;
        }

        debug!(
            "Client {} requesting connection to device {} port {}",
            id, device_id, port
        );
        if let Err(result) = self.devices.start_connect(device_id, port, id) {
            let mut inner = self.lock();
            let Some(client) = inner.get_mut(id) else {
                return;
            };
            if client.state != ClientState::Connecting1 {
                return;
            }
            if let Err(e) = client.set_state(ClientState::Command) {
                error!("Client {}: {}", id, e);
                return;
            }
            client.queue(tag, &Reply::Result(result));
        }
    }

    fn send_listener_list(&self, id: ClientId, tag: u32) {
        let mut inner = self.lock();
        let listeners: Vec<ListenerEntry> = inner
            .clients
            .iter()
            .filter(|c| c.state == ClientState::Listen)
            // Upstream usbmuxd puts the requester's number in every entry's
            // `ID String`; each entry here carries the listener's own number
            .map(|c| ListenerEntry {
                number: c.id.0,
                info: c.info.clone(),
            })
            .collect();

        if let Some(client) = inner.get_mut(id) {
            client.queue(tag, &Reply::ListenerList(listeners));
        }
    }

    fn read_pair_record(&self, record_id: Option<&str>) -> Reply {
        let Some(record_id) = record_id else {
            return Reply::Result(errno_result(Errno::EINVAL));
        };

        match self.records.read_record(record_id) {
            Ok(Some(data)) => Reply::PairRecord(data),
            Ok(None) => Reply::Result(errno_result(Errno::ENOENT)),
            Err(e) => {
                warn!("Could not read pair record {}: {}", record_id, e);
                Reply::Result(ResultCode::from_errno(errno_of(&e)))
            }
        }
    }

    fn save_pair_record(
        &self,
        record_id: Option<String>,
        record_data: Option<Vec<u8>>,
        device_id: Option<u32>,
    ) -> ResultCode {
        let (Some(record_id), Some(record_data)) = (record_id, record_data) else {
            return errno_result(Errno::EINVAL);
        };

        if let Err(e) = self.records.save_record(&record_id, &record_data) {
            warn!("Could not save pair record {}: {}", record_id, e);
            return ResultCode::from_errno(errno_of(&e));
        }

        if let Some(device_id) = device_id {
            let connected = self
                .devices
                .device_list(true)
                .iter()
                .any(|d| d.id == device_id && d.serial == record_id);
            if connected {
                info!("Device {} ({}) paired", device_id, record_id);
                self.device_paired(device_id);
            } else {
                error!(
                    "SavePairRecord: device {} ({}) is not connected",
                    device_id, record_id
                );
            }
        }
        ResultCode::OK
    }
}

fn errno_result(errno: Errno) -> ResultCode {
    ResultCode::from_errno(errno as i32)
}
