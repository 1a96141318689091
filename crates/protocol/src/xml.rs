//! Property-list payload encoding (wire version 1)
//!
//! Requests are XML plist dictionaries whose `MessageType` string selects the
//! command. Replies are serialized from small serde structs.

use crate::error::{ProtocolError, Result};
use crate::messages::{Reply, Request};
use crate::types::{ClientInfo, DeviceRecord, ListenerEntry};
use plist::{Dictionary, Value};
use serde::Serialize;
use std::io::Cursor;

/// A parsed plist request together with the metadata it carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlistRequest {
    pub request: Request,
    pub info: ClientInfo,
}

/// Parse a plist request payload
///
/// Fails if the payload is not a well-formed XML dictionary with a string
/// `MessageType`. An unrecognized `MessageType` is not an error; it decodes
/// to [`Request::Unknown`].
pub fn decode_request(payload: &[u8]) -> Result<PlistRequest> {
    // Some client libraries send the terminating NUL of the XML string
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);

    let value = Value::from_reader_xml(Cursor::new(&payload[..end]))?;
    let dict = value
        .into_dictionary()
        .ok_or(ProtocolError::NotADictionary)?;

    let message_type = dict
        .get("MessageType")
        .and_then(Value::as_string)
        .ok_or(ProtocolError::MissingMessageType)?;

    let request = match message_type {
        "Listen" => Request::Listen,
        "Connect" => Request::Connect {
            device_id: dict.get("DeviceID").map(|v| uint_or_zero(v) as u32),
            // Sent in network byte order inside an integer
            port: dict
                .get("PortNumber")
                .map(|v| u16::from_be(uint_or_zero(v) as u16)),
        },
        "ListDevices" => Request::ListDevices,
        "ListListeners" => Request::ListListeners,
        "ReadBUID" => Request::ReadBuid,
        "ReadPairRecord" => Request::ReadPairRecord {
            record_id: string_field(&dict, "PairRecordID"),
        },
        "SavePairRecord" => Request::SavePairRecord {
            record_id: string_field(&dict, "PairRecordID"),
            record_data: dict
                .get("PairRecordData")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
            device_id: dict
                .get("DeviceID")
                .and_then(Value::as_unsigned_integer)
                .map(|id| id as u32)
                .filter(|&id| id > 0),
        },
        "DeletePairRecord" => Request::DeletePairRecord {
            record_id: string_field(&dict, "PairRecordID"),
        },
        other => Request::Unknown {
            name: other.to_string(),
        },
    };

    Ok(PlistRequest {
        request,
        info: client_info(&dict),
    })
}

/// Extract the client metadata fields present in a request
///
/// Fields of the wrong type are ignored rather than rejected.
pub fn client_info(dict: &Dictionary) -> ClientInfo {
    ClientInfo {
        bundle_id: string_field(dict, "BundleID"),
        client_version: string_field(dict, "ClientVersionString"),
        prog_name: string_field(dict, "ProgName"),
        lib_version: dict
            .get("kLibUSBMuxVersion")
            .and_then(Value::as_unsigned_integer),
    }
}

fn string_field(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

fn uint_or_zero(value: &Value) -> u64 {
    value.as_unsigned_integer().unwrap_or(0)
}

#[derive(Serialize)]
struct ResultMessage {
    #[serde(rename = "MessageType")]
    message_type: &'static str,
    #[serde(rename = "Number")]
    number: u64,
}

#[derive(Serialize)]
struct DeviceProperties<'a> {
    #[serde(rename = "ConnectionSpeed")]
    connection_speed: u64,
    #[serde(rename = "ConnectionType")]
    connection_type: &'static str,
    #[serde(rename = "DeviceID")]
    device_id: u64,
    #[serde(rename = "LocationID")]
    location_id: u64,
    #[serde(rename = "ProductID")]
    product_id: u64,
    #[serde(rename = "SerialNumber")]
    serial_number: &'a str,
}

#[derive(Serialize)]
struct AttachedMessage<'a> {
    #[serde(rename = "MessageType")]
    message_type: &'static str,
    #[serde(rename = "DeviceID")]
    device_id: u64,
    #[serde(rename = "Properties")]
    properties: DeviceProperties<'a>,
}

impl<'a> AttachedMessage<'a> {
    fn new(device: &'a DeviceRecord) -> Self {
        AttachedMessage {
            message_type: "Attached",
            device_id: device.id.into(),
            properties: DeviceProperties {
                connection_speed: device.speed,
                connection_type: "USB",
                device_id: device.id.into(),
                location_id: device.location.into(),
                product_id: device.product_id.into(),
                serial_number: &device.serial,
            },
        }
    }
}

#[derive(Serialize)]
struct DeviceEvent {
    #[serde(rename = "MessageType")]
    message_type: &'static str,
    #[serde(rename = "DeviceID")]
    device_id: u64,
}

#[derive(Serialize)]
struct DeviceListMessage<'a> {
    #[serde(rename = "DeviceList")]
    device_list: Vec<AttachedMessage<'a>>,
}

#[derive(Serialize)]
struct ListenerItem<'a> {
    #[serde(rename = "Blacklisted")]
    blacklisted: bool,
    #[serde(rename = "BundleID", skip_serializing_if = "Option::is_none")]
    bundle_id: Option<&'a str>,
    #[serde(rename = "ConnType")]
    conn_type: u64,
    #[serde(rename = "ID String")]
    id_string: String,
    #[serde(rename = "ProgName")]
    prog_name: &'a str,
    #[serde(rename = "kLibUSBMuxVersion")]
    lib_version: u64,
}

#[derive(Serialize)]
struct ListenerListMessage<'a> {
    #[serde(rename = "ListenerList")]
    listener_list: Vec<ListenerItem<'a>>,
}

#[derive(Serialize)]
struct BuidMessage<'a> {
    #[serde(rename = "BUID")]
    buid: &'a str,
}

#[derive(Serialize)]
struct PairRecordMessage<'a> {
    #[serde(rename = "PairRecordData", with = "serde_bytes")]
    data: &'a [u8],
}

fn listener_item(entry: &ListenerEntry) -> ListenerItem<'_> {
    ListenerItem {
        blacklisted: false,
        bundle_id: entry.info.bundle_id.as_deref(),
        conn_type: 0,
        id_string: entry.id_string(),
        prog_name: entry.prog_name(),
        lib_version: entry.info.lib_version.unwrap_or(0),
    }
}

/// Encode a reply as an XML plist payload
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match reply {
        Reply::Result(code) => plist::to_writer_xml(
            &mut out,
            &ResultMessage {
                message_type: "Result",
                number: code.0.into(),
            },
        )?,
        Reply::DeviceAttached(device) => {
            plist::to_writer_xml(&mut out, &AttachedMessage::new(device))?
        }
        Reply::DeviceDetached(id) => plist::to_writer_xml(
            &mut out,
            &DeviceEvent {
                message_type: "Detached",
                device_id: (*id).into(),
            },
        )?,
        Reply::DevicePaired(id) => plist::to_writer_xml(
            &mut out,
            &DeviceEvent {
                message_type: "Paired",
                device_id: (*id).into(),
            },
        )?,
        Reply::DeviceList(devices) => plist::to_writer_xml(
            &mut out,
            &DeviceListMessage {
                device_list: devices.iter().map(AttachedMessage::new).collect(),
            },
        )?,
        Reply::ListenerList(listeners) => plist::to_writer_xml(
            &mut out,
            &ListenerListMessage {
                listener_list: listeners.iter().map(listener_item).collect(),
            },
        )?,
        Reply::Buid(buid) => plist::to_writer_xml(&mut out, &BuidMessage { buid })?,
        Reply::PairRecord(data) => plist::to_writer_xml(&mut out, &PairRecordMessage { data })?,
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    fn xml_request(body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
{}
</dict>
</plist>
"#,
            body
        )
        .into_bytes()
    }

    fn parse_reply(bytes: &[u8]) -> Dictionary {
        Value::from_reader_xml(Cursor::new(bytes))
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    #[test]
    fn test_decode_connect_swaps_port() {
        // 62078 in network order, read as a little-endian integer
        let payload = xml_request(
            "<key>MessageType</key><string>Connect</string>\
             <key>DeviceID</key><integer>4</integer>\
             <key>PortNumber</key><integer>32498</integer>",
        );
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(
            parsed.request,
            Request::Connect {
                device_id: Some(4),
                port: Some(62078),
            }
        );
    }

    #[test]
    fn test_decode_connect_missing_fields() {
        let payload = xml_request("<key>MessageType</key><string>Connect</string>");
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(
            parsed.request,
            Request::Connect {
                device_id: None,
                port: None,
            }
        );
    }

    #[test]
    fn test_decode_collects_client_info() {
        let payload = xml_request(
            "<key>MessageType</key><string>ListDevices</string>\
             <key>BundleID</key><string>org.example.tool</string>\
             <key>ClientVersionString</key><string>libusbmuxd 2.0</string>\
             <key>ProgName</key><string>ideviceinfo</string>\
             <key>kLibUSBMuxVersion</key><integer>3</integer>",
        );
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(parsed.request, Request::ListDevices);
        assert_eq!(
            parsed.info,
            ClientInfo {
                bundle_id: Some("org.example.tool".to_string()),
                client_version: Some("libusbmuxd 2.0".to_string()),
                prog_name: Some("ideviceinfo".to_string()),
                lib_version: Some(3),
            }
        );
    }

    #[test]
    fn test_decode_ignores_mistyped_info() {
        let payload = xml_request(
            "<key>MessageType</key><string>ReadBUID</string>\
             <key>ProgName</key><integer>5</integer>\
             <key>kLibUSBMuxVersion</key><string>three</string>",
        );
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(parsed.request, Request::ReadBuid);
        assert_eq!(parsed.info, ClientInfo::default());
    }

    #[test]
    fn test_decode_save_pair_record() {
        let payload = xml_request(
            "<key>MessageType</key><string>SavePairRecord</string>\
             <key>PairRecordID</key><string>SERIAL1</string>\
             <key>PairRecordData</key><data>AQID</data>\
             <key>DeviceID</key><integer>9</integer>",
        );
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(
            parsed.request,
            Request::SavePairRecord {
                record_id: Some("SERIAL1".to_string()),
                record_data: Some(vec![1, 2, 3]),
                device_id: Some(9),
            }
        );
    }

    #[test]
    fn test_decode_save_pair_record_zero_device_id() {
        let payload = xml_request(
            "<key>MessageType</key><string>SavePairRecord</string>\
             <key>PairRecordID</key><string>SERIAL1</string>\
             <key>PairRecordData</key><string>not data</string>\
             <key>DeviceID</key><integer>0</integer>",
        );
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(
            parsed.request,
            Request::SavePairRecord {
                record_id: Some("SERIAL1".to_string()),
                record_data: None,
                device_id: None,
            }
        );
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let payload = xml_request("<key>MessageType</key><string>Reboot</string>");
        let parsed = decode_request(&payload).unwrap();
        assert_eq!(
            parsed.request,
            Request::Unknown {
                name: "Reboot".to_string()
            }
        );
    }

    #[test]
    fn test_decode_trailing_nul() {
        let mut payload = xml_request("<key>MessageType</key><string>Listen</string>");
        payload.push(0);
        assert_eq!(decode_request(&payload).unwrap().request, Request::Listen);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            decode_request(b"<plist><dict><key>"),
            Err(ProtocolError::Plist(_))
        ));

        let array = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><array><string>Listen</string></array></plist>"#;
        assert!(matches!(
            decode_request(array),
            Err(ProtocolError::NotADictionary)
        ));

        let payload = xml_request("<key>MessageType</key><integer>1</integer>");
        assert!(matches!(
            decode_request(&payload),
            Err(ProtocolError::MissingMessageType)
        ));
    }

    #[test]
    fn test_encode_result() {
        let bytes = encode_reply(&Reply::Result(ResultCode::BAD_DEVICE)).unwrap();
        let dict = parse_reply(&bytes);
        assert_eq!(
            dict.get("MessageType").and_then(Value::as_string),
            Some("Result")
        );
        assert_eq!(
            dict.get("Number").and_then(Value::as_unsigned_integer),
            Some(2)
        );
    }

    #[test]
    fn test_encode_attached() {
        let device = DeviceRecord {
            id: 12,
            serial: "abc".to_string(),
            location: 0x0002_0005,
            product_id: 0x12a8,
            speed: 480_000_000,
        };
        let dict = parse_reply(&encode_reply(&Reply::DeviceAttached(device)).unwrap());
        assert_eq!(
            dict.get("MessageType").and_then(Value::as_string),
            Some("Attached")
        );
        let props = dict
            .get("Properties")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(
            props.get("ConnectionType").and_then(Value::as_string),
            Some("USB")
        );
        assert_eq!(
            props.get("LocationID").and_then(Value::as_unsigned_integer),
            Some(0x0002_0005)
        );
        assert_eq!(
            props.get("SerialNumber").and_then(Value::as_string),
            Some("abc")
        );
    }

    #[test]
    fn test_encode_listener_list() {
        let listeners = vec![
            ListenerEntry {
                number: 2,
                info: ClientInfo {
                    bundle_id: Some("org.example".to_string()),
                    prog_name: Some("tool".to_string()),
                    lib_version: Some(3),
                    ..ClientInfo::default()
                },
            },
            ListenerEntry {
                number: 5,
                info: ClientInfo::default(),
            },
        ];
        let dict = parse_reply(&encode_reply(&Reply::ListenerList(listeners)).unwrap());
        let list = dict
            .get("ListenerList")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(list.len(), 2);

        let first = list[0].as_dictionary().unwrap();
        assert_eq!(
            first.get("ID String").and_then(Value::as_string),
            Some("2-tool")
        );
        assert_eq!(
            first.get("BundleID").and_then(Value::as_string),
            Some("org.example")
        );

        let second = list[1].as_dictionary().unwrap();
        assert!(second.get("BundleID").is_none());
        assert_eq!(
            second.get("ProgName").and_then(Value::as_string),
            Some("unknown")
        );
        assert_eq!(
            second
                .get("kLibUSBMuxVersion")
                .and_then(Value::as_unsigned_integer),
            Some(0)
        );
    }

    #[test]
    fn test_encode_pair_record_is_data() {
        let dict = parse_reply(&encode_reply(&Reply::PairRecord(vec![9, 8, 7])).unwrap());
        assert_eq!(
            dict.get("PairRecordData").and_then(Value::as_data),
            Some(&[9u8, 8, 7][..])
        );
    }
}
