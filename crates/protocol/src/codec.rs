//! Message framing
//!
//! Joins the header with one of the two payload encodings. The header is
//! decoded once and the message type selects either the binary or the plist
//! codec; the two are never mixed inside one message.

use crate::binary;
use crate::error::Result;
use crate::header::{HEADER_SIZE, Header};
use crate::messages::{Reply, Request};
use crate::types::{ClientInfo, MessageType, WireVersion};
use crate::xml;

/// A request decoded from one complete message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Binary request; carries no client metadata
    Binary(Request),
    /// Plist request with the metadata fields it carried
    Plist { request: Request, info: ClientInfo },
}

impl Decoded {
    pub fn request(&self) -> &Request {
        match self {
            Decoded::Binary(request) => request,
            Decoded::Plist { request, .. } => request,
        }
    }
}

/// Decode the payload of a complete message
///
/// `message` must hold exactly `header.length` bytes, header included.
pub fn decode_request(header: &Header, message: &[u8]) -> Result<Decoded> {
    let payload = message.get(HEADER_SIZE..).unwrap_or_default();
    let payload = &payload[..payload.len().min(header.payload_len())];

    if header.message == MessageType::Plist.code() {
        let parsed = xml::decode_request(payload)?;
        Ok(Decoded::Plist {
            request: parsed.request,
            info: parsed.info,
        })
    } else {
        binary::decode_request(header.message, payload).map(Decoded::Binary)
    }
}

/// Encode a framed reply
///
/// `version` is the client's current wire version; replies without a binary
/// form are sent as plists either way.
pub fn encode_reply(version: WireVersion, tag: u32, reply: &Reply) -> Result<Vec<u8>> {
    let (message, payload) = match (version, binary::encode_reply(reply)) {
        (WireVersion::Binary, Some(encoded)) => encoded,
        _ => (MessageType::Plist, xml::encode_reply(reply)?),
    };

    Ok(frame(version, message, tag, &payload))
}

/// Prepend a header to `payload`
pub fn frame(version: WireVersion, message: MessageType, tag: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header {
        length: (HEADER_SIZE + payload.len()) as u32,
        version: version.code(),
        message: message.code(),
        tag,
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    header.encode_into(&mut out);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    #[test]
    fn test_binary_result_frame() {
        let bytes = encode_reply(WireVersion::Binary, 9, &Reply::Result(ResultCode::OK)).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);

        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.length, 20);
        assert_eq!(header.version, 0);
        assert_eq!(header.message, MessageType::Result.code());
        assert_eq!(header.tag, 9);
    }

    #[test]
    fn test_plist_result_frame() {
        let bytes =
            encode_reply(WireVersion::Plist, 3, &Reply::Result(ResultCode::BAD_COMMAND)).unwrap();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.version, 1);
        assert_eq!(header.message, MessageType::Plist.code());
        assert!(String::from_utf8_lossy(&bytes[HEADER_SIZE..]).contains("<string>Result</string>"));
    }

    #[test]
    fn test_plist_only_reply_for_binary_client() {
        let bytes = encode_reply(WireVersion::Binary, 1, &Reply::Buid("ABC".to_string())).unwrap();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.message, MessageType::Plist.code());
        assert_eq!(header.version, 0);
    }

    #[test]
    fn test_decode_binary_listen() {
        let bytes = frame(WireVersion::Binary, MessageType::Listen, 4, &[]);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(
            decode_request(&header, &bytes).unwrap(),
            Decoded::Binary(Request::Listen)
        );
    }

    #[test]
    fn test_decode_plist_listen() {
        let payload = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>MessageType</key><string>Listen</string>
<key>ProgName</key><string>tool</string></dict></plist>"#;
        let bytes = frame(WireVersion::Plist, MessageType::Plist, 4, payload);
        let header = Header::decode(&bytes).unwrap();
        let decoded = decode_request(&header, &bytes).unwrap();
        assert_eq!(decoded.request(), &Request::Listen);
        match decoded {
            Decoded::Plist { info, .. } => assert_eq!(info.prog_name.as_deref(), Some("tool")),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_stops_at_declared_length() {
        let payload = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>MessageType</key><string>Listen</string></dict></plist>"#;
        let mut bytes = frame(WireVersion::Plist, MessageType::Plist, 4, payload);
        let header = Header::decode(&bytes).unwrap();
        bytes.extend_from_slice(b"<junk>");

        let decoded = decode_request(&header, &bytes).unwrap();
        assert_eq!(decoded.request(), &Request::Listen);
    }
}
