//! Envelope encoding for director/worker frames.
//!
//! Each frame is a length-prefixed JSON envelope `{"v": .., "type": .., "body": ..}`.
//! The version and type are read before the body, so an unknown type can be
//! skipped without understanding its payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;
use tracing::warn;

use crate::error::{CookError, Result};

use super::{message::*, transport::Inbound};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length-delimited framing with a 4-byte prefix.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    v: u32,
    #[serde(rename = "type")]
    kind: &'a str,
    body: serde_json::Value,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    v: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: serde_json::Value,
}

/// A successfully parsed frame.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// Well-formed envelope with a type this build does not know.
    Unknown(String),
}

/// Wraps `message` in a versioned envelope.
pub fn encode(message: &Message) -> Result<Bytes> {
    let body = match message {
        Message::Connect(body) => serde_json::to_value(body)?,
        Message::AssignPackages(body) => serde_json::to_value(body)?,
        Message::AbortPackages(body) => serde_json::to_value(body)?,
        Message::PackageResults(body) => serde_json::to_value(body)?,
        Message::Heartbeat(body) => serde_json::to_value(body)?,
        Message::AbortWorker(body) => serde_json::to_value(body)?,
    };
    let envelope = EnvelopeOut {
        v: PROTOCOL_VERSION,
        kind: message.kind(),
        body,
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Parses one frame. Unknown types decode to [`Decoded::Unknown`].
pub fn decode(frame: &[u8]) -> Result<Decoded> {
    let envelope: EnvelopeIn = serde_json::from_slice(frame)
        .map_err(|err| CookError::Protocol(format!("malformed envelope: {err}")))?;
    if envelope.v != PROTOCOL_VERSION {
        // a foreign connect still reaches the handshake so the peer is refused cleanly
        if envelope.kind == "connect"
            && let Ok(mut connect) = parse_body::<Connect>(&envelope.kind, envelope.body)
        {
            connect.protocol_version = envelope.v;
            return Ok(Decoded::Message(Message::Connect(connect)));
        }
        return Err(CookError::Protocol(format!(
            "protocol version {} not supported (expected {PROTOCOL_VERSION})",
            envelope.v
        )));
    }
    let body = envelope.body;
    let message = match envelope.kind.as_str() {
        "connect" => Message::Connect(parse_body(&envelope.kind, body)?),
        "assign_packages" => Message::AssignPackages(parse_body(&envelope.kind, body)?),
        "abort_packages" => Message::AbortPackages(parse_body(&envelope.kind, body)?),
        "package_results" => Message::PackageResults(parse_body(&envelope.kind, body)?),
        "heartbeat" => Message::Heartbeat(parse_body(&envelope.kind, body)?),
        "abort_worker" => Message::AbortWorker(parse_body(&envelope.kind, body)?),
        _ => return Ok(Decoded::Unknown(envelope.kind)),
    };
    Ok(Decoded::Message(message))
}

fn parse_body<T: for<'de> Deserialize<'de>>(kind: &str, body: serde_json::Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|err| CookError::Protocol(format!("malformed {kind} body: {err}")))
}

/// Turns a raw frame into what a connection hands the scheduler. Unknown
/// message types are logged and dropped.
pub fn decode_inbound(frame: &[u8]) -> Option<Inbound> {
    match decode(frame) {
        Ok(Decoded::Message(message)) => Some(Inbound::Message(message)),
        Ok(Decoded::Unknown(kind)) => {
            warn!(target: "cook::transport", %kind, "unknown message type dropped");
            None
        }
        Err(err) => Some(Inbound::ProtocolError(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cook::item::{Instigator, Urgency},
        types::{ItemId, Platform, WorkerId},
    };

    #[test]
    fn assignment_survives_the_wire() {
        let message = Message::AssignPackages(AssignPackages {
            items: vec![AssignedItem {
                id: ItemId::new("/Game/Hero"),
                platforms: vec![Platform::new("linux")],
                urgency: Urgency::High,
                instigator: Instigator::RuntimeDependency(ItemId::new("/Game/Map")),
            }],
            existence: Vec::new(),
        });
        let frame = encode(&message).unwrap();
        assert_eq!(decode(&frame).unwrap(), Decoded::Message(message));
    }

    #[test]
    fn envelope_names_the_type() {
        let frame = encode(&Message::Connect(Connect {
            worker_id: WorkerId(3),
            protocol_version: PROTOCOL_VERSION,
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["type"], "connect");
        assert_eq!(value["v"], PROTOCOL_VERSION);
    }

    #[test]
    fn unknown_type_is_dropped_not_an_error() {
        let frame = br#"{"v":1,"type":"shader_stats","body":{"x":1}}"#;
        assert_eq!(decode(frame).unwrap(), Decoded::Unknown("shader_stats".into()));
        assert!(decode_inbound(frame).is_none());
    }

    #[test]
    fn connect_from_another_version_reaches_the_handshake() {
        let frame = br#"{"v":7,"type":"connect","body":{"worker_id":2,"protocol_version":7}}"#;
        assert_eq!(
            decode(frame).unwrap(),
            Decoded::Message(Message::Connect(Connect {
                worker_id: WorkerId(2),
                protocol_version: 7,
            }))
        );

        // the envelope wins over a body claiming the current version
        let frame = format!(
            r#"{{"v":7,"type":"connect","body":{{"worker_id":2,"protocol_version":{PROTOCOL_VERSION}}}}}"#
        );
        let Decoded::Message(Message::Connect(connect)) = decode(frame.as_bytes()).unwrap() else {
            panic!("expected a connect");
        };
        assert_eq!(connect.protocol_version, 7);
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(
            decode_inbound(b"not json"),
            Some(Inbound::ProtocolError(_))
        ));
        assert!(matches!(
            decode_inbound(br#"{"v":1,"type":"heartbeat","body":{"number":"x"}}"#),
            Some(Inbound::ProtocolError(_))
        ));
        assert!(matches!(
            decode_inbound(br#"{"v":99,"type":"heartbeat","body":{"number":1}}"#),
            Some(Inbound::ProtocolError(_))
        ));
    }
}
