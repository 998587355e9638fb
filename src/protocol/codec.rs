//! Packet encoding and decoding.
//!
//! Decoding is deliberately paranoid: it is fed by remote peers and must
//! never panic, whatever arrives. It only checks shape: an envelope that
//! parses, an integer `packet` tag, payload fields of the right types.
//! Whether the *sender* was allowed to produce the packet is decided later
//! by the router.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::MAX_PACKET_SIZE;
use super::packet::{
    ConnectionAbuse, ConnectionUpdate, FileAction, FileConsume, FileListing, FileRequest, Packet,
    TerminalContents, TerminalInfo, TerminalKey, TerminalMouse, TerminalPaste, code,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet exceeds {MAX_PACKET_SIZE} bytes ({0})")]
    TooLarge(usize),

    #[error("packet is not valid JSON: {0}")]
    Syntax(serde_json::Error),

    #[error("packet is not a JSON object")]
    NotAnObject,

    #[error("packet envelope has no integer `packet` tag")]
    MissingTag,

    #[error("malformed {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("could not encode packet: {0}")]
    Encode(serde_json::Error),
}

/// Decode one wire message. Anything that is not a syntactically valid
/// envelope yields an error; a valid envelope with an unrecognized tag
/// decodes as [`Packet::Unknown`].
pub fn decode(text: &str) -> Result<Packet, CodecError> {
    if text.len() > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge(text.len()));
    }
    let value: Value = serde_json::from_str(text).map_err(CodecError::Syntax)?;
    let Value::Object(ref fields) = value else {
        return Err(CodecError::NotAnObject);
    };
    let tag = fields
        .get("packet")
        .and_then(Value::as_u64)
        .ok_or(CodecError::MissingTag)?;

    match tag {
        code::CONNECTION_UPDATE => {
            payload::<ConnectionUpdate>(value, "ConnectionUpdate").map(Packet::ConnectionUpdate)
        }
        code::CONNECTION_ABUSE => {
            payload::<ConnectionAbuse>(value, "ConnectionAbuse").map(Packet::ConnectionAbuse)
        }
        code::CONNECTION_PING => Ok(Packet::ConnectionPing),
        code::TERMINAL_CONTENTS => {
            payload::<TerminalContents>(value, "TerminalContents").map(Packet::TerminalContents)
        }
        code::TERMINAL_INFO => {
            payload::<TerminalInfo>(value, "TerminalInfo").map(Packet::TerminalInfo)
        }
        code::TERMINAL_PASTE => {
            payload::<TerminalPaste>(value, "TerminalPaste").map(Packet::TerminalPaste)
        }
        code::TERMINAL_KEY => payload::<TerminalKey>(value, "TerminalKey").map(Packet::TerminalKey),
        code::TERMINAL_MOUSE => {
            payload::<TerminalMouse>(value, "TerminalMouse").map(Packet::TerminalMouse)
        }
        code::FILE_LISTING => payload::<FileListing>(value, "FileListing").map(Packet::FileListing),
        code::FILE_REQUEST => payload::<FileRequest>(value, "FileRequest").map(Packet::FileRequest),
        code::FILE_ACTION => payload::<FileAction>(value, "FileAction").map(Packet::FileAction),
        code::FILE_CONSUME => payload::<FileConsume>(value, "FileConsume").map(Packet::FileConsume),
        other => Ok(Packet::Unknown { packet: other }),
    }
}

/// Encode a packet to its wire form.
pub fn encode(packet: &Packet) -> Result<String, CodecError> {
    let mut value = match packet {
        Packet::ConnectionUpdate(p) => to_value(p)?,
        Packet::ConnectionAbuse(p) => to_value(p)?,
        Packet::ConnectionPing => Value::Object(Map::new()),
        Packet::TerminalContents(p) => to_value(p)?,
        Packet::TerminalInfo(p) => to_value(p)?,
        Packet::TerminalPaste(p) => to_value(p)?,
        Packet::TerminalKey(p) => to_value(p)?,
        Packet::TerminalMouse(p) => to_value(p)?,
        Packet::FileListing(p) => to_value(p)?,
        Packet::FileRequest(p) => to_value(p)?,
        Packet::FileAction(p) => to_value(p)?,
        Packet::FileConsume(p) => to_value(p)?,
        Packet::Unknown { .. } => Value::Object(Map::new()),
    };
    let Value::Object(ref mut fields) = value else {
        // Payloads are all structs; serde_json renders them as objects.
        return Err(CodecError::NotAnObject);
    };
    fields.insert("packet".to_owned(), Value::from(packet.code()));
    serde_json::to_string(&value).map_err(CodecError::Encode)
}

fn payload<T: DeserializeOwned>(value: Value, kind: &'static str) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|source| CodecError::InvalidPayload { kind, source })
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, CodecError> {
    serde_json::to_value(payload).map_err(CodecError::Encode)
}
