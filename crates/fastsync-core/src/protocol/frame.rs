//! Text and binary frame layouts.
//!
//! Text: `<Action>|<payload>`, split at the first `|`.
//! Binary: `[2-byte ASCII prefix][payload]`; the file-chunk payload (prefix `00`) is
//! `[36-byte session id][u32 big-endian chunk index][chunk bytes]`.

use super::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch prefix of file-chunk frames.
pub const CHUNK_PREFIX: [u8; 2] = *b"00";
/// Length of a session id on the wire.
pub const SESSION_ID_LEN: usize = 36;
const HEADER_LEN: usize = SESSION_ID_LEN + 4;

/// Build a text frame with a JSON payload.
pub fn encode_text<T: Serialize>(action: &str, payload: &T) -> Result<String> {
    Ok(format!("{}|{}", action, serde_json::to_string(payload)?))
}

/// Build a text frame with a raw string payload (the authorization token).
pub fn encode_raw(action: &str, payload: &str) -> String {
    format!("{}|{}", action, payload)
}

/// Split a text frame into action and payload.
pub fn split_text(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('|').ok_or(ProtocolError::MissingSeparator)
}

/// Server response wrapper around every inbound payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    pub code: i64,
    pub status: Option<bool>,
    pub msg: String,
    pub details: Option<Value>,
    pub data: Value,
}

impl Envelope {
    pub fn parse(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// `code == 0` and codes above 200 are failures.
    pub fn is_error(&self) -> bool {
        self.code == 0 || self.code > 200
    }

    /// Human-readable failure description.
    pub fn describe_error(&self) -> String {
        let details = match &self.details {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        format!("Code={} Msg={} {}", self.code, self.msg, details)
            .trim_end()
            .to_string()
    }

    /// Vault the payload is addressed to, if it names one.
    pub fn vault(&self) -> Option<&str> {
        self.data.get("vault").and_then(Value::as_str)
    }
}

/// Split the dispatch prefix from a binary frame.
pub fn split_binary(frame: &[u8]) -> Option<([u8; 2], &[u8])> {
    if frame.len() < 2 {
        return None;
    }
    Some(([frame[0], frame[1]], &frame[2..]))
}

/// One file chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub session_id: &'a str,
    pub index: u32,
    pub data: &'a [u8],
}

impl<'a> ChunkFrame<'a> {
    /// Encode with the `00` prefix, ready to send.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let id = self.session_id.as_bytes();
        if id.len() != SESSION_ID_LEN {
            return Err(ProtocolError::BadSessionId(self.session_id.to_string()));
        }
        let mut frame = Vec::with_capacity(2 + HEADER_LEN + self.data.len());
        frame.extend_from_slice(&CHUNK_PREFIX);
        frame.extend_from_slice(id);
        frame.extend_from_slice(&self.index.to_be_bytes());
        frame.extend_from_slice(self.data);
        Ok(frame)
    }

    /// Decode a chunk payload (prefix already stripped).
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < HEADER_LEN {
            return Err(ProtocolError::ShortFrame(payload.len()));
        }
        let session_id = std::str::from_utf8(&payload[..SESSION_ID_LEN])
            .map_err(|_| ProtocolError::BadSessionId(String::from_utf8_lossy(&payload[..SESSION_ID_LEN]).into_owned()))?;
        let mut index = [0u8; 4];
        index.copy_from_slice(&payload[SESSION_ID_LEN..HEADER_LEN]);
        Ok(Self {
            session_id,
            index: u32::from_be_bytes(index),
            data: &payload[HEADER_LEN..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "123e4567-e89b-12d3-a456-426614174000";

    #[test]
    fn test_split_at_first_separator() {
        let (action, payload) = split_text(r#"NoteSyncModify|{"content":"a|b"}"#).unwrap();
        assert_eq!(action, "NoteSyncModify");
        assert_eq!(payload, r#"{"content":"a|b"}"#);
        assert!(split_text("no separator").is_err());
    }

    #[test]
    fn test_encode_text() {
        let frame = encode_text("NoteDelete", &serde_json::json!({"path": "a.md"})).unwrap();
        assert_eq!(frame, r#"NoteDelete|{"path":"a.md"}"#);
        assert_eq!(encode_raw("Authorization", "token"), "Authorization|token");
    }

    #[test]
    fn test_envelope_error_codes() {
        let ok = Envelope::parse(r#"{"code":1,"msg":"ok","data":{"vault":"v"}}"#).unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.vault(), Some("v"));

        let zero = Envelope::parse(r#"{"code":0,"msg":"bad","details":"token expired"}"#).unwrap();
        assert!(zero.is_error());
        assert_eq!(zero.describe_error(), "Code=0 Msg=bad token expired");

        let high = Envelope::parse(r#"{"code":401}"#).unwrap();
        assert!(high.is_error());
        assert!(!Envelope::parse(r#"{"code":200}"#).unwrap().is_error());
    }

    #[test]
    fn test_chunk_frame_layout() {
        let frame = ChunkFrame {
            session_id: SESSION,
            index: 258,
            data: b"xyz",
        }
        .encode()
        .unwrap();

        assert_eq!(&frame[..2], b"00");
        assert_eq!(&frame[2..38], SESSION.as_bytes());
        assert_eq!(&frame[38..42], &[0, 0, 1, 2]);
        assert_eq!(&frame[42..], b"xyz");

        let (prefix, payload) = split_binary(&frame).unwrap();
        assert_eq!(prefix, CHUNK_PREFIX);
        let decoded = ChunkFrame::decode(payload).unwrap();
        assert_eq!(decoded.session_id, SESSION);
        assert_eq!(decoded.index, 258);
        assert_eq!(decoded.data, b"xyz");
    }

    #[test]
    fn test_short_or_malformed_frames_are_errors() {
        assert!(split_binary(b"0").is_none());
        assert!(matches!(ChunkFrame::decode(b"short"), Err(ProtocolError::ShortFrame(5))));
        let bad = ChunkFrame {
            session_id: "too-short",
            index: 0,
            data: b"",
        };
        assert!(bad.encode().is_err());
    }
}
