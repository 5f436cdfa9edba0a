//! Wire protocol between the client and the sync server.
//!
//! - [`action`]: action names
//! - [`frame`]: text/binary framing and the response envelope
//! - [`messages`]: typed JSON payloads

pub mod action;
pub mod frame;
pub mod messages;

pub use action::Action;
pub use frame::{CHUNK_PREFIX, ChunkFrame, Envelope, SESSION_ID_LEN, encode_raw, encode_text, split_binary, split_text};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Text frame has no action separator")]
    MissingSeparator,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary frame too short ({0} bytes)")]
    ShortFrame(usize),

    #[error("Invalid session id: {0}")]
    BadSessionId(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
