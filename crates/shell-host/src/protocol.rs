//! Control messages exchanged over the shell connection.
//!
//! Client-to-server frames are small JSON envelopes; server-to-client
//! frames are raw terminal bytes with no envelope.

use serde::{Deserialize, Serialize};

/// Terminal dimensions carried by a resize message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

/// Inbound envelope. Exactly two shapes are recognized; any other valid
/// JSON falls through to `Unrecognized` and is dropped by the bridge
/// rather than guessed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    /// Keystroke/paste bytes, written verbatim to the process.
    Input { input: String },
    /// Terminal dimension change. Non-integer or missing fields do not
    /// match this variant and end up in `Unrecognized`.
    Resize { resize: WindowSize },
    Unrecognized(serde_json::Value),
}

impl ControlMessage {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
