//! Bridge wire format.
//!
//! Every frame is one line of UTF-8 JSON. Guests send [`BridgeMessage`]s,
//! discriminated by `type`; the host sends `{"type": ..., "data": ...}`
//! envelopes.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Message sent by a guest wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Handshake naming the tenant.
    Hello {
        /// Tenant identifier.
        #[serde(rename = "botId")]
        bot_id: String,
        /// Handshake token issued when the tenant was started.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// The script registered a command handler.
    RegisterCommand {
        /// Command name without prefix.
        command: String,
    },
    /// The script changed its command prefixes.
    SetPrefix {
        /// New prefixes.
        prefixes: Vec<String>,
    },
    /// Show a toast on the host.
    Toast {
        /// Message text.
        message: String,
    },
    /// Vibrate the host device.
    Vibrate {
        /// Duration in milliseconds.
        #[serde(default)]
        duration: u64,
    },
    /// Post a host notification.
    Notification {
        /// Notification title.
        title: String,
        /// Notification body.
        body: String,
    },
    /// Reply to a chat room.
    Reply {
        /// Target room.
        room: String,
        /// Reply text.
        message: String,
    },
}

impl BridgeMessage {
    /// Parse one inbound line.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` for malformed JSON, unknown types or
    /// missing fields.
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(line).map_err(|error| BridgeError::Protocol {
            message: error.to_string(),
        })
    }

    /// Parse one raw inbound line, rejecting invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` if the bytes are not UTF-8 or
    /// [`Self::parse`] fails.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, BridgeError> {
        let line = std::str::from_utf8(raw).map_err(|error| BridgeError::Protocol {
            message: format!("invalid UTF-8: {error}"),
        })?;
        Self::parse(line)
    }
}

/// Chat message forwarded to guests as a `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundChatMessage<'a> {
    /// Room the message arrived in.
    pub room: &'a str,
    /// Sender display name.
    pub sender: &'a str,
    /// Message text.
    pub message: &'a str,
    /// Whether the room is a group chat.
    #[serde(rename = "isGroup")]
    pub is_group: bool,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a T,
}

/// Encode an outbound envelope as a single line without the trailing
/// newline.
///
/// # Errors
///
/// Returns `BridgeError::Encode` if `data` cannot be serialised.
pub fn encode_event<T: Serialize>(event_type: &str, data: &T) -> Result<String, BridgeError> {
    serde_json::to_string(&Envelope { event_type, data }).map_err(|error| BridgeError::Encode {
        event_type: String::from(event_type),
        message: error.to_string(),
    })
}
