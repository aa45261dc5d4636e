use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CC_REQUEST: u8 = 1;
pub const CC_REPLY: u8 = 2;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Missing payload for {0}")]
    MissingPayload(&'static str),
}

/// Envelope shared by every request the core handles. Frames without
/// `cc == 1` belong to the document store protocol.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Envelope {
    #[serde(default)]
    pub cc: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JoinRequest {
    pub channel: String,
    pub username: String,
    pub id: String,
}

#[derive(Deserialize)]
struct AvailabilityRequest {
    channel: String,
}

#[derive(Debug, PartialEq)]
pub enum ClientMessage {
    RequestJoinRoom(JoinRequest),
    ChannelAvailable { channel: String },
    EditorEvent,
    GetEditorsValues { version: u64 },
    Unknown(String),
}

impl ClientMessage {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        let message = match envelope.kind.as_str() {
            "request-join-room" => {
                let payload = envelope
                    .payload
                    .clone()
                    .ok_or(MessageError::MissingPayload("request-join-room"))?;
                ClientMessage::RequestJoinRoom(serde_json::from_value(payload)?)
            }
            "channel-available" => {
                let channel = match (&envelope.payload, &envelope.channel) {
                    (Some(payload @ Value::Object(_)), _) => {
                        serde_json::from_value::<AvailabilityRequest>(payload.clone())?.channel
                    }
                    (_, Some(channel)) => channel.clone(),
                    _ => return Err(MessageError::MissingPayload("channel-available")),
                };
                ClientMessage::ChannelAvailable { channel }
            }
            "editor-event" => ClientMessage::EditorEvent,
            "get-editors-values" => {
                let payload = envelope
                    .payload
                    .clone()
                    .ok_or(MessageError::MissingPayload("get-editors-values"))?;
                ClientMessage::GetEditorsValues { version: serde_json::from_value(payload)? }
            }
            other => ClientMessage::Unknown(other.to_string()),
        };
        Ok(message)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct Reply {
    pub cc: u8,
    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub payload: Value,
}

impl Reply {
    pub fn to(request: &Envelope, payload: Value) -> Self {
        Reply {
            cc: CC_REPLY,
            message_id: request.message_id.clone(),
            ns: request.ns.clone(),
            channel: request.channel.clone(),
            payload,
        }
    }

    /// Names the channel the reply concerns at the top level.
    #[must_use]
    pub fn in_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub id: String,
    pub ns: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileContents {
    pub value_before: String,
    pub value_after: String,
}

/// A burst of editing activity folded into a single history entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditGroup {
    pub from_version: u64,
    pub to_version: u64,
    pub files: Vec<String>,
    pub users: Vec<String>,
    pub file_contents: BTreeMap<String, FileContents>,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

/// Entries the server itself writes into the chat transcript. Clients add
/// entries of their own types alongside these.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEntry {
    Join { uid: String, timestamp: i64 },
    Left { uid: String, timestamp: i64 },
    Edit(EditGroup),
}
