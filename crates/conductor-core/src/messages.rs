//! Relay wire messages.
//!
//! Every text frame is decoded exactly once into an [`Inbound`] value at the
//! connection boundary. Downstream traffic is then narrowed to a
//! [`CommandMessage`], upstream traffic to an [`UpstreamReply`].
//!
//! ```text
//! client   → relay : {"command": "...", "args": ..., "secret": "...", "messageId": 7}
//! relay    → host  : {"messageId": 3, "secret": "<handshake secret>", "command": "...", "args": ...}
//! host     → relay : {"messageId": 3, ...result fields}
//! relay    → client: {"messageId": 7, ...result fields}
//! relay    → client: {"success": false, "error": "...", "messageId"?: 7}
//! ```

use crate::error::{ConductorError, ConductorResult, Rejection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of the handshake frame sent by the injected payload.
pub const HANDSHAKE_PREFIX: &str = "init:";

/// Control frame the upstream sends to ask the relay to exit.
pub const TERMINATE_FRAME: &str = "Terminate";

/// Field carrying request identifiers in both directions.
pub const MESSAGE_ID: &str = "messageId";

/// A text frame decoded at the connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `init:<secret>` handshake; holds everything after the prefix.
    Handshake(String),
    /// The literal `Terminate` control frame.
    Terminate,
    /// A JSON object.
    Object(Map<String, Value>),
    /// Valid JSON that is not an object.
    NotObject,
    /// Not JSON at all.
    NotJson,
}

impl Inbound {
    pub fn decode(text: &str) -> Self {
        if let Some(secret) = text.strip_prefix(HANDSHAKE_PREFIX) {
            return Inbound::Handshake(secret.to_string());
        }
        if text == TERMINATE_FRAME {
            return Inbound::Terminate;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Inbound::Object(map),
            Ok(_) => Inbound::NotObject,
            Err(_) => Inbound::NotJson,
        }
    }
}

/// A command issued by a downstream client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    /// Command name, opaque to the relay.
    pub command: String,
    /// Command arguments, opaque to the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Client secret (required when authentication is enabled). Kept as
    /// raw JSON so the auth check, not decoding, judges its type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Value>,
    /// Caller-chosen identifier echoed back on the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
}

impl CommandMessage {
    /// Narrow a decoded JSON object to a command.
    ///
    /// A missing `command` field is reported separately from fields of the
    /// wrong type.
    pub fn from_object(map: Map<String, Value>) -> Result<Self, Rejection> {
        if !map.contains_key("command") {
            return Err(Rejection::NoCommand);
        }
        serde_json::from_value(Value::Object(map)).map_err(|_| Rejection::InvalidMessage)
    }

    /// Decode a raw text frame as a command.
    pub fn decode(text: &str) -> Result<Self, Rejection> {
        match Inbound::decode(text) {
            Inbound::Object(map) => Self::from_object(map),
            Inbound::NotObject => Err(Rejection::InvalidMessage),
            _ => Err(Rejection::NotJson),
        }
    }

    pub fn to_json(&self) -> ConductorResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A command as forwarded to the upstream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCommand<'a> {
    pub message_id: u32,
    pub secret: &'a str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<&'a Value>,
}

impl<'a> UpstreamCommand<'a> {
    /// Rewrite a client command for the upstream, carrying the translated
    /// ID and the relay's handshake secret.
    pub fn new(message_id: u32, secret: &'a str, cmd: &'a CommandMessage) -> Self {
        Self {
            message_id,
            secret,
            command: &cmd.command,
            args: cmd.args.as_ref(),
        }
    }

    pub fn to_json(&self) -> ConductorResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A reply from the upstream, keyed by the relay's internal ID.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub message_id: u32,
    /// Remaining result fields, forwarded verbatim.
    pub body: Map<String, Value>,
}

impl UpstreamReply {
    pub fn from_object(mut map: Map<String, Value>) -> ConductorResult<Self> {
        let raw = map
            .remove(MESSAGE_ID)
            .ok_or_else(|| ConductorError::InvalidMessage("reply has no messageId".into()))?;
        let message_id = raw
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| {
                ConductorError::InvalidMessage(format!("reply has a non-integer messageId: {raw}"))
            })?;
        Ok(Self {
            message_id,
            body: map,
        })
    }

    /// Render the reply for the requesting client, restoring its `messageId`
    /// or leaving the field out when the caller never supplied one.
    pub fn into_downstream(self, requester_id: Option<Value>) -> ConductorResult<String> {
        let mut body = self.body;
        if let Some(id) = requester_id {
            body.insert(MESSAGE_ID.to_string(), id);
        }
        Ok(serde_json::to_string(&Value::Object(body))?)
    }
}

/// Structured failure response sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
}

impl Failure {
    pub fn new(rejection: Rejection, message_id: Option<Value>) -> Self {
        Self {
            success: false,
            error: rejection.to_string(),
            message_id,
        }
    }

    pub fn to_json(&self) -> ConductorResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
