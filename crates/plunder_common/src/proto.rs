// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The wire protocol between clients and the server: a typed envelope with
//! a raw payload that is decoded according to the type tag. Decoding fails
//! explicitly on unrecognized tags instead of silently ignoring them.

use crate::models::{Flag, SharedConfig};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub const FLAG_EVENT: &str = "flag";
pub const FLAG_RESPONSE_EVENT: &str = "flag_response";
pub const CONFIG_EVENT: &str = "config";

/// The envelope as it appears on the wire: `{"type": ..., "payload": ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Box<RawValue>,
}

/// The closed set of events either peer understands. The server consumes
/// [Event::Flag]; clients consume [Event::Config] and [Event::FlagResponse].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Flag(Flag),
    FlagResponse(FlagReceipt),
    Config(SharedConfig),
}

/// Best-effort acknowledgment sent back for every flag accepted into the
/// transport. Carries no delivery guarantee beyond that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagReceipt {
    /// Unix timestamp of when the server accepted the flag
    pub received_at: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
    #[error("malformed event payload")]
    Payload(#[source] serde_json::Error),
    #[error("malformed envelope")]
    Envelope(#[source] serde_json::Error),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Flag(_) => FLAG_EVENT,
            Event::FlagResponse(_) => FLAG_RESPONSE_EVENT,
            Event::Config(_) => CONFIG_EVENT,
        }
    }

    /// Serializes the event into an envelope, ready to be written to the
    /// transport as a text frame.
    pub fn encode(&self) -> Result<String, ProtoError> {
        let payload = match self {
            Event::Flag(flag) => serde_json::to_string(flag),
            Event::FlagResponse(receipt) => serde_json::to_string(receipt),
            Event::Config(config) => serde_json::to_string(config),
        }
        .map_err(ProtoError::Payload)?;

        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload: RawValue::from_string(payload).map_err(ProtoError::Payload)?,
        };
        serde_json::to_string(&envelope).map_err(ProtoError::Envelope)
    }

    /// Decodes a raw frame into an event. Unknown type tags are an error;
    /// the caller decides whether that terminates the connection (server)
    /// or drops the message (client).
    pub fn decode(raw: &str) -> Result<Event, ProtoError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(ProtoError::Envelope)?;
        match envelope.kind.as_str() {
            FLAG_EVENT => {
                let flag = serde_json::from_str(envelope.payload.get())
                    .map_err(ProtoError::Payload)?;
                Ok(Event::Flag(flag))
            }
            FLAG_RESPONSE_EVENT => {
                let receipt = serde_json::from_str(envelope.payload.get())
                    .map_err(ProtoError::Payload)?;
                Ok(Event::FlagResponse(receipt))
            }
            CONFIG_EVENT => {
                let config = serde_json::from_str(envelope.payload.get())
                    .map_err(ProtoError::Payload)?;
                Ok(Event::Config(config))
            }
            other => Err(ProtoError::UnsupportedEvent(other.to_string())),
        }
    }
}
