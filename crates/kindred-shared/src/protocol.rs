//! Wire protocol spoken over the session connection.
//!
//! Every frame is a JSON text message. Outbound requests carry an `event`
//! name, a `data` payload and, when the caller wants confirmation, an `ack`
//! id. The server answers such a request with a frame holding only the same
//! `ack` id and a `data` payload; a string `data.error` marks failure.
//! Server pushes carry an `event` and `data` and never an `ack`.
//!
//! SDP offers/answers and ICE candidates are [`Payload`]s: opaque JSON that
//! this layer relays without interpreting.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AckError, ProtocolError};
use crate::types::{CallId, MediaType, MessageId, MessageKind, UserId};

/// Opaque signaling blob (session description or ICE candidate).
pub type Payload = Value;

/// Raw frame as it travels over the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    /// Acknowledgment frame for request `ack`.
    pub fn ack(ack: u64, data: Value) -> Self {
        Self {
            event: None,
            data,
            ack: Some(ack),
        }
    }

    /// Server push frame.
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(name.into()),
            data,
            ack: None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// True for a reply to one of our requests.
    pub fn is_ack(&self) -> bool {
        self.event.is_none() && self.ack.is_some()
    }

    /// Split an ack frame into success data or the server's error string.
    pub fn into_ack_result(self) -> Result<Value, String> {
        match self.data.get("error") {
            Some(Value::String(reason)) => Err(reason.clone()),
            Some(Value::Null) | None => Ok(self.data),
            Some(other) => Err(other.to_string()),
        }
    }
}

/// Events the client sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    CallUser {
        receiver_id: UserId,
        call_type: MediaType,
        offer: Payload,
    },
    AnswerCall {
        call_id: CallId,
        answer: Payload,
    },
    RejectCall {
        call_id: CallId,
        reason: String,
    },
    EndCall {
        call_id: CallId,
    },
    IceCandidate {
        call_id: CallId,
        candidate: Payload,
    },
    SendMessage {
        receiver_id: UserId,
        content: String,
        #[serde(rename = "type")]
        kind: MessageKind,
    },
    Typing {
        receiver_id: UserId,
    },
    StopTyping {
        receiver_id: UserId,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::CallUser { .. } => "call_user",
            Self::AnswerCall { .. } => "answer_call",
            Self::RejectCall { .. } => "reject_call",
            Self::EndCall { .. } => "end_call",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
        }
    }

    /// Build the wire frame, attaching `ack` when a reply is wanted.
    pub fn into_frame(self, ack: Option<u64>) -> Result<Frame, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let event = tagged
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let data = tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Frame { event, data, ack })
    }
}

/// Names of the events the server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventName {
    IncomingCall,
    CallAnswered,
    CallRejected,
    CallEnded,
    IceCandidate,
    NewMessage,
    UserTyping,
    UserStoppedTyping,
}

impl ServerEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomingCall => "incoming_call",
            Self::CallAnswered => "call_answered",
            Self::CallRejected => "call_rejected",
            Self::CallEnded => "call_ended",
            Self::IceCandidate => "ice_candidate",
            Self::NewMessage => "new_message",
            Self::UserTyping => "user_typing",
            Self::UserStoppedTyping => "user_stopped_typing",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let parsed = match name {
            "incoming_call" => Self::IncomingCall,
            "call_answered" => Self::CallAnswered,
            "call_rejected" => Self::CallRejected,
            "call_ended" => Self::CallEnded,
            "ice_candidate" => Self::IceCandidate,
            "new_message" => Self::NewMessage,
            "user_typing" => Self::UserTyping,
            "user_stopped_typing" => Self::UserStoppedTyping,
            _ => return None,
        };
        Some(parsed)
    }
}

impl std::fmt::Display for ServerEventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    /// Present on echoes of our own sends; absent on messages from peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

/// Events the server pushes, validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    IncomingCall {
        call_id: CallId,
        caller_id: UserId,
        call_type: MediaType,
        offer: Payload,
    },
    CallAnswered {
        call_id: CallId,
        answer: Payload,
    },
    CallRejected {
        call_id: CallId,
        #[serde(default)]
        reason: Option<String>,
    },
    CallEnded {
        call_id: CallId,
    },
    IceCandidate {
        call_id: CallId,
        candidate: Payload,
    },
    NewMessage(IncomingMessage),
    UserTyping {
        sender_id: UserId,
    },
    UserStoppedTyping {
        sender_id: UserId,
    },
}

impl ServerEvent {
    pub fn name(&self) -> ServerEventName {
        match self {
            Self::IncomingCall { .. } => ServerEventName::IncomingCall,
            Self::CallAnswered { .. } => ServerEventName::CallAnswered,
            Self::CallRejected { .. } => ServerEventName::CallRejected,
            Self::CallEnded { .. } => ServerEventName::CallEnded,
            Self::IceCandidate { .. } => ServerEventName::IceCandidate,
            Self::NewMessage(_) => ServerEventName::NewMessage,
            Self::UserTyping { .. } => ServerEventName::UserTyping,
            Self::UserStoppedTyping { .. } => ServerEventName::UserStoppedTyping,
        }
    }

    /// The call this event refers to, if it is a signaling event.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::CallAnswered { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnded { call_id }
            | Self::IceCandidate { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Parse and validate an inbound event frame.
    pub fn from_parts(name: &str, data: Value) -> Result<Self, ProtocolError> {
        if ServerEventName::parse(name).is_none() {
            return Err(ProtocolError::UnknownEvent(name.to_string()));
        }

        let tagged = serde_json::json!({ "event": name, "data": data });
        let event: Self =
            serde_json::from_value(tagged).map_err(|e| ProtocolError::InvalidPayload {
                event: name.to_string(),
                reason: e.to_string(),
            })?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(call_id) = self.call_id() {
            if call_id.0.trim().is_empty() {
                return Err(ProtocolError::MissingField("call_id"));
            }
        }

        match self {
            Self::IncomingCall {
                caller_id, offer, ..
            } => {
                if caller_id.0.trim().is_empty() {
                    return Err(ProtocolError::MissingField("caller_id"));
                }
                if offer.is_null() {
                    return Err(ProtocolError::MissingField("offer"));
                }
            }
            Self::CallAnswered { answer, .. } if answer.is_null() => {
                return Err(ProtocolError::MissingField("answer"));
            }
            Self::IceCandidate { candidate, .. } if candidate.is_null() => {
                return Err(ProtocolError::MissingField("candidate"));
            }
            Self::NewMessage(message) => {
                if message.message_id.0.trim().is_empty() {
                    return Err(ProtocolError::MissingField("message_id"));
                }
                if message.sender_id.0.trim().is_empty() {
                    return Err(ProtocolError::MissingField("sender_id"));
                }
            }
            Self::UserTyping { sender_id } | Self::UserStoppedTyping { sender_id }
                if sender_id.0.trim().is_empty() =>
            {
                return Err(ProtocolError::MissingField("sender_id"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Ack payload of `call_user`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallCreatedAck {
    pub call_id: CallId,
}

/// Ack payload of `send_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageAck {
    pub message_id: MessageId,
    pub sent_at: DateTime<Utc>,
}

/// Decode the success data of an ack into its typed payload.
pub fn parse_ack<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, AckError> {
    serde_json::from_value(data).map_err(|e| AckError::Malformed {
        event: event.to_string(),
        reason: e.to_string(),
    })
}
