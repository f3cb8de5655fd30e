use thiserror::Error;

/// Malformed or unexpected inbound payload. Logged and dropped by consumers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Event {event} has an invalid payload: {reason}")]
    InvalidPayload { event: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Failure of a request that expected a server ack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("No ack for {event} within the deadline")]
    Timeout { event: String },

    #[error("Server rejected {event}: {reason}")]
    Rejected { event: String, reason: String },

    #[error("Connection closed before {event} was acknowledged")]
    Disconnected { event: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Malformed ack for {event}: {reason}")]
    Malformed { event: String, reason: String },
}

impl AckError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
