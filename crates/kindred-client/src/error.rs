use thiserror::Error;

use kindred_call::CallError;
use kindred_chat::ChatError;
use kindred_net::ConnectionError;
use kindred_shared::AckError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Ack(#[from] AckError),

    #[error("Session stopped")]
    Stopped,
}

impl SessionError {
    /// Local call already in progress.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Call(CallError::Busy { .. }))
    }

    pub fn is_ack_timeout(&self) -> bool {
        matches!(self, Self::Ack(e) if e.is_timeout())
    }
}
