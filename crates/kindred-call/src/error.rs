use thiserror::Error;

use crate::signaling::{CallState, LocalCallId};

/// Rejections of local call operations. Inbound events never produce these;
/// they are ignored when they do not apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Another call is in progress ({state})")]
    Busy { state: CallState },

    #[error("No such call: {0}")]
    UnknownCall(LocalCallId),

    #[error("Cannot {operation} {local_id} while {state}")]
    InvalidState {
        local_id: LocalCallId,
        operation: &'static str,
        state: CallState,
    },
}
