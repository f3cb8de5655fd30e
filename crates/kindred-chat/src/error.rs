use thiserror::Error;

use kindred_shared::LocalMessageId;

use crate::models::AckStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("No such message: {0}")]
    UnknownMessage(LocalMessageId),

    #[error("Message {local_id} is {status:?}, only failed messages can be resent")]
    NotFailed {
        local_id: LocalMessageId,
        status: AckStatus,
    },
}
