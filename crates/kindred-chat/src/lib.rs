pub mod channel;
pub mod error;
pub mod log;
pub mod models;
pub mod typing;

pub use channel::MessageChannel;
pub use error::ChatError;
pub use log::ConversationLog;
pub use models::{AckStatus, Message};
pub use typing::{TypingDebouncer, TypingState, TypingTracker};
