// Types, wire protocol and error taxonomy shared by every kindred crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{AckError, ProtocolError};
pub use protocol::{ClientEvent, Frame, ServerEvent, ServerEventName};
pub use types::{
    CallId, ConnectionState, LocalMessageId, MediaType, MessageId, MessageKind, UserId,
};
