pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use events::{EventKind, SessionEvent};
pub use session::{PendingCall, PendingMessage, Session};
