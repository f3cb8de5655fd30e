pub mod error;
pub mod signaling;

pub use error::CallError;
pub use signaling::{
    Call, CallDirection, CallMachine, CallState, CallTimeouts, EndReason, LocalCallId,
    SignalingAction,
};
