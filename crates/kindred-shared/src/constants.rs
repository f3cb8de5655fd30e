use std::time::Duration;

/// Client version reported in logs.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deadline for a server ack on any request.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for transport open + authenticate ack.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an incoming call rings before it becomes Missed.
pub const RING_TIMEOUT: Duration = Duration::from_secs(45);

/// How long an outgoing call waits for answer/rejection before it fails.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a terminal call stays readable so the UI can render its outcome.
pub const CALL_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Minimum gap between two outbound `typing` signals to the same peer.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);

/// Input idle time after which `stop_typing` is sent.
pub const TYPING_IDLE: Duration = Duration::from_secs(3);

/// Lifetime of a remote "is typing" indicator without a refresh.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(5);

/// Period of the session housekeeping tick (timeouts, typing sweep).
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Reconnect attempts after an involuntary loss before giving up.
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// First reconnect delay; doubles on every attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of a single reconnect delay (before jitter).
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Maximum random jitter added to a reconnect delay, as a fraction of it.
pub const RECONNECT_JITTER: f64 = 0.3;

/// Frames buffered while reconnecting.
pub const MAX_BUFFERED_FRAMES: usize = 256;

/// Signaling events held for an outgoing call that has no call_id yet before
/// a warning is logged. Held events are never dropped.
pub const MAX_EARLY_CALL_EVENTS: usize = 64;

/// Call ids of finished calls remembered to discard their late events.
pub const RETIRED_CALL_IDS: usize = 16;

/// Maximum chat message content size in bytes (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Reasons sent with `reject_call`.
pub const REJECT_REASON_DECLINED: &str = "rejected";
pub const REJECT_REASON_MISSED: &str = "missed";
pub const REJECT_REASON_BUSY: &str = "busy";
