// Session connection layer: transport seam, reconnect policy, the
// connection manager task and the event dispatcher.

pub mod backoff;
pub mod connection;
pub mod dispatcher;
pub mod transport;
pub mod ws;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use backoff::ReconnectPolicy;
pub use connection::{
    spawn_connection, ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionNotification,
};
pub use dispatcher::{Event, EventDispatcher, SubscriptionId};
pub use transport::{
    Connector, CredentialProvider, Link, StaticToken, Transport, TransportError, TransportEvent,
};
pub use ws::WebSocketConnector;
