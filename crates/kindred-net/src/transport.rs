//! Transport seam.
//!
//! A [`Connector`] opens one link to the backend and hands back the sending
//! half ([`Transport`]) plus a stream of [`TransportEvent`]s. The connection
//! manager owns at most one link at a time and knows nothing about how the
//! bytes travel.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// What a link reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame.
    Frame(String),
    /// The link is gone and will not produce more frames.
    Closed { reason: Option<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Link closed")]
    Closed,

    #[error("Credential unavailable: {0}")]
    Credential(String),
}

/// Sending half of an open link.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    async fn close(&self);
}

/// An open link: sending half plus inbound event stream.
pub type Link = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

/// Opens links to the backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, TransportError>;
}

/// Supplies the auth token for each handshake. Queried again on every
/// reconnect so rotated tokens are picked up.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String, TransportError>;
}

/// Credential provider for a token known up front.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn token(&self) -> Result<String, TransportError> {
        if self.0.is_empty() {
            return Err(TransportError::Credential("empty token".into()));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        assert_eq!(StaticToken::new("abc").token().await.unwrap(), "abc");
        assert!(StaticToken::new("").token().await.is_err());
    }

    #[test]
    fn test_static_token_debug_hides_secret() {
        assert!(!format!("{:?}", StaticToken::new("secret")).contains("secret"));
    }
}
