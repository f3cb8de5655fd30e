//! WebSocket transport (JSON text frames).

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::transport::{Connector, Link, Transport, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket links to a fixed URL (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %self.url, status = %response.status(), "WebSocket connected");

        let (sink, stream) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(read_pump(stream, events_tx));

        let transport = WebSocketTransport {
            sink: Mutex::new(Some(sink)),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

struct WebSocketTransport {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
    }
}

/// Forward inbound text frames until the socket ends, then report Closed.
async fn read_pump(mut stream: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if events
                    .send(TransportEvent::Frame(text.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string());
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket receive failed");
                break Some(e.to_string());
            }
            None => break None,
        }
    };
    let _ = events.send(TransportEvent::Closed { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_transport_error() {
        let connector = WebSocketConnector::new("not a url");
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}
