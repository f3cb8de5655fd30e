//! In-process transport for tests.
//!
//! Every successful [`MockConnector::connect`] creates a link and hands its
//! server side ([`MockServer`]) to the test through [`MockServers`]. The
//! `authenticate` handshake is answered by the mock itself unless told
//! otherwise, so tests only see application frames.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use kindred_shared::protocol::Frame;

use crate::transport::{Connector, Link, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct MockSettings {
    fail_next: u32,
    reject_auth: Option<String>,
    hold_auth: bool,
    last_token: Option<String>,
}

#[derive(Clone)]
pub struct MockConnector {
    settings: Arc<Mutex<MockSettings>>,
    attempts: Arc<AtomicU32>,
    servers_tx: mpsc::UnboundedSender<MockServer>,
}

/// Server sides of the links opened so far, in connect order.
pub struct MockServers {
    rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockServers {
    pub async fn next(&mut self) -> Option<MockServer> {
        self.rx.recv().await
    }
}

impl MockConnector {
    pub fn new() -> (Self, MockServers) {
        let (servers_tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            settings: Arc::new(Mutex::new(MockSettings::default())),
            attempts: Arc::new(AtomicU32::new(0)),
            servers_tx,
        };
        (connector, MockServers { rx })
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.settings().fail_next = n;
    }

    /// Answer every `authenticate` with this error.
    pub fn reject_auth(&self, reason: &str) {
        self.settings().reject_auth = Some(reason.to_string());
    }

    /// Never answer `authenticate`.
    pub fn hold_auth(&self, hold: bool) {
        self.settings().hold_auth = hold;
    }

    /// Connect attempts so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Token presented by the most recent handshake.
    pub fn last_token(&self) -> Option<String> {
        self.settings().last_token.clone()
    }

    fn settings(&self) -> MutexGuard<'_, MockSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut settings = self.settings();
            if settings.fail_next > 0 {
                settings.fail_next -= 1;
                return Err(TransportError::Connect("mock connect refused".into()));
            }
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(256);
        let closed = Arc::new(AtomicBool::new(false));

        let transport = MockTransport {
            frames: frames_tx,
            events: events_tx.clone(),
            closed: Arc::clone(&closed),
            settings: Arc::clone(&self.settings),
        };
        let server = MockServer {
            frames: frames_rx,
            events: events_tx,
            closed,
        };
        let _ = self.servers_tx.send(server);

        Ok((Arc::new(transport), events_rx))
    }
}

struct MockTransport {
    frames: mpsc::UnboundedSender<Frame>,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    settings: Arc<Mutex<MockSettings>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = Frame::decode(&text).map_err(|e| TransportError::Send(e.to_string()))?;

        if frame.event.as_deref() != Some("authenticate") {
            return self.frames.send(frame).map_err(|_| TransportError::Closed);
        }

        let (reject, hold) = {
            let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
            settings.last_token = frame.data["token"].as_str().map(str::to_owned);
            (settings.reject_auth.clone(), settings.hold_auth)
        };
        if hold {
            return Ok(());
        }
        if let Some(id) = frame.ack {
            let data = match reject {
                Some(reason) => json!({ "error": reason }),
                None => json!({}),
            };
            if let Ok(text) = Frame::ack(id, data).encode() {
                let _ = self.events.send(TransportEvent::Frame(text)).await;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server side of one mock link.
pub struct MockServer {
    frames: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MockServer {
    /// Next application frame the client sent.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Next frame carrying event `name`, skipping others.
    pub async fn next_named(&mut self, name: &str) -> Option<Frame> {
        loop {
            let frame = self.frames.recv().await?;
            if frame.event.as_deref() == Some(name) {
                return Some(frame);
            }
        }
    }

    /// A frame already sent, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Push a server event.
    pub async fn push(&self, name: &str, data: Value) {
        if let Ok(text) = Frame::event(name, data).encode() {
            self.push_raw(text).await;
        }
    }

    /// Push arbitrary text, valid or not.
    pub async fn push_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Frame(text.into())).await;
    }

    /// Answer request `id`.
    pub async fn ack(&self, id: u64, data: Value) {
        if let Ok(text) = Frame::ack(id, data).encode() {
            self.push_raw(text).await;
        }
    }

    /// Kill the link from the server side.
    pub async fn drop_link(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Closed {
                reason: Some("mock link dropped".into()),
            })
            .await;
    }

    /// Whether the link is closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
