//! Connection manager.
//!
//! One background task owns the transport link. Callers talk to it through a
//! cloneable [`ConnectionHandle`] (commands with oneshot replies) and receive
//! [`ConnectionNotification`]s on a channel. The task authenticates every new
//! link, correlates acks with the requests that asked for them, buffers
//! frames while a lost link is being re-established and applies the
//! [`ReconnectPolicy`] on involuntary loss.

use std::collections::{HashMap, VecDeque};
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use kindred_shared::constants::{HANDSHAKE_TIMEOUT, MAX_BUFFERED_FRAMES, TICK_INTERVAL};
use kindred_shared::protocol::{ClientEvent, Frame, ServerEvent};
use kindred_shared::{AckError, ConnectionState};

use crate::backoff::ReconnectPolicy;
use crate::transport::{Connector, CredentialProvider, Link, Transport, TransportError, TransportEvent};

/// Ack id used by the `authenticate` handshake. Requests start at 1.
const HANDSHAKE_ACK: u64 = 0;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connect cancelled by disconnect")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Connection task stopped")]
    TaskStopped,
}

/// Notifications sent from the connection task to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionNotification {
    StateChanged(ConnectionState),
    /// A validated server push.
    Event(ServerEvent),
    /// Reconnect attempts are exhausted. The state is now Disconnected and
    /// stays so until the next explicit `connect`.
    Lost { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for opening the link plus the `authenticate` ack.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Frames kept while reconnecting; further emits fail.
    pub max_buffered_frames: usize,
    /// How often expired ack deadlines are swept.
    pub ack_sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            max_buffered_frames: MAX_BUFFERED_FRAMES,
            ack_sweep_interval: TICK_INTERVAL,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Disconnect(oneshot::Sender<()>),
    Emit {
        event: ClientEvent,
        reply: Option<AckReply>,
    },
}

struct AckReply {
    tx: oneshot::Sender<Result<Value, AckError>>,
    timeout: Duration,
}

/// Cloneable handle to the connection task. The task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Connect and authenticate. Returns immediately when already connected
    /// and joins the running attempt when one is in flight.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(tx))
            .map_err(|_| ConnectionError::TaskStopped)?;
        rx.await.map_err(|_| ConnectionError::TaskStopped)?
    }

    /// Tear down the link. Pending requests resolve with
    /// `AckError::Disconnected` and no reconnect is attempted.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Fire-and-forget emit.
    pub fn emit(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(ConnectionError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Emit { event, reply: None })
            .map_err(|_| ConnectionError::TaskStopped)
    }

    /// Emit `event` with an ack id and resolve with the ack data.
    ///
    /// The request is queued before this returns; dropping the returned
    /// future only discards the outcome.
    pub fn request(
        &self,
        event: ClientEvent,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, AckError>> + Send + 'static {
        let name = event.name();
        let (tx, rx) = oneshot::channel();
        let queued = self
            .cmd_tx
            .send(Command::Emit {
                event,
                reply: Some(AckReply { tx, timeout }),
            })
            .is_ok();

        async move {
            if !queued {
                return Err(AckError::NotConnected);
            }
            rx.await.unwrap_or_else(|_| {
                Err(AckError::Disconnected {
                    event: name.to_string(),
                })
            })
        }
    }
}

/// Spawn the connection task. It starts Disconnected; call
/// [`ConnectionHandle::connect`] to open the first link.
pub fn spawn_connection(
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    config: ConnectionConfig,
) -> (ConnectionHandle, mpsc::Receiver<ConnectionNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (notif_tx, notif_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let task = ConnectionTask {
        connector,
        credentials,
        config,
        state: ConnectionState::Disconnected,
        state_tx,
        notif_tx,
        transport: None,
        inbound: None,
        attempt: None,
        retry_at: None,
        reconnect_attempt: 0,
        waiters: Vec::new(),
        next_ack: HANDSHAKE_ACK + 1,
        pending: HashMap::new(),
        outbox: VecDeque::new(),
    };
    tokio::spawn(task.run(cmd_rx));

    (ConnectionHandle { cmd_tx, state_rx }, notif_rx)
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

type Attempt = BoxFuture<'static, Result<Link, ConnectionError>>;

struct PendingAck {
    event: &'static str,
    tx: oneshot::Sender<Result<Value, AckError>>,
    deadline: Instant,
}

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    config: ConnectionConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    notif_tx: mpsc::Sender<ConnectionNotification>,
    transport: Option<Arc<dyn Transport>>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    attempt: Option<Attempt>,
    retry_at: Option<Instant>,
    /// Number of the running or scheduled reconnect attempt; 0 outside
    /// reconnect mode.
    reconnect_attempt: u32,
    waiters: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    next_ack: u64,
    pending: HashMap<u64, PendingAck>,
    outbox: VecDeque<String>,
}

impl ConnectionTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = interval(self.config.ack_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All connection handles dropped, stopping");
                        self.close_link().await;
                        break;
                    }
                },
                outcome = wait_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_finished(outcome).await;
                }
                event = next_inbound(&mut self.inbound) => self.on_inbound(event).await,
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    debug!(attempt = self.reconnect_attempt, "Reconnecting");
                    self.begin_attempt();
                }
                _ = sweep.tick() => self.expire_acks(Instant::now()),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => match self.state {
                ConnectionState::Connected => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    debug!(state = ?self.state, "Connect joined the running attempt");
                    self.waiters.push(reply);
                }
                ConnectionState::Disconnected => {
                    info!("Connecting");
                    self.waiters.push(reply);
                    self.set_state(ConnectionState::Connecting).await;
                    self.begin_attempt();
                }
            },
            Command::Disconnect(reply) => {
                info!(state = ?self.state, "Disconnect requested");
                self.close_link().await;
                self.reset(ConnectionError::Cancelled).await;
                let _ = reply.send(());
            }
            Command::Emit { event, reply } => self.emit(event, reply).await,
        }
    }

    async fn emit(&mut self, event: ClientEvent, reply: Option<AckReply>) {
        let name = event.name();

        if self.state == ConnectionState::Disconnected {
            debug!(event = name, "Emit while disconnected");
            if let Some(reply) = reply {
                let _ = reply.tx.send(Err(AckError::NotConnected));
            }
            return;
        }

        let ack = reply.as_ref().map(|_| {
            let id = self.next_ack;
            self.next_ack += 1;
            id
        });
        let text = match encode(event, ack) {
            Ok(text) => text,
            Err(e) => {
                warn!(event = name, error = %e, "Dropping unencodable request");
                if let Some(reply) = reply {
                    let _ = reply.tx.send(Err(AckError::Malformed {
                        event: name.to_string(),
                        reason: e.to_string(),
                    }));
                }
                return;
            }
        };

        if self.transport.is_none() && self.outbox.len() >= self.config.max_buffered_frames {
            warn!(event = name, "Outbound buffer full, dropping frame");
            if let Some(reply) = reply {
                let _ = reply.tx.send(Err(AckError::NotConnected));
            }
            return;
        }

        if let (Some(id), Some(reply)) = (ack, reply) {
            self.pending.insert(
                id,
                PendingAck {
                    event: name,
                    tx: reply.tx,
                    deadline: Instant::now() + reply.timeout,
                },
            );
        }

        match self.transport.clone() {
            Some(transport) => {
                debug!(event = name, ack = ?ack, "Sending frame");
                if let Err(e) = transport.send(text.clone()).await {
                    warn!(event = name, error = %e, "Send failed, buffering for reconnect");
                    self.outbox.push_back(text);
                    self.on_link_lost(Some(e.to_string())).await;
                }
            }
            None => {
                debug!(event = name, buffered = self.outbox.len() + 1, "Buffering frame");
                self.outbox.push_back(text);
            }
        }
    }

    fn begin_attempt(&mut self) {
        let connector = Arc::clone(&self.connector);
        let credentials = Arc::clone(&self.credentials);
        let limit = self.config.handshake_timeout;
        self.attempt = Some(Box::pin(establish(connector, credentials, limit)));
    }

    async fn on_attempt_finished(&mut self, outcome: Result<Link, ConnectionError>) {
        match outcome {
            Ok((transport, inbound)) => {
                info!(
                    attempt = self.reconnect_attempt,
                    buffered = self.outbox.len(),
                    "Connection established"
                );
                self.transport = Some(transport);
                self.inbound = Some(inbound);
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Connected).await;
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.flush_outbox().await;
            }
            Err(e) if self.reconnect_attempt > 0 => {
                warn!(attempt = self.reconnect_attempt, error = %e, "Reconnect attempt failed");
                self.schedule_reconnect().await;
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.reset(e).await;
            }
        }
    }

    async fn flush_outbox(&mut self) {
        while let Some(text) = self.outbox.pop_front() {
            let Some(transport) = self.transport.clone() else {
                self.outbox.push_front(text);
                return;
            };
            if let Err(e) = transport.send(text.clone()).await {
                warn!(error = %e, "Flush failed");
                self.outbox.push_front(text);
                self.on_link_lost(Some(e.to_string())).await;
                return;
            }
        }
    }

    async fn on_inbound(&mut self, event: Option<TransportEvent>) {
        let text = match event {
            Some(TransportEvent::Frame(text)) => text,
            Some(TransportEvent::Closed { reason }) => return self.on_link_lost(reason).await,
            None => return self.on_link_lost(None).await,
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        if frame.is_ack() {
            let Some(id) = frame.ack else { return };
            let Some(pending) = self.pending.remove(&id) else {
                debug!(ack = id, "Ignoring late or unknown ack");
                return;
            };
            let result = frame.into_ack_result().map_err(|reason| AckError::Rejected {
                event: pending.event.to_string(),
                reason,
            });
            debug!(ack = id, event = pending.event, ok = result.is_ok(), "Ack received");
            let _ = pending.tx.send(result);
            return;
        }

        let Some(name) = frame.event else {
            warn!("Dropping frame without event or ack");
            return;
        };
        match ServerEvent::from_parts(&name, frame.data) {
            Ok(event) => self.notify(ConnectionNotification::Event(event)).await,
            Err(e) => warn!(event = %name, error = %e, "Dropping malformed event"),
        }
    }

    async fn on_link_lost(&mut self, reason: Option<String>) {
        if self.transport.is_none() {
            return;
        }
        self.transport = None;
        self.inbound = None;
        warn!(
            reason = reason.as_deref().unwrap_or("unknown"),
            pending = self.pending.len(),
            "Connection lost"
        );
        self.set_state(ConnectionState::Reconnecting).await;
        self.reconnect_attempt = 0;
        self.schedule_reconnect().await;
    }

    async fn schedule_reconnect(&mut self) {
        let next = self.reconnect_attempt + 1;
        if !self.config.reconnect.allows(next) {
            let attempts = self.reconnect_attempt;
            warn!(attempts, "Reconnect attempts exhausted, giving up");
            self.reset(ConnectionError::ReconnectExhausted { attempts })
                .await;
            self.notify(ConnectionNotification::Lost { attempts }).await;
            return;
        }

        self.reconnect_attempt = next;
        let delay = self.config.reconnect.next_delay(next);
        info!(
            attempt = next,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn close_link(&mut self) {
        self.inbound = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Drop every in-flight attempt, request and buffered frame and settle
    /// in Disconnected.
    async fn reset(&mut self, error: ConnectionError) {
        self.attempt = None;
        self.retry_at = None;
        self.reconnect_attempt = 0;
        self.outbox.clear();

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(AckError::Disconnected {
                event: pending.event.to_string(),
            }));
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    fn expire_acks(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(ack = id, event = pending.event, "Ack deadline passed");
                let _ = pending.tx.send(Err(AckError::Timeout {
                    event: pending.event.to_string(),
                }));
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "Connection state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.notify(ConnectionNotification::StateChanged(state)).await;
    }

    async fn notify(&mut self, notification: ConnectionNotification) {
        if self.notif_tx.send(notification).await.is_err() {
            debug!("Notification receiver dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn encode(event: ClientEvent, ack: Option<u64>) -> Result<String, ConnectionError> {
    event
        .into_frame(ack)
        .and_then(|frame| frame.encode())
        .map_err(|e| ConnectionError::Encode(e.to_string()))
}

async fn establish(
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    limit: Duration,
) -> Result<Link, ConnectionError> {
    timeout(limit, handshake(connector, credentials))
        .await
        .unwrap_or(Err(ConnectionError::HandshakeTimeout))
}

/// Open a link and authenticate on it. Frames other than the handshake
/// ack are discarded until authentication completes.
async fn handshake(
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Link, ConnectionError> {
    let token = credentials.token().await?;
    let (transport, mut inbound) = connector.connect().await?;
    transport
        .send(encode(ClientEvent::Authenticate { token }, Some(HANDSHAKE_ACK))?)
        .await?;

    while let Some(event) = inbound.recv().await {
        let text = match event {
            TransportEvent::Frame(text) => text,
            TransportEvent::Closed { reason } => {
                debug!(reason = ?reason, "Link closed during handshake");
                break;
            }
        };
        let frame = match Frame::decode(&text) {
            Ok(frame) if frame.is_ack() && frame.ack == Some(HANDSHAKE_ACK) => frame,
            Ok(_) => {
                debug!("Discarding frame received before authentication");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "Discarding undecodable frame during handshake");
                continue;
            }
        };
        return match frame.into_ack_result() {
            Ok(_) => Ok((transport, inbound)),
            Err(reason) => {
                transport.close().await;
                Err(ConnectionError::AuthRejected(reason))
            }
        };
    }

    Err(TransportError::Closed.into())
}

async fn wait_attempt(attempt: &mut Option<Attempt>) -> Result<Link, ConnectionError> {
    match attempt {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockServers};
    use crate::transport::StaticToken;
    use kindred_shared::{CallId, UserId};
    use serde_json::json;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectPolicy::fixed(5, Duration::from_secs(1), Duration::from_secs(30)),
            ..Default::default()
        }
    }

    fn spawn_mock() -> (
        ConnectionHandle,
        mpsc::Receiver<ConnectionNotification>,
        MockConnector,
        MockServers,
    ) {
        let (connector, servers) = MockConnector::new();
        let (handle, notes) = spawn_connection(
            Arc::new(connector.clone()),
            Arc::new(StaticToken::new("token-1")),
            test_config(),
        );
        (handle, notes, connector, servers)
    }

    async fn wait_for_state(handle: &ConnectionHandle, state: ConnectionState) {
        let mut rx = handle.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    async fn next_event(notes: &mut mpsc::Receiver<ConnectionNotification>) -> ServerEvent {
        loop {
            match notes.recv().await.unwrap() {
                ConnectionNotification::Event(event) => return event,
                _ => continue,
            }
        }
    }

    fn end_call(id: &str) -> ClientEvent {
        ClientEvent::EndCall {
            call_id: CallId::new(id),
        }
    }

    #[tokio::test]
    async fn test_connect_authenticates_once() {
        let (handle, _notes, connector, mut servers) = spawn_mock();

        handle.connect().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connected);
        let _server = servers.next().await.unwrap();

        handle.connect().await.unwrap();
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.last_token().as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let (handle, _notes, connector, _servers) = spawn_mock();

        let (a, b) = tokio::join!(handle.connect(), handle.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_request_resolves_with_ack_data() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let mut server = servers.next().await.unwrap();

        let reply = handle.request(end_call("c-1"), Duration::from_secs(10));
        let frame = server.next_frame().await.unwrap();
        assert_eq!(frame.event.as_deref(), Some("end_call"));
        assert_eq!(frame.data["call_id"], "c-1");

        server.ack(frame.ack.unwrap(), json!({ "ok": true })).await;
        assert_eq!(reply.await.unwrap(), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_ack_ids_increase() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let mut server = servers.next().await.unwrap();

        let _first = handle.request(end_call("c-1"), Duration::from_secs(10));
        let _second = handle.request(end_call("c-2"), Duration::from_secs(10));
        let a = server.next_frame().await.unwrap().ack.unwrap();
        let b = server.next_frame().await.unwrap().ack.unwrap();
        assert!(a >= 1);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_error_ack_is_rejection() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let mut server = servers.next().await.unwrap();

        let reply = handle.request(end_call("c-1"), Duration::from_secs(10));
        let frame = server.next_frame().await.unwrap();
        server
            .ack(frame.ack.unwrap(), json!({ "error": "no such call" }))
            .await;

        assert_eq!(
            reply.await.unwrap_err(),
            AckError::Rejected {
                event: "end_call".into(),
                reason: "no such call".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_ack() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let _server = servers.next().await.unwrap();

        let started = Instant::now();
        let err = handle
            .request(end_call("c-1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_rejected() {
        let (handle, _notes, _connector, _servers) = spawn_mock();

        let typing = ClientEvent::Typing {
            receiver_id: UserId::new("u-2"),
        };
        assert_eq!(handle.emit(typing), Err(ConnectionError::NotConnected));

        let err = handle
            .request(end_call("c-1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, AckError::NotConnected);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_returned() {
        let (handle, _notes, connector, _servers) = spawn_mock();
        connector.fail_next_connects(1);

        let err = handle.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(TransportError::Connect(_))));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_auth_rejection() {
        let (handle, _notes, connector, _servers) = spawn_mock();
        connector.reject_auth("bad token");

        let err = handle.connect().await.unwrap_err();
        assert_eq!(err, ConnectionError::AuthRejected("bad token".into()));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (handle, _notes, connector, _servers) = spawn_mock();
        connector.hold_auth(true);

        let err = handle.connect().await.unwrap_err();
        assert_eq!(err, ConnectionError::HandshakeTimeout);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (handle, mut notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let server = servers.next().await.unwrap();

        server.push_raw("not json").await;
        server.push("incoming_call", json!({ "call_id": "c-1" })).await;
        server.push("profile_liked", json!({})).await;
        server.ack(999, json!({})).await;
        server.push("user_typing", json!({ "sender_id": "u-2" })).await;

        let event = next_event(&mut notes).await;
        assert_eq!(
            event,
            ServerEvent::UserTyping {
                sender_id: UserId::new("u-2")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_loss() {
        let (handle, mut notes, connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let first = servers.next().await.unwrap();

        first.drop_link().await;
        let second = servers.next().await.unwrap();
        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(connector.connect_attempts(), 2);

        second.push("user_typing", json!({ "sender_id": "u-7" })).await;
        let mut states = Vec::new();
        loop {
            match notes.recv().await.unwrap() {
                ConnectionNotification::StateChanged(state) => states.push(state),
                ConnectionNotification::Event(_) => break,
                ConnectionNotification::Lost { .. } => panic!("unexpected loss"),
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_buffered_while_reconnecting() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let first = servers.next().await.unwrap();

        first.drop_link().await;
        wait_for_state(&handle, ConnectionState::Reconnecting).await;

        handle
            .emit(ClientEvent::Typing {
                receiver_id: UserId::new("u-2"),
            })
            .unwrap();
        let reply = handle.request(end_call("c-3"), Duration::from_secs(10));

        let mut second = servers.next().await.unwrap();
        let typing = second.next_frame().await.unwrap();
        assert_eq!(typing.event.as_deref(), Some("typing"));
        let end = second.next_frame().await.unwrap();
        assert_eq!(end.event.as_deref(), Some("end_call"));

        second.ack(end.ack.unwrap(), json!({})).await;
        assert!(reply.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (handle, mut notes, connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let first = servers.next().await.unwrap();

        let reply = handle.request(end_call("c-1"), Duration::from_secs(600));
        connector.fail_next_connects(5);
        first.drop_link().await;

        loop {
            if let ConnectionNotification::Lost { attempts } = notes.recv().await.unwrap() {
                assert_eq!(attempts, 5);
                break;
            }
        }
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connect_attempts(), 6);
        assert_eq!(
            reply.await.unwrap_err(),
            AckError::Disconnected {
                event: "end_call".into()
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_requests() {
        let (handle, _notes, _connector, mut servers) = spawn_mock();
        handle.connect().await.unwrap();
        let mut server = servers.next().await.unwrap();

        let reply = handle.request(end_call("c-1"), Duration::from_secs(10));
        server.next_frame().await.unwrap();
        handle.disconnect().await;

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(server.is_closed());
        assert_eq!(
            reply.await.unwrap_err(),
            AckError::Disconnected {
                event: "end_call".into()
            }
        );
    }
}
