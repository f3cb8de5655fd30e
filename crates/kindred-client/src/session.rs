//! The session: one authenticated connection shared by calls, chat and
//! typing presence.
//!
//! [`Session`] is a cheap handle. The state lives in a driver task that owns
//! the [`CallMachine`], the [`MessageChannel`] and both typing trackers and
//! is their only mutator. The driver consumes, one at a time and in arrival
//! order:
//! - commands from the handle,
//! - notifications from the connection task,
//! - completions of acked requests,
//! - the housekeeping tick (call timeouts, typing sweeps).
//!
//! Every resulting change is published through the session's
//! [`EventDispatcher`], which outlives individual links, so subscriptions
//! keep firing across reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use kindred_call::{Call, CallMachine, CallState, LocalCallId, SignalingAction};
use kindred_chat::{AckStatus, Message, MessageChannel, TypingDebouncer, TypingTracker};
use kindred_net::{
    spawn_connection, ConnectionHandle, ConnectionNotification, Connector, CredentialProvider,
    EventDispatcher, SubscriptionId,
};
use kindred_shared::protocol::{
    parse_ack, CallCreatedAck, ClientEvent, MessageAck, Payload, ServerEvent,
};
use kindred_shared::{AckError, ConnectionState, LocalMessageId, MediaType, MessageKind, UserId};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventKind, SessionEvent};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running session. Cloning shares the same session; the driver
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    local_user: UserId,
    connection: ConnectionHandle,
    dispatcher: Arc<EventDispatcher<SessionEvent>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    call_rx: watch::Receiver<Option<Call>>,
}

impl Session {
    /// Spawn the connection and driver tasks. The session starts
    /// disconnected.
    pub fn new(
        local_user: UserId,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        config: SessionConfig,
    ) -> Self {
        let (connection, notif_rx) =
            spawn_connection(connector, credentials, config.connection_config());
        let dispatcher = Arc::new(EventDispatcher::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = watch::channel(None);

        let driver = Driver {
            local_user: local_user.clone(),
            connection: connection.clone(),
            dispatcher: Arc::clone(&dispatcher),
            machine: CallMachine::new(config.call_timeouts()),
            channel: MessageChannel::with_limit(local_user.clone(), config.max_message_size),
            debouncer: TypingDebouncer::new(config.typing_debounce, config.typing_idle),
            tracker: TypingTracker::new(config.typing_expiry),
            call_tx,
            call_waiters: HashMap::new(),
            message_waiters: HashMap::new(),
            acks: FuturesUnordered::new(),
            config,
        };
        tokio::spawn(driver.run(cmd_rx, notif_rx));

        Self {
            local_user,
            connection,
            dispatcher,
            cmd_tx,
            call_rx,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    // -- connection ---------------------------------------------------------

    /// Connect and authenticate. Concurrent calls share one attempt.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.connection.connect().await?;
        Ok(())
    }

    /// Log out: close the link without reconnecting. A live call fails and
    /// pending requests resolve with `AckError::Disconnected`.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    // -- subscriptions ------------------------------------------------------

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    // -- calls --------------------------------------------------------------

    /// Ring `peer`. Fails with a busy error, without emitting anything, when
    /// a call is already in progress.
    pub async fn call_user(
        &self,
        peer: UserId,
        media: MediaType,
        offer: Payload,
    ) -> Result<PendingCall, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CallUser {
            peer,
            media,
            offer,
            reply,
        })?;
        let (local_id, settled) = rx.await.map_err(|_| SessionError::Stopped)??;
        Ok(PendingCall { local_id, settled })
    }

    pub async fn accept_call(
        &self,
        local_id: LocalCallId,
        answer: Payload,
    ) -> Result<(), SessionError> {
        self.ask(|reply| Command::Accept {
            local_id,
            answer,
            reply,
        })
        .await
    }

    pub async fn reject_call(&self, local_id: LocalCallId) -> Result<(), SessionError> {
        self.ask(|reply| Command::Reject { local_id, reply }).await
    }

    /// Cancel an outgoing call or end an answered one.
    pub async fn hang_up(&self, local_id: LocalCallId) -> Result<(), SessionError> {
        self.ask(|reply| Command::HangUp { local_id, reply }).await
    }

    /// Relay a local ICE candidate. Queued until the call has a server id.
    pub async fn send_ice_candidate(
        &self,
        local_id: LocalCallId,
        candidate: Payload,
    ) -> Result<(), SessionError> {
        self.ask(|reply| Command::LocalCandidate {
            local_id,
            candidate,
            reply,
        })
        .await
    }

    /// The current call, including a finished one during its grace period.
    pub fn current_call(&self) -> Option<Call> {
        self.call_rx.borrow().clone()
    }

    // -- chat ---------------------------------------------------------------

    /// Send a message. It is in the conversation log, as `Sent`, once this
    /// returns; the returned handle resolves with the ack outcome.
    pub async fn send_message(
        &self,
        peer: UserId,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<PendingMessage, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendMessage {
            peer,
            content: content.into(),
            kind,
            reply,
        })?;
        let (local_id, outcome) = rx.await.map_err(|_| SessionError::Stopped)??;
        Ok(PendingMessage { local_id, outcome })
    }

    /// Send a failed message again. It gets a new local id and takes the
    /// failed entry's place in the log.
    pub async fn resend(&self, local_id: LocalMessageId) -> Result<PendingMessage, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resend { local_id, reply })?;
        let (local_id, outcome) = rx.await.map_err(|_| SessionError::Stopped)??;
        Ok(PendingMessage { local_id, outcome })
    }

    /// Messages exchanged with `peer`, oldest first.
    pub async fn conversation(&self, peer: &UserId) -> Result<Vec<Message>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Conversation {
            peer: peer.clone(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Report a keystroke in the conversation with `peer`.
    pub fn notify_typing(&self, peer: &UserId) -> Result<(), SessionError> {
        self.send(Command::Typing(peer.clone()))
    }

    /// Report that input for `peer` was cleared.
    pub fn stop_typing(&self, peer: &UserId) -> Result<(), SessionError> {
        self.send(Command::StopTyping(peer.clone()))
    }

    /// Peers currently shown as typing.
    pub async fn typing_peers(&self) -> Result<Vec<UserId>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TypingPeers(reply))?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    fn send(&self, cmd: Command) -> Result<(), SessionError> {
        self.cmd_tx.send(cmd).map_err(|_| SessionError::Stopped)
    }

    async fn ask(
        &self,
        cmd: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(cmd(reply))?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }
}

/// An outgoing call that was started.
pub struct PendingCall {
    local_id: LocalCallId,
    settled: oneshot::Receiver<Call>,
}

impl PendingCall {
    pub fn local_id(&self) -> LocalCallId {
        self.local_id
    }

    /// Wait until the call is Active or finished and return that snapshot.
    /// Dropping this does not affect the call.
    pub async fn settled(self) -> Result<Call, SessionError> {
        self.settled.await.map_err(|_| SessionError::Stopped)
    }
}

/// A message that was sent and awaits its ack.
pub struct PendingMessage {
    local_id: LocalMessageId,
    outcome: oneshot::Receiver<Result<Message, AckError>>,
}

impl PendingMessage {
    pub fn local_id(&self) -> LocalMessageId {
        self.local_id
    }

    /// Resolve with the delivered message, or the reason it failed.
    /// Dropping this does not affect delivery.
    pub async fn delivered(self) -> Result<Message, SessionError> {
        Ok(self.outcome.await.map_err(|_| SessionError::Stopped)??)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;
type MessageOutcome = oneshot::Sender<Result<Message, AckError>>;

enum Command {
    CallUser {
        peer: UserId,
        media: MediaType,
        offer: Payload,
        reply: Reply<(LocalCallId, oneshot::Receiver<Call>)>,
    },
    Accept {
        local_id: LocalCallId,
        answer: Payload,
        reply: Reply<()>,
    },
    Reject {
        local_id: LocalCallId,
        reply: Reply<()>,
    },
    HangUp {
        local_id: LocalCallId,
        reply: Reply<()>,
    },
    LocalCandidate {
        local_id: LocalCallId,
        candidate: Payload,
        reply: Reply<()>,
    },
    SendMessage {
        peer: UserId,
        content: String,
        kind: MessageKind,
        reply: Reply<(LocalMessageId, oneshot::Receiver<Result<Message, AckError>>)>,
    },
    Resend {
        local_id: LocalMessageId,
        reply: Reply<(LocalMessageId, oneshot::Receiver<Result<Message, AckError>>)>,
    },
    Conversation {
        peer: UserId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Typing(UserId),
    StopTyping(UserId),
    TypingPeers(oneshot::Sender<Vec<UserId>>),
}

/// Outcome of an acked request, routed back to the component that sent it.
enum AckCompletion {
    CallCreated {
        local_id: LocalCallId,
        result: Result<CallCreatedAck, AckError>,
    },
    Answered {
        local_id: LocalCallId,
        result: Result<(), AckError>,
    },
    Message {
        local_id: LocalMessageId,
        result: Result<MessageAck, AckError>,
    },
    Notified {
        event: &'static str,
        result: Result<Value, AckError>,
    },
}

struct Driver {
    local_user: UserId,
    config: SessionConfig,
    connection: ConnectionHandle,
    dispatcher: Arc<EventDispatcher<SessionEvent>>,
    machine: CallMachine,
    channel: MessageChannel,
    debouncer: TypingDebouncer,
    tracker: TypingTracker,
    call_tx: watch::Sender<Option<Call>>,
    call_waiters: HashMap<LocalCallId, oneshot::Sender<Call>>,
    message_waiters: HashMap<LocalMessageId, MessageOutcome>,
    acks: FuturesUnordered<BoxFuture<'static, AckCompletion>>,
}

/// Wall-clock reading for the state machines, following tokio's clock so
/// paused-time tests drive timeouts.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut notif_rx: mpsc::Receiver<ConnectionNotification>,
    ) {
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All session handles dropped, stopping");
                        break;
                    }
                },
                Some(notification) = notif_rx.recv() => self.handle_notification(notification),
                Some(done) = self.acks.next(), if !self.acks.is_empty() => self.handle_ack(done),
                _ = tick.tick() => self.handle_tick(),
            }
        }
    }

    // -- commands -----------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CallUser {
                peer,
                media,
                offer,
                reply,
            } => match self.machine.start_call(peer, media, offer, now()) {
                Ok((local_id, actions)) => {
                    let (tx, rx) = oneshot::channel();
                    self.call_waiters.insert(local_id, tx);
                    let _ = reply.send(Ok((local_id, rx)));
                    self.apply(actions);
                }
                Err(e) => {
                    debug!(error = %e, "Call refused");
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Accept {
                local_id,
                answer,
                reply,
            } => {
                let result = self.machine.accept(local_id, answer);
                self.reply_with_actions(result, reply);
            }
            Command::Reject { local_id, reply } => {
                let result = self.machine.reject(local_id, now());
                self.reply_with_actions(result, reply);
            }
            Command::HangUp { local_id, reply } => {
                let result = self.machine.hang_up(local_id, now());
                self.reply_with_actions(result, reply);
            }
            Command::LocalCandidate {
                local_id,
                candidate,
                reply,
            } => {
                let result = self.machine.add_local_candidate(local_id, candidate);
                self.reply_with_actions(result, reply);
            }
            Command::SendMessage {
                peer,
                content,
                kind,
                reply,
            } => {
                let result = self.channel.send(peer, content, kind);
                self.start_send(result, reply);
            }
            Command::Resend { local_id, reply } => {
                let result = self.channel.resend(local_id);
                self.start_send(result, reply);
            }
            Command::Conversation { peer, reply } => {
                let _ = reply.send(self.channel.conversation(&peer).to_vec());
            }
            Command::Typing(peer) => {
                if let Some(event) = self.debouncer.on_input(&peer, now()) {
                    self.emit(event);
                }
            }
            Command::StopTyping(peer) => {
                if let Some(event) = self.debouncer.stop(&peer) {
                    self.emit(event);
                }
            }
            Command::TypingPeers(reply) => {
                let peers = self
                    .tracker
                    .typing_peers()
                    .map(|state| state.peer_id.clone())
                    .collect();
                let _ = reply.send(peers);
            }
        }
    }

    fn reply_with_actions(
        &mut self,
        result: Result<Vec<SignalingAction>, kindred_call::CallError>,
        reply: Reply<()>,
    ) {
        match result {
            Ok(actions) => {
                let _ = reply.send(Ok(()));
                self.apply(actions);
            }
            Err(e) => {
                debug!(error = %e, "Call operation refused");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn start_send(
        &mut self,
        result: Result<(Message, ClientEvent), kindred_chat::ChatError>,
        reply: Reply<(LocalMessageId, oneshot::Receiver<Result<Message, AckError>>)>,
    ) {
        let (message, event) = match result {
            Ok(sent) => sent,
            Err(e) => {
                debug!(error = %e, "Message refused");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        // Sending ends the typing burst for that conversation.
        if let Some(stop) = self.debouncer.stop(&message.peer_id) {
            self.emit(stop);
        }

        let local_id = message.local_id;
        let (tx, rx) = oneshot::channel();
        self.message_waiters.insert(local_id, tx);
        let _ = reply.send(Ok((local_id, rx)));

        let request = self.connection.request(event, self.config.ack_timeout);
        self.acks.push(
            async move {
                let result = request
                    .await
                    .and_then(|data| parse_ack::<MessageAck>("send_message", data));
                AckCompletion::Message { local_id, result }
            }
            .boxed(),
        );
        self.publish(SessionEvent::MessageUpdated(message));
    }

    // -- connection notifications -------------------------------------------

    fn handle_notification(&mut self, notification: ConnectionNotification) {
        match notification {
            ConnectionNotification::StateChanged(state) => {
                info!(state = ?state, "Connection state changed");
                self.publish(SessionEvent::ConnectionChanged(state));
                if state == ConnectionState::Disconnected {
                    self.on_disconnected();
                }
            }
            ConnectionNotification::Lost { attempts } => {
                warn!(attempts, "Connection lost for good");
                self.publish(SessionEvent::ConnectionLost { attempts });
            }
            ConnectionNotification::Event(event) => self.handle_server_event(event),
        }
    }

    fn on_disconnected(&mut self) {
        let actions = self.machine.on_transport_lost(now());
        self.apply(actions);
        for peer_id in self.tracker.clear_all() {
            self.publish(SessionEvent::TypingChanged {
                peer_id,
                typing: false,
            });
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        debug!(event = %event.name(), "Server event");
        self.publish(SessionEvent::Server(event.clone()));
        let now = now();

        match &event {
            ServerEvent::NewMessage(incoming) => {
                if incoming.sender_id != self.local_user {
                    self.set_typing(&incoming.sender_id, false, now);
                }
                if let Some(message) = self.channel.on_incoming(incoming) {
                    if message.status == AckStatus::Delivered {
                        self.resolve_message(&message);
                    }
                    self.publish(SessionEvent::MessageUpdated(message));
                }
            }
            ServerEvent::UserTyping { sender_id } => self.set_typing(sender_id, true, now),
            ServerEvent::UserStoppedTyping { sender_id } => self.set_typing(sender_id, false, now),
            _ => {
                let actions = self.machine.on_server_event(&event, now);
                self.apply(actions);
            }
        }
    }

    fn set_typing(&mut self, peer: &UserId, typing: bool, now: std::time::Instant) {
        let changed = if typing {
            self.tracker.on_typing(peer, now)
        } else {
            self.tracker.clear(peer)
        };
        if changed {
            self.publish(SessionEvent::TypingChanged {
                peer_id: peer.clone(),
                typing,
            });
        }
    }

    // -- ack completions ----------------------------------------------------

    fn handle_ack(&mut self, done: AckCompletion) {
        match done {
            AckCompletion::CallCreated { local_id, result } => {
                let actions = self.machine.on_call_created(local_id, result, now());
                self.apply(actions);
            }
            AckCompletion::Answered { local_id, result } => {
                let actions = self.machine.on_answer_acked(local_id, result, now());
                self.apply(actions);
            }
            AckCompletion::Message { local_id, result } => {
                let error = result.as_ref().err().cloned();
                for message in self.channel.on_ack(local_id, result) {
                    if message.status == AckStatus::Delivered {
                        self.resolve_message(&message);
                    }
                    self.publish(SessionEvent::MessageUpdated(message));
                }
                let Some(waiter) = self.message_waiters.remove(&local_id) else {
                    return;
                };
                let outcome = match (self.channel.message(local_id), error) {
                    (Some(message), _) if message.status == AckStatus::Delivered => {
                        Ok(message.clone())
                    }
                    (_, Some(e)) => Err(e),
                    (_, None) => Err(AckError::Malformed {
                        event: "send_message".to_string(),
                        reason: "message no longer in the log".to_string(),
                    }),
                };
                let _ = waiter.send(outcome);
            }
            AckCompletion::Notified { event, result } => match result {
                Ok(_) => debug!(event, "Acknowledged"),
                Err(e) => warn!(event, error = %e, "Request failed"),
            },
        }
    }

    fn resolve_message(&mut self, message: &Message) {
        if let Some(waiter) = self.message_waiters.remove(&message.local_id) {
            let _ = waiter.send(Ok(message.clone()));
        }
    }

    // -- housekeeping -------------------------------------------------------

    fn handle_tick(&mut self) {
        let now = now();

        let actions = self.machine.tick(now);
        self.apply(actions);

        for stop in self.debouncer.sweep(now) {
            self.emit(stop);
        }
        for peer_id in self.tracker.sweep(now) {
            debug!(peer = %peer_id.short(), "Typing indicator expired");
            self.publish(SessionEvent::TypingChanged {
                peer_id,
                typing: false,
            });
        }
    }

    // -- effects ------------------------------------------------------------

    fn apply(&mut self, actions: Vec<SignalingAction>) {
        for action in actions {
            match action {
                SignalingAction::Emit(event) => self.emit(event),
                SignalingAction::Notify(event) => {
                    let name = event.name();
                    let request = self.connection.request(event, self.config.ack_timeout);
                    self.acks.push(
                        async move {
                            AckCompletion::Notified {
                                event: name,
                                result: request.await,
                            }
                        }
                        .boxed(),
                    );
                }
                SignalingAction::RequestCall { local_id, event } => {
                    let request = self.connection.request(event, self.config.ack_timeout);
                    self.acks.push(
                        async move {
                            let result = request
                                .await
                                .and_then(|data| parse_ack::<CallCreatedAck>("call_user", data));
                            AckCompletion::CallCreated { local_id, result }
                        }
                        .boxed(),
                    );
                }
                SignalingAction::RequestAnswer { local_id, event } => {
                    let request = self.connection.request(event, self.config.ack_timeout);
                    self.acks.push(
                        async move {
                            let result = request.await.map(|_| ());
                            AckCompletion::Answered { local_id, result }
                        }
                        .boxed(),
                    );
                }
                SignalingAction::SetRemoteDescription {
                    local_id,
                    description,
                } => self.publish(SessionEvent::RemoteDescription {
                    local_id,
                    description,
                }),
                SignalingAction::AddIceCandidate {
                    local_id,
                    candidate,
                } => self.publish(SessionEvent::RemoteCandidate {
                    local_id,
                    candidate,
                }),
                SignalingAction::Updated(call) => {
                    debug!(call = %call.local_id, state = %call.state, "Call updated");
                    if call.state == CallState::Active || call.is_terminal() {
                        if let Some(waiter) = self.call_waiters.remove(&call.local_id) {
                            let _ = waiter.send(call.clone());
                        }
                    }
                    self.publish(SessionEvent::CallUpdated(call));
                }
            }
        }
        self.call_tx.send_replace(self.machine.current().cloned());
    }

    fn emit(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.connection.emit(event) {
            debug!(event = name, error = %e, "Dropped fire-and-forget event");
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.dispatcher.publish(&event);
    }
}
