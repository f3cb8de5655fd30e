//! Call signaling state machine.
//!
//! [`CallMachine`] owns the single call of a session. It is a pure state
//! machine: every input (local operation, server event, ack outcome, clock
//! tick) returns the [`SignalingAction`]s the owner must carry out, in order.
//! Time is passed in, never read.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use kindred_shared::constants::{
    CALL_GRACE_PERIOD, CONNECT_TIMEOUT, MAX_EARLY_CALL_EVENTS, REJECT_REASON_BUSY,
    REJECT_REASON_DECLINED, REJECT_REASON_MISSED, RETIRED_CALL_IDS, RING_TIMEOUT,
};
use kindred_shared::protocol::{CallCreatedAck, ClientEvent, Payload, ServerEvent};
use kindred_shared::{AckError, CallId, MediaType, UserId};

use crate::error::CallError;

/// Local handle of a call, valid before the server assigns a call_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LocalCallId(pub u64);

impl fmt::Display for LocalCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// State of an existing call. "Idle" is the absence of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Ringing the peer.
    Outgoing,
    /// Ringing locally.
    Incoming,
    /// Accepted locally, waiting for the server to confirm the answer.
    Answered,
    Active,
    Ended,
    Rejected,
    Missed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::Missed | Self::Failed
        )
    }

    pub fn is_ringing(self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Answered => "answered",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Outgoing call cancelled before the peer answered.
    Cancelled,
    /// Incoming call declined locally.
    Declined,
    RemoteRejected(Option<String>),
    /// The caller hung up while we were ringing.
    CallerCancelled,
    RingTimeout,
    ConnectTimeout,
    AckTimeout,
    ServerError(String),
    TransportLost,
}

#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub local_id: LocalCallId,
    pub call_id: Option<CallId>,
    pub peer_id: UserId,
    pub direction: CallDirection,
    pub media: MediaType,
    pub state: CallState,
    pub offer: Option<Payload>,
    pub answer: Option<Payload>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    #[serde(skip)]
    remote_applied: bool,
    #[serde(skip)]
    remote_candidates: Vec<Payload>,
    #[serde(skip)]
    local_candidates: Vec<Payload>,
}

impl Call {
    fn new(
        local_id: LocalCallId,
        call_id: Option<CallId>,
        peer_id: UserId,
        direction: CallDirection,
        media: MediaType,
        state: CallState,
        offer: Payload,
    ) -> Self {
        Self {
            local_id,
            call_id,
            peer_id,
            direction,
            media,
            state,
            offer: Some(offer),
            answer: None,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            remote_applied: false,
            remote_candidates: Vec::new(),
            local_candidates: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time between answer and end, for calls that were answered.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let answered = self.answered_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - answered)
    }

    /// Remote candidates held until the remote description is applied.
    pub fn buffered_remote_candidates(&self) -> &[Payload] {
        &self.remote_candidates
    }

    /// Local candidates held until the call_id is known.
    pub fn queued_local_candidates(&self) -> &[Payload] {
        &self.local_candidates
    }

    fn matches(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }

    fn finish(&mut self, state: CallState, reason: EndReason) {
        self.state = state;
        self.end_reason = Some(reason);
        self.ended_at = Some(Utc::now());
    }
}

/// What the owner of the machine must do.
#[derive(Debug, Clone)]
pub enum SignalingAction {
    /// Send a fire-and-forget event.
    Emit(ClientEvent),
    /// Send an acked event whose outcome only needs logging.
    Notify(ClientEvent),
    /// Send `call_user` and report its ack through
    /// [`CallMachine::on_call_created`].
    RequestCall {
        local_id: LocalCallId,
        event: ClientEvent,
    },
    /// Send `answer_call` and report its ack through
    /// [`CallMachine::on_answer_acked`].
    RequestAnswer {
        local_id: LocalCallId,
        event: ClientEvent,
    },
    /// Apply the remote session description. Always precedes the
    /// candidates buffered for it.
    SetRemoteDescription {
        local_id: LocalCallId,
        description: Payload,
    },
    AddIceCandidate {
        local_id: LocalCallId,
        candidate: Payload,
    },
    /// The call changed; snapshot after the change.
    Updated(Call),
}

#[derive(Debug, Clone)]
pub struct CallTimeouts {
    /// Unanswered incoming call becomes Missed.
    pub ring: Duration,
    /// Unanswered outgoing call becomes Failed.
    pub connect: Duration,
    /// How long a finished call stays readable.
    pub grace: Duration,
    /// Held events for an outgoing call without a call_id past which a
    /// warning is logged.
    pub max_early_events: usize,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            ring: RING_TIMEOUT,
            connect: CONNECT_TIMEOUT,
            grace: CALL_GRACE_PERIOD,
            max_early_events: MAX_EARLY_CALL_EVENTS,
        }
    }
}

pub struct CallMachine {
    timeouts: CallTimeouts,
    next_local_id: u64,
    current: Option<Call>,
    /// Ring/connect timeout while live, end of grace once finished.
    deadline: Option<Instant>,
    early_events: Vec<ServerEvent>,
    /// Call ids that can no longer become the current call.
    retired: VecDeque<CallId>,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new(CallTimeouts::default())
    }
}

impl CallMachine {
    pub fn new(timeouts: CallTimeouts) -> Self {
        Self {
            timeouts,
            next_local_id: 1,
            current: None,
            deadline: None,
            early_events: Vec::new(),
            retired: VecDeque::new(),
        }
    }

    /// The current call, including a finished one still in its grace period.
    pub fn current(&self) -> Option<&Call> {
        self.current.as_ref()
    }

    /// The current call if it has not finished.
    pub fn active(&self) -> Option<&Call> {
        self.current.as_ref().filter(|call| !call.is_terminal())
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // -- local operations ---------------------------------------------------

    /// Start an outgoing call. Fails with `Busy` without side effects when a
    /// call is already in progress.
    pub fn start_call(
        &mut self,
        peer_id: UserId,
        media: MediaType,
        offer: Payload,
        now: Instant,
    ) -> Result<(LocalCallId, Vec<SignalingAction>), CallError> {
        if let Some(call) = self.active() {
            return Err(CallError::Busy { state: call.state });
        }

        let local_id = self.allocate_id();
        info!(call = %local_id, peer = %peer_id.short(), media = %media, "Starting outgoing call");

        let call = Call::new(
            local_id,
            None,
            peer_id.clone(),
            CallDirection::Outgoing,
            media,
            CallState::Outgoing,
            offer.clone(),
        );
        let snapshot = SignalingAction::Updated(call.clone());
        self.current = Some(call);
        self.deadline = Some(now + self.timeouts.connect);
        self.early_events.clear();

        let request = ClientEvent::CallUser {
            receiver_id: peer_id,
            call_type: media,
            offer,
        };
        Ok((
            local_id,
            vec![
                snapshot,
                SignalingAction::RequestCall {
                    local_id,
                    event: request,
                },
            ],
        ))
    }

    /// Accept the ringing incoming call with a local answer.
    pub fn accept(
        &mut self,
        local_id: LocalCallId,
        answer: Payload,
    ) -> Result<Vec<SignalingAction>, CallError> {
        let call = self.call_in(local_id, &[CallState::Incoming], "accept")?;
        let Some(call_id) = call.call_id.clone() else {
            return Err(CallError::InvalidState {
                local_id,
                operation: "accept",
                state: call.state,
            });
        };

        call.state = CallState::Answered;
        call.answer = Some(answer.clone());
        call.answered_at = Some(Utc::now());
        debug!(call = %local_id, call_id = %call_id, "Answering call");

        let offer = call.offer.clone().unwrap_or_default();
        let flushed = apply_remote_description(call, offer);
        let mut actions = vec![
            SignalingAction::Updated(call.clone()),
            SignalingAction::RequestAnswer {
                local_id,
                event: ClientEvent::AnswerCall { call_id, answer },
            },
        ];
        actions.extend(flushed);
        self.deadline = None;
        Ok(actions)
    }

    /// Decline the ringing incoming call.
    pub fn reject(
        &mut self,
        local_id: LocalCallId,
        now: Instant,
    ) -> Result<Vec<SignalingAction>, CallError> {
        let call = self.call_in(local_id, &[CallState::Incoming], "reject")?;
        let call_id = call.call_id.clone();

        let mut actions = self.finish(CallState::Rejected, EndReason::Declined, now);
        if let Some(call_id) = call_id {
            actions.push(SignalingAction::Notify(ClientEvent::RejectCall {
                call_id,
                reason: REJECT_REASON_DECLINED.to_string(),
            }));
        }
        Ok(actions)
    }

    /// Cancel an outgoing call or hang up an answered one.
    pub fn hang_up(
        &mut self,
        local_id: LocalCallId,
        now: Instant,
    ) -> Result<Vec<SignalingAction>, CallError> {
        let call = self.call_in(
            local_id,
            &[CallState::Outgoing, CallState::Answered, CallState::Active],
            "hang up",
        )?;
        let (state, call_id) = (call.state, call.call_id.clone());

        let reason = if state == CallState::Outgoing {
            EndReason::Cancelled
        } else {
            EndReason::LocalHangup
        };
        let mut actions = self.finish(CallState::Ended, reason, now);
        match call_id {
            Some(call_id) => actions.push(SignalingAction::Notify(ClientEvent::EndCall { call_id })),
            // end_call goes out when the call_user ack arrives.
            None => debug!(call = %local_id, "Cancelled before the call was created"),
        }
        Ok(actions)
    }

    /// Relay a local ICE candidate, or queue it until the call_id is known.
    pub fn add_local_candidate(
        &mut self,
        local_id: LocalCallId,
        candidate: Payload,
    ) -> Result<Vec<SignalingAction>, CallError> {
        let call = self.call_in(
            local_id,
            &[
                CallState::Outgoing,
                CallState::Incoming,
                CallState::Answered,
                CallState::Active,
            ],
            "send a candidate for",
        )?;

        match call.call_id.clone() {
            Some(call_id) => Ok(vec![SignalingAction::Emit(ClientEvent::IceCandidate {
                call_id,
                candidate,
            })]),
            None => {
                call.local_candidates.push(candidate);
                debug!(call = %local_id, queued = call.local_candidates.len(), "Queued local candidate");
                Ok(Vec::new())
            }
        }
    }

    // -- ack outcomes -------------------------------------------------------

    /// Outcome of the `call_user` request for `local_id`.
    pub fn on_call_created(
        &mut self,
        local_id: LocalCallId,
        result: Result<CallCreatedAck, AckError>,
        now: Instant,
    ) -> Vec<SignalingAction> {
        let awaiting = matches!(
            &self.current,
            Some(call) if call.local_id == local_id
                && call.state == CallState::Outgoing
                && call.call_id.is_none()
        );

        if !awaiting {
            return match result {
                Ok(ack) => {
                    info!(call = %local_id, call_id = %ack.call_id, "Call created after it finished, ending it");
                    self.retire(ack.call_id.clone());
                    vec![SignalingAction::Notify(ClientEvent::EndCall {
                        call_id: ack.call_id,
                    })]
                }
                Err(e) => {
                    debug!(call = %local_id, error = %e, "Ignoring call_user failure for a finished call");
                    Vec::new()
                }
            };
        }

        match result {
            Ok(ack) => self.assign_call_id(ack.call_id, now),
            Err(e) => {
                warn!(call = %local_id, error = %e, "call_user failed");
                self.finish(CallState::Failed, reason_for(&e), now)
            }
        }
    }

    /// Outcome of the `answer_call` request for `local_id`.
    pub fn on_answer_acked(
        &mut self,
        local_id: LocalCallId,
        result: Result<(), AckError>,
        now: Instant,
    ) -> Vec<SignalingAction> {
        let answered = matches!(
            &self.current,
            Some(call) if call.local_id == local_id && call.state == CallState::Answered
        );
        if !answered {
            debug!(call = %local_id, "Ignoring answer ack for a call no longer answering");
            return Vec::new();
        }

        match result {
            Ok(()) => {
                let Some(call) = self.current.as_mut() else {
                    return Vec::new();
                };
                call.state = CallState::Active;
                info!(call = %local_id, "Call active");
                vec![SignalingAction::Updated(call.clone())]
            }
            Err(e) => {
                warn!(call = %local_id, error = %e, "answer_call failed");
                self.finish(CallState::Failed, reason_for(&e), now)
            }
        }
    }

    // -- inbound events -----------------------------------------------------

    /// Apply a server event. Non-call events and events that do not apply to
    /// the current call produce no actions.
    pub fn on_server_event(&mut self, event: &ServerEvent, now: Instant) -> Vec<SignalingAction> {
        if let ServerEvent::IncomingCall {
            call_id,
            caller_id,
            call_type,
            offer,
        } = event
        {
            return self.on_incoming(call_id, caller_id, *call_type, offer, now);
        }
        let Some(call_id) = event.call_id() else {
            return Vec::new();
        };

        let awaiting_id = matches!(
            &self.current,
            Some(call) if call.state == CallState::Outgoing && call.call_id.is_none()
        );
        if awaiting_id {
            self.hold_early(event, call_id);
            return Vec::new();
        }

        let state = match &self.current {
            Some(call) if call.matches(call_id) && !call.is_terminal() => call.state,
            Some(call) if call.matches(call_id) => {
                debug!(event = %event.name(), call_id = %call_id, state = %call.state, "Ignoring event for finished call");
                return Vec::new();
            }
            _ => {
                debug!(event = %event.name(), call_id = %call_id, "Ignoring event for unknown call");
                return Vec::new();
            }
        };

        match event {
            ServerEvent::CallAnswered { answer, .. } if state == CallState::Outgoing => {
                self.on_answered(answer.clone())
            }
            ServerEvent::CallRejected { reason, .. } if state == CallState::Outgoing => {
                info!(call_id = %call_id, reason = ?reason, "Call rejected by peer");
                self.finish(
                    CallState::Rejected,
                    EndReason::RemoteRejected(reason.clone()),
                    now,
                )
            }
            ServerEvent::CallEnded { .. } if state == CallState::Incoming => {
                self.finish(CallState::Missed, EndReason::CallerCancelled, now)
            }
            ServerEvent::CallEnded { .. } => {
                self.finish(CallState::Ended, EndReason::RemoteHangup, now)
            }
            ServerEvent::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate.clone()),
            _ => {
                debug!(event = %event.name(), state = %state, "Event does not apply in this state");
                Vec::new()
            }
        }
    }

    /// Expire ring/connect timeouts and drop finished calls whose grace
    /// period has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<SignalingAction> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Vec::new(),
        }
        let Some(call) = self.current.as_ref() else {
            self.deadline = None;
            return Vec::new();
        };
        let (local_id, state, call_id) = (call.local_id, call.state, call.call_id.clone());

        match state {
            s if s.is_terminal() => {
                debug!(call = %local_id, "Discarding finished call");
                self.current = None;
                self.deadline = None;
                Vec::new()
            }
            CallState::Incoming => {
                info!(call = %local_id, "Incoming call was not answered");
                let mut actions = self.finish(CallState::Missed, EndReason::RingTimeout, now);
                if let Some(call_id) = call_id {
                    actions.push(SignalingAction::Notify(ClientEvent::RejectCall {
                        call_id,
                        reason: REJECT_REASON_MISSED.to_string(),
                    }));
                }
                actions
            }
            CallState::Outgoing => {
                info!(call = %local_id, "Outgoing call was not answered");
                let mut actions = self.finish(CallState::Failed, EndReason::ConnectTimeout, now);
                if let Some(call_id) = call_id {
                    actions.push(SignalingAction::Notify(ClientEvent::EndCall { call_id }));
                }
                actions
            }
            _ => {
                self.deadline = None;
                Vec::new()
            }
        }
    }

    /// The connection is gone for good; fail whatever call is live.
    pub fn on_transport_lost(&mut self, now: Instant) -> Vec<SignalingAction> {
        if !self.is_busy() {
            return Vec::new();
        }
        warn!("Connection lost during call");
        self.finish(CallState::Failed, EndReason::TransportLost, now)
    }

    // -- internals ----------------------------------------------------------

    fn allocate_id(&mut self) -> LocalCallId {
        let id = LocalCallId(self.next_local_id);
        self.next_local_id += 1;
        id
    }

    fn call_in(
        &mut self,
        local_id: LocalCallId,
        allowed: &[CallState],
        operation: &'static str,
    ) -> Result<&mut Call, CallError> {
        let call = self
            .current
            .as_mut()
            .filter(|call| call.local_id == local_id)
            .ok_or(CallError::UnknownCall(local_id))?;
        if !allowed.contains(&call.state) {
            return Err(CallError::InvalidState {
                local_id,
                operation,
                state: call.state,
            });
        }
        Ok(call)
    }

    fn on_incoming(
        &mut self,
        call_id: &CallId,
        caller_id: &UserId,
        media: MediaType,
        offer: &Payload,
        now: Instant,
    ) -> Vec<SignalingAction> {
        if matches!(&self.current, Some(call) if call.matches(call_id)) {
            debug!(call_id = %call_id, "Ignoring duplicate incoming_call");
            return Vec::new();
        }
        if let Some(active) = self.active() {
            info!(
                call_id = %call_id,
                caller = %caller_id.short(),
                busy_with = %active.local_id,
                "Rejecting incoming call while busy"
            );
            self.retire(call_id.clone());
            return vec![SignalingAction::Notify(ClientEvent::RejectCall {
                call_id: call_id.clone(),
                reason: REJECT_REASON_BUSY.to_string(),
            })];
        }

        let local_id = self.allocate_id();
        info!(call = %local_id, call_id = %call_id, caller = %caller_id.short(), media = %media, "Incoming call");

        let call = Call::new(
            local_id,
            Some(call_id.clone()),
            caller_id.clone(),
            CallDirection::Incoming,
            media,
            CallState::Incoming,
            offer.clone(),
        );
        let snapshot = SignalingAction::Updated(call.clone());
        self.current = Some(call);
        self.deadline = Some(now + self.timeouts.ring);
        self.early_events.clear();
        vec![snapshot]
    }

    fn on_answered(&mut self, answer: Payload) -> Vec<SignalingAction> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        call.state = CallState::Active;
        call.answer = Some(answer.clone());
        call.answered_at = Some(Utc::now());
        info!(call = %call.local_id, "Call answered by peer");

        let flushed = apply_remote_description(call, answer);
        let mut actions = vec![SignalingAction::Updated(call.clone())];
        actions.extend(flushed);
        self.deadline = None;
        actions
    }

    fn on_remote_candidate(&mut self, candidate: Payload) -> Vec<SignalingAction> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        if call.remote_applied {
            return vec![SignalingAction::AddIceCandidate {
                local_id: call.local_id,
                candidate,
            }];
        }
        call.remote_candidates.push(candidate);
        debug!(call = %call.local_id, buffered = call.remote_candidates.len(), "Buffered remote candidate");
        Vec::new()
    }

    fn assign_call_id(&mut self, call_id: CallId, now: Instant) -> Vec<SignalingAction> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        info!(call = %call.local_id, call_id = %call_id, "Call created");
        call.call_id = Some(call_id.clone());
        let queued = std::mem::take(&mut call.local_candidates);

        let mut actions = vec![SignalingAction::Updated(call.clone())];
        actions.extend(queued.into_iter().map(|candidate| {
            SignalingAction::Emit(ClientEvent::IceCandidate {
                call_id: call_id.clone(),
                candidate,
            })
        }));

        for event in std::mem::take(&mut self.early_events) {
            if event.call_id() == Some(&call_id) {
                actions.extend(self.on_server_event(&event, now));
            } else {
                debug!(event = %event.name(), "Dropping held event for another call");
            }
        }
        actions
    }

    fn finish(&mut self, state: CallState, reason: EndReason, now: Instant) -> Vec<SignalingAction> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        call.finish(state, reason);
        info!(call = %call.local_id, state = %state, reason = ?call.end_reason, "Call finished");
        let snapshot = SignalingAction::Updated(call.clone());
        if let Some(call_id) = call.call_id.clone() {
            self.retire(call_id);
        }
        self.deadline = Some(now + self.timeouts.grace);
        self.early_events.clear();
        vec![snapshot]
    }

    /// Hold an event for an outgoing call still waiting for its call_id.
    /// Events for retired calls and exact repeats are discarded; anything
    /// else may belong to this call and is kept until the call_id arrives.
    fn hold_early(&mut self, event: &ServerEvent, call_id: &CallId) {
        if self.retired.contains(call_id) {
            debug!(event = %event.name(), call_id = %call_id, "Ignoring event for a retired call");
            return;
        }
        if self.early_events.contains(event) {
            debug!(event = %event.name(), call_id = %call_id, "Ignoring repeated early event");
            return;
        }
        debug!(event = %event.name(), call_id = %call_id, "Holding event until the call is created");
        self.early_events.push(event.clone());
        if self.early_events.len() == self.timeouts.max_early_events + 1 {
            warn!(held = self.early_events.len(), "Many events held before the call was created");
        }
    }

    fn retire(&mut self, call_id: CallId) {
        if self.retired.contains(&call_id) {
            return;
        }
        if self.retired.len() == RETIRED_CALL_IDS {
            self.retired.pop_front();
        }
        self.retired.push_back(call_id);
    }
}

/// Mark the remote description applied and release the candidates held
/// for it, in arrival order.
fn apply_remote_description(call: &mut Call, description: Payload) -> Vec<SignalingAction> {
    call.remote_applied = true;
    let local_id = call.local_id;
    let mut actions = vec![SignalingAction::SetRemoteDescription {
        local_id,
        description,
    }];
    actions.extend(
        call.remote_candidates
            .drain(..)
            .map(|candidate| SignalingAction::AddIceCandidate {
                local_id,
                candidate,
            }),
    );
    actions
}

fn reason_for(error: &AckError) -> EndReason {
    if error.is_timeout() {
        EndReason::AckTimeout
    } else {
        EndReason::ServerError(error.to_string())
    }
}
