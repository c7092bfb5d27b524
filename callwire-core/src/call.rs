//! Call session state machine
//!
//! [`CallEngine`] owns the single call session of a local endpoint. It drives
//! local capture, the peer connection and outbound signaling, and validates
//! every inbound signaling message against the current state.
//!
//! ```text
//!                 start_call            incoming
//!     Idle ───────────────► Initiating      │
//!      ▲                        │ ack       │
//!      │                        ▼           ▼
//!      │                     Ringing ◄──────┘
//!      │                        │ accept / accepted
//!      │                        ▼
//!      │                    Connecting
//!      │                        │ peer connected
//!      │                        ▼
//!      │                    Connected
//!      │
//!      └── cleanup ── Ended | Rejected | Missed | Failed
//! ```
//!
//! Key transitions:
//! - `start_call`: Idle → Initiating → Ringing once the server acknowledges
//! - `accept_call`: Ringing → Connecting (receiver only)
//! - `reject_call`: Ringing → Rejected (receiver only)
//! - `end_call`: any active state → Ended
//! - ring timeout: Ringing → Missed (initiator only)
//! - capture, signaling or negotiation failure: any active state → Failed
//!
//! Every terminal state releases local capture, clears the candidate queue,
//! closes the peer connection and returns to `Idle`.
//!
//! # Suspension points
//!
//! Capture, connection setup, SDP creation and description application are
//! awaited without holding the state lock. Each step re-checks that its
//! session is still current before applying its result, so `end_call` (or a
//! remote hang-up) during a suspended step turns the step's completion into
//! a no-op.

use crate::events::{CallEvent, ErrorKind, EventBus};
use crate::ice::IceCandidateQueue;
use crate::media::{CaptureDevice, MediaCaptureAdapter, MediaError, MediaStreamHandle};
use crate::peer::{
    ConnectionHandle, ConnectionRoute, ConnectionSignal, NegotiationError, PeerConnectionFactory,
    PeerConnectionManager,
};
use crate::service::CallEngineConfig;
use crate::signaling::{SignalingChannel, SignalingError, SignalingHandler, SignalingMessage};
use crate::types::{
    CallId, CallKind, CallRecord, CallRole, CallSession, CallState, ChatContext, IceCandidate,
    ParticipantId, PeerConnectionState, SessionDescription, TrackKind,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Inbound messages held while `initiate` is still awaiting its ack
const EARLY_SIGNAL_LIMIT: usize = 64;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation not legal in the current state; nothing changed
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State at the time of the call
        state: CallState,
    },

    /// Local capture failed
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// Signaling failed or was negatively acknowledged
    #[error("Transport error: {0}")]
    Transport(#[from] SignalingError),

    /// Offer/answer or candidate application failed
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The session ended while the operation was suspended
    #[error("{operation} cancelled: the call ended meanwhile")]
    Cancelled {
        /// Cancelled operation
        operation: &'static str,
    },
}

impl CallError {
    /// Category reported in the `error` event
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } | Self::Cancelled { .. } => ErrorKind::InvalidState,
            Self::MediaAcquisition(_) => ErrorKind::MediaAcquisition,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Negotiation(_) => ErrorKind::Negotiation,
        }
    }
}

/// Cancels the ring timer when dropped
#[derive(Debug)]
struct RingTimer {
    _cancel: oneshot::Sender<()>,
}

/// Everything a session must release when it finishes
#[derive(Debug, Default)]
struct Resources {
    local: Option<MediaStreamHandle>,
    connection: Option<Arc<ConnectionHandle>>,
    candidates: IceCandidateQueue,
    ring_timer: Option<RingTimer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    NotStarted,
    OfferSent,
    Applying,
    Applied,
}

/// Outbound call before the server assigned an ID
#[derive(Debug)]
struct Outgoing {
    token: u64,
    remote: ParticipantId,
    kind: CallKind,
    started_at: DateTime<Utc>,
    resources: Resources,
    early: Vec<SignalingMessage>,
}

/// Call with a server-assigned ID
#[derive(Debug)]
struct Session {
    token: u64,
    call: CallSession,
    resources: Resources,
    in_flight: Option<&'static str>,
    negotiation: Negotiation,
}

/// Engine state; each variant carries only the data valid in it
#[derive(Debug)]
enum Phase {
    Idle,
    Initiating(Outgoing),
    Ringing(Session),
    Connecting(Session),
    Connected(Session),
    /// Resources are being released; back to `Idle` once done
    Terminal {
        token: u64,
        state: CallState,
    },
}

impl Phase {
    fn state(&self) -> CallState {
        match self {
            Self::Idle => CallState::Idle,
            Self::Initiating(_) => CallState::Initiating,
            Self::Ringing(_) => CallState::Ringing,
            Self::Connecting(_) => CallState::Connecting,
            Self::Connected(_) => CallState::Connected,
            Self::Terminal { state, .. } => *state,
        }
    }

    /// Token of the live session, if any
    fn token(&self) -> Option<u64> {
        match self {
            Self::Initiating(o) => Some(o.token),
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) => Some(s.token),
            Self::Idle | Self::Terminal { .. } => None,
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) => Some(s),
            _ => None,
        }
    }

    fn session_mut_for(&mut self, token: u64) -> Option<&mut Session> {
        match self {
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) if s.token == token => {
                Some(s)
            }
            _ => None,
        }
    }

    fn resources(&self) -> Option<&Resources> {
        match self {
            Self::Initiating(o) => Some(&o.resources),
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) => Some(&s.resources),
            Self::Idle | Self::Terminal { .. } => None,
        }
    }

    fn resources_mut_for(&mut self, token: u64) -> Option<&mut Resources> {
        match self {
            Self::Initiating(o) if o.token == token => Some(&mut o.resources),
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) if s.token == token => {
                Some(&mut s.resources)
            }
            _ => None,
        }
    }

    /// Consume a live phase into its record and resources
    fn finish(self, local: &ParticipantId, outcome: CallState) -> Option<(CallRecord, Resources)> {
        let ended_at = Utc::now();
        match self {
            Self::Initiating(o) => Some((
                CallRecord {
                    call_id: None,
                    local_participant: local.clone(),
                    remote_participant: o.remote,
                    kind: o.kind,
                    role: CallRole::Initiator,
                    outcome,
                    started_at: o.started_at,
                    connected_at: None,
                    ended_at,
                },
                o.resources,
            )),
            Self::Ringing(s) | Self::Connecting(s) | Self::Connected(s) => Some((
                CallRecord {
                    call_id: Some(s.call.call_id),
                    local_participant: s.call.local_participant,
                    remote_participant: s.call.remote_participant,
                    kind: s.call.kind,
                    role: s.call.role,
                    outcome,
                    started_at: s.call.started_at,
                    connected_at: s.call.connected_at,
                    ended_at,
                },
                s.resources,
            )),
            Self::Idle | Self::Terminal { .. } => None,
        }
    }
}

fn announce(events: &mut Vec<CallEvent>, previous: CallState, current: CallState) {
    if !previous.can_transition_to(current) {
        tracing::error!(old_state = ?previous, new_state = ?current, "Illegal call state transition");
    }
    tracing::debug!(old_state = ?previous, new_state = ?current, "Call state transition");
    events.push(CallEvent::CallStateChange { previous, current });
}

/// Move a session between Ringing, Connecting and Connected
fn promote(phase: &mut Phase, to: CallState, events: &mut Vec<CallEvent>) {
    let previous = phase.state();
    *phase = match std::mem::replace(phase, Phase::Idle) {
        Phase::Ringing(s) | Phase::Connecting(s) | Phase::Connected(s) => match to {
            CallState::Connecting => Phase::Connecting(s),
            CallState::Connected => Phase::Connected(s),
            _ => Phase::Ringing(s),
        },
        other => other,
    };
    announce(events, previous, phase.state());
}

/// Call session engine for one local participant
///
/// Construct it with [`crate::service::CallEngineBuilder`] or
/// [`CallEngine::new`]; feed inbound signaling with
/// [`handle_signal`](Self::handle_signal) or
/// [`spawn_inbound`](Self::spawn_inbound); observe it through
/// [`events`](Self::events).
pub struct CallEngine<S: SignalingChannel + 'static> {
    this: Weak<Self>,
    config: CallEngineConfig,
    local: ParticipantId,
    signaling: Arc<SignalingHandler<S>>,
    media: MediaCaptureAdapter,
    peers: PeerConnectionManager<S>,
    bus: Arc<EventBus>,
    phase: ReentrantMutex<RefCell<Phase>>,
    last_call: Mutex<Option<CallRecord>>,
    next_token: AtomicU64,
}

impl<S: SignalingChannel + 'static> CallEngine<S> {
    /// Create an engine
    pub fn new(
        local: ParticipantId,
        config: CallEngineConfig,
        channel: Arc<S>,
        capture: Arc<dyn CaptureDevice>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.event_capacity));
        let signaling = Arc::new(SignalingHandler::new(channel));
        let peers = PeerConnectionManager::new(
            peers,
            config.ice_servers.clone(),
            Arc::clone(&signaling),
            Arc::clone(&bus),
        );

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            local,
            signaling,
            media: MediaCaptureAdapter::new(capture),
            peers,
            bus,
            phase: ReentrantMutex::new(RefCell::new(Phase::Idle)),
            last_call: Mutex::new(None),
            next_token: AtomicU64::new(1),
        })
    }

    /// Mutate the phase under the lock, then publish the collected events
    ///
    /// Events are published after the phase borrow ends but before the lock
    /// is released, so handlers see them in transition order and may read
    /// engine state.
    fn locked<R>(&self, f: impl FnOnce(&mut Phase, &mut Vec<CallEvent>) -> R) -> R {
        let guard = self.phase.lock();
        let mut events = Vec::new();
        let result = f(&mut guard.borrow_mut(), &mut events);
        for event in events {
            self.bus.emit(event);
        }
        result
    }

    fn is_current(&self, token: u64) -> bool {
        self.phase.lock().borrow().token() == Some(token)
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    // ----- Queries -----

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.phase.lock().borrow().state()
    }

    /// Active session, once the server has assigned a call ID
    #[must_use]
    pub fn current_call(&self) -> Option<CallSession> {
        self.phase.lock().borrow().session().map(|s| s.call.clone())
    }

    /// Summary of the most recently finished call
    #[must_use]
    pub fn last_call(&self) -> Option<CallRecord> {
        self.last_call.lock().clone()
    }

    /// Local capture of the active session
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.phase
            .lock()
            .borrow()
            .resources()
            .and_then(|r| r.local.clone())
    }

    /// Remote stream of the active session, once a remote track arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        let connection = self
            .phase
            .lock()
            .borrow()
            .resources()
            .and_then(|r| r.connection.clone());
        connection.and_then(|c| c.remote_stream())
    }

    /// Event bus the engine publishes on
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe to every event
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }

    /// Local participant
    #[must_use]
    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    // ----- Local operations -----

    /// Place a call
    ///
    /// Acquires local capture, creates the peer connection and sends
    /// `initiate`. Returns once the server acknowledged the call and the
    /// engine is `Ringing`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless idle. Capture, connection and signaling
    /// failures move the session to `Failed` and are returned.
    #[tracing::instrument(skip_all, fields(local = %self.local, remote = %remote, kind = %kind))]
    pub async fn start_call(
        &self,
        remote: ParticipantId,
        kind: CallKind,
        chat_context: Option<ChatContext>,
    ) -> Result<CallId, CallError> {
        const OP: &str = "start_call";

        let token = self.locked(|phase, events| {
            if !matches!(phase, Phase::Idle) {
                let state = phase.state();
                tracing::warn!(state = %state, "Call already in progress");
                return Err(CallError::InvalidState {
                    operation: OP,
                    state,
                });
            }
            let token = self.next_token();
            *phase = Phase::Initiating(Outgoing {
                token,
                remote: remote.clone(),
                kind,
                started_at: Utc::now(),
                resources: Resources::default(),
                early: Vec::new(),
            });
            announce(events, CallState::Idle, CallState::Initiating);
            Ok(token)
        })?;
        tracing::info!("Starting call");

        let route = ConnectionRoute {
            call_id: None,
            remote: remote.clone(),
        };
        self.prepare_media(token, OP, kind, route).await?;
        if !self.is_current(token) {
            return Err(CallError::Cancelled { operation: OP });
        }

        let call_id = match self.signaling.initiate(&remote, kind, chat_context.clone()).await {
            Ok(call_id) => call_id,
            Err(e) => return Err(self.fail(token, e.into()).await),
        };

        let early = self.locked(|phase, events| {
            if !matches!(phase, Phase::Initiating(o) if o.token == token) {
                return None;
            }
            let Phase::Initiating(mut outgoing) = std::mem::replace(phase, Phase::Idle) else {
                return None;
            };

            let call = CallSession {
                call_id: call_id.clone(),
                local_participant: self.local.clone(),
                remote_participant: outgoing.remote,
                kind,
                role: CallRole::Initiator,
                chat_context,
                started_at: outgoing.started_at,
                connected_at: None,
            };
            if let Some(connection) = &outgoing.resources.connection {
                connection.bind_call(call_id.clone());
            }
            outgoing.resources.ring_timer = Some(self.start_ring_timer(token));
            let early = std::mem::take(&mut outgoing.early);

            *phase = Phase::Ringing(Session {
                token,
                call: call.clone(),
                resources: outgoing.resources,
                in_flight: None,
                negotiation: Negotiation::NotStarted,
            });
            announce(events, CallState::Initiating, CallState::Ringing);
            events.push(CallEvent::OutgoingCall { call });
            Some(early)
        });

        let Some(early) = early else {
            // Ended locally while the server was placing the call.
            self.send_end(&call_id, &remote).await;
            return Err(CallError::Cancelled { operation: OP });
        };
        tracing::info!(call_id = %call_id, "Call ringing");

        for message in early {
            if message.call_id() == Some(&call_id) {
                self.handle_signal(message).await;
            } else {
                tracing::warn!(
                    message_type = message.type_name(),
                    "Dropping message for another call received during initiation"
                );
            }
        }
        Ok(call_id)
    }

    /// Answer the ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless ringing as the receiver with no other
    /// operation in flight. Capture, connection and signaling failures move
    /// the session to `Failed` and are returned.
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        const OP: &str = "accept_call";
        let (token, call) = self.claim_ringing(OP)?;
        tracing::info!(call_id = %call.call_id, "Accepting call");

        let route = ConnectionRoute {
            call_id: Some(call.call_id.clone()),
            remote: call.remote_participant.clone(),
        };
        self.prepare_media(token, OP, call.kind, route).await?;

        // Connecting before `accept` goes out: the offer may follow the
        // server's push faster than our ack comes back.
        let connecting = self.locked(|phase, events| {
            if !matches!(phase, Phase::Ringing(s) if s.token == token) {
                return false;
            }
            promote(phase, CallState::Connecting, events);
            if let Some(session) = phase.session_mut_for(token) {
                session.in_flight = None;
            }
            true
        });
        if !connecting {
            return Err(CallError::Cancelled { operation: OP });
        }

        let accept = SignalingMessage::Accept {
            call_id: call.call_id,
            from: self.local.clone(),
        };
        if let Err(e) = self.signaling.send_with_ack(accept).await {
            return Err(self.fail(token, e.into()).await);
        }
        Ok(())
    }

    /// Decline the ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless ringing as the receiver with no other
    /// operation in flight; a failed `reject` send moves the session to
    /// `Failed` and is returned.
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (token, call) = self.claim_ringing("reject_call")?;
        tracing::info!(call_id = %call.call_id, "Rejecting call");

        let reject = SignalingMessage::Reject {
            call_id: call.call_id,
            from: self.local.clone(),
        };
        if let Err(e) = self.signaling.send_with_ack(reject).await {
            return Err(self.fail(token, e.into()).await);
        }

        self.teardown(token, CallState::Rejected, None, false).await;
        Ok(())
    }

    /// Hang up, cancel or abandon the active call
    ///
    /// Sends `end` best-effort. Calling it with no active call (including a
    /// second time) does nothing.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` keeps the signature uniform with the other
    /// operations
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let live = self.phase.lock().borrow().token();
        let Some(token) = live else {
            tracing::debug!("No active call to end");
            return Ok(());
        };
        tracing::info!("Ending call");
        self.teardown(token, CallState::Ended, None, true).await;
        Ok(())
    }

    /// Flip local video and return the new enabled state
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if there is no local capture
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Video, "toggle_video")
    }

    /// Flip local audio and return the new enabled state
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if there is no local capture
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Audio, "toggle_audio")
    }

    fn toggle(&self, kind: TrackKind, operation: &'static str) -> Result<bool, CallError> {
        self.locked(|phase, events| {
            let Some(local) = phase.resources().and_then(|r| r.local.clone()) else {
                return Err(CallError::InvalidState {
                    operation,
                    state: phase.state(),
                });
            };
            let enabled = self.media.toggle_track_kind(&local, kind);
            events.push(match kind {
                TrackKind::Video => CallEvent::VideoToggled { enabled },
                TrackKind::Audio => CallEvent::AudioToggled { enabled },
            });
            Ok(enabled)
        })
    }

    // ----- Inbound signaling -----

    /// Apply one inbound signaling message
    ///
    /// Returns `false` if the message was dropped because it does not fit
    /// the current state or call.
    #[tracing::instrument(skip_all, fields(local = %self.local, message_type = message.type_name()))]
    pub async fn handle_signal(&self, message: SignalingMessage) -> bool {
        if self.stash_early(&message) {
            return true;
        }

        match message {
            SignalingMessage::Incoming {
                call_id,
                from,
                call_type,
                chat_context,
            } => self.handle_incoming_call(call_id, from, call_type, chat_context),
            SignalingMessage::Accepted { call_id, .. } => self.on_accepted(call_id).await,
            SignalingMessage::Rejected { call_id, .. } => {
                self.on_remote_finished(call_id, CallState::Rejected).await
            }
            SignalingMessage::Ended { call_id } => {
                self.on_remote_finished(call_id, CallState::Ended).await
            }
            SignalingMessage::Offer { call_id, sdp, .. } => self.on_offer(call_id, sdp).await,
            SignalingMessage::Answer { call_id, sdp, .. } => self.on_answer(call_id, sdp).await,
            SignalingMessage::IceCandidate {
                call_id, candidate, ..
            } => self.on_remote_candidate(call_id, candidate),
            other => {
                tracing::warn!(
                    message_type = other.type_name(),
                    "Ignoring client-to-server message"
                );
                false
            }
        }
    }

    /// Start ringing for an inbound call
    ///
    /// Local capture is deferred until [`accept_call`](Self::accept_call).
    /// Returns `false` (and drops the call) unless idle.
    pub fn handle_incoming_call(
        &self,
        call_id: CallId,
        from: ParticipantId,
        kind: CallKind,
        chat_context: Option<ChatContext>,
    ) -> bool {
        let accepted = self.locked(|phase, events| {
            if !matches!(phase, Phase::Idle) {
                return false;
            }
            let call = CallSession {
                call_id: call_id.clone(),
                local_participant: self.local.clone(),
                remote_participant: from,
                kind,
                role: CallRole::Receiver,
                chat_context,
                started_at: Utc::now(),
                connected_at: None,
            };
            *phase = Phase::Ringing(Session {
                token: self.next_token(),
                call: call.clone(),
                resources: Resources::default(),
                in_flight: None,
                negotiation: Negotiation::NotStarted,
            });
            announce(events, CallState::Idle, CallState::Ringing);
            events.push(CallEvent::IncomingCall { call });
            true
        });

        if accepted {
            tracing::info!(call_id = %call_id, "Incoming call");
            true
        } else {
            self.dropped("incoming", &call_id)
        }
    }

    /// Pump an inbound message stream into the engine, one message at a time
    pub fn spawn_inbound<St>(&self, mut inbound: St) -> JoinHandle<()>
    where
        St: Stream<Item = SignalingMessage> + Send + Unpin + 'static,
    {
        let engine = self.this.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_signal(message).await;
            }
            tracing::debug!("Inbound signaling stream finished");
        })
    }

    fn stash_early(&self, message: &SignalingMessage) -> bool {
        if matches!(message, SignalingMessage::Incoming { .. }) {
            return false;
        }
        self.locked(|phase, _| match phase {
            Phase::Initiating(outgoing) if outgoing.early.len() < EARLY_SIGNAL_LIMIT => {
                tracing::debug!("Holding message until the call is acknowledged");
                outgoing.early.push(message.clone());
                true
            }
            _ => false,
        })
    }

    fn dropped(&self, message_type: &'static str, call_id: &CallId) -> bool {
        tracing::warn!(
            call_id = %call_id,
            state = %self.state(),
            message_type,
            "Dropping signaling message that does not match the current call"
        );
        false
    }

    async fn on_accepted(&self, call_id: CallId) -> bool {
        let step = self.locked(|phase, events| {
            let Phase::Ringing(session) = phase else {
                return None;
            };
            if session.call.call_id != call_id || session.call.role != CallRole::Initiator {
                return None;
            }
            let connection = session.resources.connection.clone()?;
            let step = (session.token, session.call.remote_participant.clone(), connection);
            session.resources.ring_timer = None;
            promote(phase, CallState::Connecting, events);
            Some(step)
        });
        let Some((token, remote, connection)) = step else {
            return self.dropped("accepted", &call_id);
        };
        tracing::info!(call_id = %call_id, "Call accepted by remote");

        let Some(offer) = self.check(token, connection.create_offer().await).await else {
            return true;
        };
        let Some(()) = self
            .check(token, connection.set_local_description(offer.clone()).await)
            .await
        else {
            return true;
        };

        let proceed = self.locked(|phase, _| match phase.session_mut_for(token) {
            Some(session) if session.negotiation == Negotiation::NotStarted => {
                session.negotiation = Negotiation::OfferSent;
                true
            }
            _ => false,
        });
        if proceed {
            tracing::debug!(call_id = %call_id, "Sending offer");
            let offer = SignalingMessage::Offer {
                call_id,
                to: remote,
                sdp: offer.sdp,
            };
            self.check(token, self.signaling.emit(offer).await).await;
        }
        true
    }

    async fn on_offer(&self, call_id: CallId, sdp: String) -> bool {
        let step = self.locked(|phase, _| {
            let Phase::Connecting(session) = phase else {
                return None;
            };
            if session.call.call_id != call_id
                || session.call.role != CallRole::Receiver
                || session.negotiation != Negotiation::NotStarted
            {
                return None;
            }
            let connection = session.resources.connection.clone()?;
            session.negotiation = Negotiation::Applying;
            Some((session.token, session.call.remote_participant.clone(), connection))
        });
        let Some((token, remote, connection)) = step else {
            return self.dropped("offer", &call_id);
        };
        tracing::debug!(call_id = %call_id, "Applying remote offer");

        let offer = SessionDescription::offer(sdp);
        let Some(()) = self
            .check(token, connection.set_remote_description(offer).await)
            .await
        else {
            return true;
        };
        if !self.drain_candidates(token, &connection) {
            return true;
        }

        let Some(answer) = self.check(token, connection.create_answer().await).await else {
            return true;
        };
        let Some(()) = self
            .check(token, connection.set_local_description(answer.clone()).await)
            .await
        else {
            return true;
        };
        if !self.mark_applied(token) {
            return true;
        }

        tracing::debug!(call_id = %call_id, "Sending answer");
        let answer = SignalingMessage::Answer {
            call_id,
            to: remote,
            sdp: answer.sdp,
        };
        self.check(token, self.signaling.emit(answer).await).await;
        true
    }

    async fn on_answer(&self, call_id: CallId, sdp: String) -> bool {
        let step = self.locked(|phase, _| {
            let session = match phase {
                Phase::Connecting(s) | Phase::Connected(s) => s,
                _ => return None,
            };
            if session.call.call_id != call_id
                || session.call.role != CallRole::Initiator
                || session.negotiation != Negotiation::OfferSent
            {
                return None;
            }
            let connection = session.resources.connection.clone()?;
            session.negotiation = Negotiation::Applying;
            Some((session.token, connection))
        });
        let Some((token, connection)) = step else {
            return self.dropped("answer", &call_id);
        };
        tracing::debug!(call_id = %call_id, "Applying remote answer");

        let answer = SessionDescription::answer(sdp);
        let Some(()) = self
            .check(token, connection.set_remote_description(answer).await)
            .await
        else {
            return true;
        };
        if self.drain_candidates(token, &connection) {
            self.mark_applied(token);
        }
        true
    }

    fn on_remote_candidate(&self, call_id: CallId, candidate: IceCandidate) -> bool {
        let queued = self.locked(|phase, _| {
            let session = match phase {
                Phase::Connecting(s) | Phase::Connected(s) if s.call.call_id == call_id => s,
                _ => return false,
            };
            tracing::trace!(
                call_id = %call_id,
                mode = ?session.resources.candidates.mode(),
                "Remote candidate received"
            );
            session.resources.candidates.enqueue(candidate);
            true
        });
        queued || self.dropped("ice-candidate", &call_id)
    }

    async fn on_remote_finished(&self, call_id: CallId, outcome: CallState) -> bool {
        let token = self.locked(|phase, _| {
            phase
                .session()
                .filter(|s| s.call.call_id == call_id)
                .map(|s| s.token)
        });
        let Some(token) = token else {
            let message_type = if outcome == CallState::Rejected {
                "rejected"
            } else {
                "ended"
            };
            return self.dropped(message_type, &call_id);
        };
        tracing::info!(call_id = %call_id, outcome = %outcome, "Call finished by remote");
        self.teardown(token, outcome, None, false).await;
        true
    }

    // ----- Peer connection and timers -----

    async fn on_connection_signal(&self, token: u64, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::State(PeerConnectionState::Connected) => {
                self.locked(|phase, events| {
                    if !matches!(phase, Phase::Connecting(s) if s.token == token) {
                        return;
                    }
                    promote(phase, CallState::Connected, events);
                    if let Some(session) = phase.session_mut_for(token) {
                        if session.call.connected_at.is_none() {
                            session.call.connected_at = Some(Utc::now());
                        }
                        tracing::info!(call_id = %session.call.call_id, "Call connected");
                    }
                });
            }
            ConnectionSignal::State(PeerConnectionState::Failed) => {
                self.fail(token, NegotiationError::ConnectionFailed.into())
                    .await;
            }
            ConnectionSignal::State(PeerConnectionState::Disconnected) => {
                tracing::warn!("Peer connection disconnected; waiting for recovery or failure");
            }
            ConnectionSignal::State(_) => {}
            ConnectionSignal::CandidateFailed(e) => {
                self.fail(token, e.into()).await;
            }
        }
    }

    fn watch_connection(&self, token: u64, mut status: mpsc::UnboundedReceiver<ConnectionSignal>) {
        let engine = self.this.clone();
        tokio::spawn(async move {
            while let Some(signal) = status.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.on_connection_signal(token, signal).await;
            }
        });
    }

    fn start_ring_timer(&self, token: u64) -> RingTimer {
        let (cancel, cancelled) = oneshot::channel();
        let engine = self.this.clone();
        let timeout = self.config.ring_timeout;

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_ring_timeout(token).await;
                    }
                }
                _ = cancelled => {}
            }
        });
        RingTimer { _cancel: cancel }
    }

    async fn on_ring_timeout(&self, token: u64) {
        let missed = self.locked(|phase, _| {
            matches!(phase, Phase::Ringing(s) if s.token == token && s.call.role == CallRole::Initiator)
        });
        if missed {
            tracing::info!(timeout = ?self.config.ring_timeout, "No answer; call missed");
            self.teardown(token, CallState::Missed, None, true).await;
        }
    }

    // ----- Steps -----

    /// Acquire capture, open the connection and attach local tracks
    async fn prepare_media(
        &self,
        token: u64,
        operation: &'static str,
        kind: CallKind,
        route: ConnectionRoute,
    ) -> Result<(), CallError> {
        let constraints = kind.constraints();
        let local = match self.media.acquire(constraints.video, constraints.audio).await {
            Ok(local) => local,
            Err(e) => return Err(self.fail(token, e.into()).await),
        };

        let adopted = self.locked(|phase, events| match phase.resources_mut_for(token) {
            Some(resources) => {
                resources.local = Some(local.clone());
                events.push(CallEvent::LocalStreamReady {
                    stream: local.clone(),
                });
                true
            }
            None => false,
        });
        if !adopted {
            self.media.release(&local);
            return Err(CallError::Cancelled { operation });
        }

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let connection = match self.peers.create(route, status_tx).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => return Err(self.fail(token, e.into()).await),
        };

        let adopted = self.locked(|phase, _| match phase.resources_mut_for(token) {
            Some(resources) => {
                resources.connection = Some(Arc::clone(&connection));
                true
            }
            None => false,
        });
        if !adopted {
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "Failed to close abandoned peer connection");
            }
            return Err(CallError::Cancelled { operation });
        }
        self.watch_connection(token, status_rx);

        if let Err(e) = connection.add_local_tracks(&local).await {
            return Err(self.fail(token, e.into()).await);
        }
        Ok(())
    }

    fn claim_ringing(&self, operation: &'static str) -> Result<(u64, CallSession), CallError> {
        self.locked(|phase, _| {
            let state = phase.state();
            match phase {
                Phase::Ringing(session)
                    if session.call.role == CallRole::Receiver && session.in_flight.is_none() =>
                {
                    session.in_flight = Some(operation);
                    Ok((session.token, session.call.clone()))
                }
                _ => {
                    tracing::warn!(operation, state = %state, "Operation not allowed in current state");
                    Err(CallError::InvalidState { operation, state })
                }
            }
        })
    }

    /// Deliver buffered remote candidates and switch the queue to passthrough
    fn drain_candidates(&self, token: u64, connection: &ConnectionHandle) -> bool {
        self.locked(|phase, _| match phase.session_mut_for(token) {
            Some(session) => {
                let delivered = session
                    .resources
                    .candidates
                    .drain_into(connection.candidate_sink());
                tracing::debug!(delivered, "Remote description applied");
                true
            }
            None => false,
        })
    }

    fn mark_applied(&self, token: u64) -> bool {
        self.locked(|phase, _| match phase.session_mut_for(token) {
            Some(session) => {
                session.negotiation = Negotiation::Applied;
                true
            }
            None => false,
        })
    }

    /// Pass a step's value through, or route its error through `Failed`
    async fn check<T, E: Into<CallError>>(&self, token: u64, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.fail(token, e.into()).await;
                None
            }
        }
    }

    async fn fail(&self, token: u64, error: CallError) -> CallError {
        if self.teardown(token, CallState::Failed, Some(&error), true).await {
            tracing::error!(error = %error, kind = %error.kind(), "Call failed");
        } else {
            tracing::debug!(error = %error, "Step failed after the call had already finished");
        }
        error
    }

    async fn send_end(&self, call_id: &CallId, remote: &ParticipantId) {
        let end = SignalingMessage::End {
            call_id: call_id.clone(),
            to: remote.clone(),
        };
        let timeout = self.config.end_ack_timeout;
        match tokio::time::timeout(timeout, self.signaling.send_with_ack(end)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to notify remote of call end");
            }
            Err(_) => {
                tracing::warn!(call_id = %call_id, timeout = ?timeout, "Call end was not acknowledged");
            }
        }
    }

    /// Finish the session identified by `token`
    ///
    /// Emits the terminal transition, its error and outcome events, releases
    /// every resource and returns to `Idle` before the remote is told. The
    /// notification waits at most `end_ack_timeout`. Returns `false` if that
    /// session is no longer live.
    async fn teardown(
        &self,
        token: u64,
        outcome: CallState,
        error: Option<&CallError>,
        notify_remote: bool,
    ) -> bool {
        let finished = self.locked(|phase, events| {
            if phase.token() != Some(token) {
                return None;
            }
            let previous = phase.state();
            let old = std::mem::replace(phase, Phase::Terminal { token, state: outcome });
            let Some((record, resources)) = old.finish(&self.local, outcome) else {
                *phase = Phase::Idle;
                return None;
            };
            *self.last_call.lock() = Some(record.clone());

            announce(events, previous, outcome);
            if let Some(error) = error {
                events.push(CallEvent::Error {
                    kind: error.kind(),
                    error: error.to_string(),
                });
            }
            events.push(match outcome {
                CallState::Failed => CallEvent::CallFailed {
                    record: record.clone(),
                    reason: error.map_or_else(|| "call failed".to_string(), ToString::to_string),
                },
                CallState::Rejected => CallEvent::CallRejected {
                    record: record.clone(),
                },
                _ => CallEvent::CallEnded {
                    record: record.clone(),
                },
            });
            Some((record, resources))
        });
        let Some((record, mut resources)) = finished else {
            return false;
        };

        if let Some(local) = resources.local.take() {
            self.media.release(&local);
        }
        let dropped = resources.candidates.clear();
        resources.ring_timer = None;
        tracing::debug!(dropped_candidates = dropped, "Session resources released");

        if let Some(connection) = resources.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }

        self.locked(|phase, events| {
            if matches!(phase, Phase::Terminal { token: t, .. } if *t == token) {
                *phase = Phase::Idle;
                events.push(CallEvent::Cleanup {
                    call_id: record.call_id.clone(),
                });
                announce(events, outcome, CallState::Idle);
            }
        });
        tracing::info!(call_id = ?record.call_id, outcome = %outcome, "Call finished");

        // Best effort, after local cleanup.
        if notify_remote {
            if let Some(call_id) = &record.call_id {
                self.send_end(call_id, &record.remote_participant).await;
            }
        }
        true
    }
}

impl<S: SignalingChannel + 'static> std::fmt::Debug for CallEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local", &self.local)
            .field("state", &self.state())
            .finish()
    }
}
