//! Peer connection management
//!
//! [`PeerConnectionFactory`] and [`PeerConnectionBackend`] are the seams to
//! the underlying peer connection implementation (see [`crate::rtc`] for the
//! `webrtc` one). [`PeerConnectionManager`] creates one connection per
//! session and wires its callbacks into signaling and the event bus.

use crate::events::{CallEvent, EventBus};
use crate::media::{MediaStreamHandle, MediaTrack, StreamOrigin};
use crate::signaling::{SignalingChannel, SignalingHandler, SignalingMessage};
use crate::types::{CallId, IceCandidate, IceServer, ParticipantId, PeerConnectionState, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Peer connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Local track could not be attached
    #[error("Failed to add track: {0}")]
    AddTrack(String),

    /// Offer creation failed
    #[error("Failed to create offer: {0}")]
    CreateOffer(String),

    /// Answer creation failed
    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    /// Local description rejected
    #[error("Failed to set local description: {0}")]
    LocalDescription(String),

    /// Remote description rejected
    #[error("Failed to set remote description: {0}")]
    RemoteDescription(String),

    /// Remote candidate rejected
    #[error("Failed to add ICE candidate: {0}")]
    AddCandidate(String),

    /// The transport reported a permanent failure
    #[error("Peer connection failed")]
    ConnectionFailed,

    /// The backend failed to shut down
    #[error("Failed to close peer connection: {0}")]
    Close(String),

    /// The connection was already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Callback raised by a peer connection backend
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack {
        /// Remote stream the track belongs to
        stream_id: String,
        /// The track
        track: MediaTrack,
    },
    /// The connection status changed
    StateChanged(PeerConnectionState),
}

/// Channel a backend reports its callbacks on
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Constructs peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection using the given traversal servers
    ///
    /// The backend must report its callbacks on `events` until closed.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnectionBackend>, NegotiationError>;
}

/// One underlying peer connection
#[async_trait]
pub trait PeerConnectionBackend: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;

    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply the local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    /// Apply the remote description
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Add a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Close the connection
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Connection status reported to the session owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection status changed
    State(PeerConnectionState),
    /// A remote candidate could not be applied
    CandidateFailed(NegotiationError),
}

/// Where a connection's local candidates are sent
#[derive(Debug, Clone)]
pub struct ConnectionRoute {
    /// Call ID, if already assigned by the server
    pub call_id: Option<CallId>,
    /// Remote participant
    pub remote: ParticipantId,
}

/// Creates peer connections and wires their callbacks
pub struct PeerConnectionManager<S: SignalingChannel> {
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    signaling: Arc<SignalingHandler<S>>,
    bus: Arc<EventBus>,
}

impl<S: SignalingChannel + 'static> PeerConnectionManager<S> {
    /// Create a manager
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        ice_servers: Vec<IceServer>,
        signaling: Arc<SignalingHandler<S>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            factory,
            ice_servers,
            signaling,
            bus,
        }
    }

    /// Traversal servers every connection is configured with
    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Create a connection and start forwarding its callbacks
    ///
    /// Local candidates are sent to `route.remote`. Candidates gathered
    /// before the call ID is known are held until [`ConnectionHandle::bind_call`].
    /// Status changes are published on the bus and reported on `status`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot create the connection
    #[tracing::instrument(skip(self, status), fields(remote = %route.remote))]
    pub async fn create(
        &self,
        route: ConnectionRoute,
        status: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<ConnectionHandle, NegotiationError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let backend = self.factory.create(&self.ice_servers, event_tx).await?;

        let (call_tx, call_rx) = watch::channel(route.call_id.clone());
        let remote_stream = Arc::new(Mutex::new(None));

        let pump = CallbackPump {
            remote: route.remote,
            call_rx,
            held: Vec::new(),
            remote_stream: Arc::clone(&remote_stream),
            signaling: Arc::clone(&self.signaling),
            bus: Arc::clone(&self.bus),
            status: status.clone(),
        };
        let pump_task = tokio::spawn(pump.run(event_rx));

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let applier_task = tokio::spawn(apply_candidates(
            Arc::clone(&backend),
            candidate_rx,
            status,
        ));

        tracing::debug!(servers = self.ice_servers.len(), "Peer connection created");

        Ok(ConnectionHandle {
            backend,
            call_tx,
            candidate_tx,
            remote_stream,
            tasks: Mutex::new(vec![pump_task, applier_task]),
            closed: AtomicBool::new(false),
        })
    }
}

struct CallbackPump<S: SignalingChannel> {
    remote: ParticipantId,
    call_rx: watch::Receiver<Option<CallId>>,
    held: Vec<IceCandidate>,
    remote_stream: Arc<Mutex<Option<MediaStreamHandle>>>,
    signaling: Arc<SignalingHandler<S>>,
    bus: Arc<EventBus>,
    status: mpsc::UnboundedSender<ConnectionSignal>,
}

impl<S: SignalingChannel + 'static> CallbackPump<S> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let mut bound = self.call_rx.borrow().is_some();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                changed = self.call_rx.changed(), if !bound => {
                    if changed.is_err() {
                        break;
                    }
                    let call_id = self.call_rx.borrow_and_update().clone();
                    if let Some(call_id) = call_id {
                        bound = true;
                        for candidate in std::mem::take(&mut self.held) {
                            self.send_candidate(&call_id, candidate).await;
                        }
                    }
                }
            }
        }
        tracing::trace!("Peer callback pump finished");
    }

    async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let call_id = self.call_rx.borrow().clone();
                match call_id {
                    Some(call_id) => self.send_candidate(&call_id, candidate).await,
                    None => self.held.push(candidate),
                }
            }
            PeerEvent::RemoteTrack { stream_id, track } => {
                let stream = {
                    let mut slot = self.remote_stream.lock();
                    match slot.as_ref() {
                        Some(stream) => {
                            stream.push_track(track);
                            stream.clone()
                        }
                        None => {
                            let stream =
                                MediaStreamHandle::new(stream_id, StreamOrigin::Remote, vec![track]);
                            *slot = Some(stream.clone());
                            stream
                        }
                    }
                };
                tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Remote track received");
                self.bus.emit(CallEvent::RemoteStreamReady { stream });
            }
            PeerEvent::StateChanged(state) => {
                let call_id = self.call_rx.borrow().clone();
                tracing::debug!(call_id = ?call_id, state = ?state, "Peer connection state changed");
                self.bus
                    .emit(CallEvent::ConnectionStateChange { call_id, state });
                let _ = self.status.send(ConnectionSignal::State(state));
            }
        }
    }

    async fn send_candidate(&self, call_id: &CallId, candidate: IceCandidate) {
        tracing::trace!(call_id = %call_id, candidate = %candidate.candidate, "Sending local candidate");
        let message = SignalingMessage::IceCandidate {
            call_id: call_id.clone(),
            to: self.remote.clone(),
            candidate,
        };
        if let Err(e) = self.signaling.emit(message).await {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to send local candidate");
        }
    }
}

async fn apply_candidates(
    backend: Arc<dyn PeerConnectionBackend>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    status: mpsc::UnboundedSender<ConnectionSignal>,
) {
    while let Some(candidate) = candidates.recv().await {
        tracing::trace!(candidate = %candidate.candidate, "Applying remote candidate");
        if let Err(e) = backend.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Remote candidate rejected");
            let _ = status.send(ConnectionSignal::CandidateFailed(e));
            break;
        }
    }
}

/// Handle to one session's peer connection
///
/// Every operation fails fast with [`NegotiationError::Closed`] after
/// [`close`](Self::close).
pub struct ConnectionHandle {
    backend: Arc<dyn PeerConnectionBackend>,
    call_tx: watch::Sender<Option<CallId>>,
    candidate_tx: mpsc::UnboundedSender<IceCandidate>,
    remote_stream: Arc<Mutex<Option<MediaStreamHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    /// Attach every track of a local stream
    ///
    /// The stream stays owned by the caller; closing the connection never
    /// stops local tracks.
    ///
    /// # Errors
    ///
    /// Returns error on the first track the backend refuses
    pub async fn add_local_tracks(&self, stream: &MediaStreamHandle) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            self.backend.add_track(&track).await?;
        }
        Ok(())
    }

    /// Create an SDP offer
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.backend.create_offer().await
    }

    /// Create an SDP answer
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.backend.create_answer().await
    }

    /// Apply the local description
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.backend.set_local_description(desc).await
    }

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.backend.set_remote_description(desc).await
    }

    /// Add one remote candidate directly
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.backend.add_ice_candidate(candidate).await
    }

    /// Sink applying remote candidates in order on a background task
    ///
    /// A rejected candidate is reported as
    /// [`ConnectionSignal::CandidateFailed`] on the status channel.
    pub fn candidate_sink(&self) -> impl FnMut(IceCandidate) + Send + 'static {
        let tx = self.candidate_tx.clone();
        move |candidate| {
            let _ = tx.send(candidate);
        }
    }

    /// Tag local candidates with the server-assigned call ID
    ///
    /// Candidates held while the ID was unknown are sent now.
    pub fn bind_call(&self, call_id: CallId) {
        let _ = self.call_tx.send(Some(call_id));
    }

    /// Remote stream, once a remote track arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.remote_stream.lock().clone()
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection and stop remote tracks
    ///
    /// Idempotent: only the first call touches the backend.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to close
    pub async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(stream) = self.remote_stream.lock().as_ref() {
            stream.stop_all();
        }

        tracing::debug!("Closing peer connection");
        self.backend.close().await
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("call_id", &*self.call_tx.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}
