//! Shared mocks for engine tests

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use callwire_core::{
    Ack, CallEngine, CallEngineConfig, CallEvent, CallId, CallState, CaptureDevice, EventKind,
    IceCandidate, IceServer, MediaConstraints, MediaError, MediaTrack, NegotiationError,
    ParticipantId, PeerConnectionBackend, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventSender, SessionDescription, SignalingChannel, SignalingError, SignalingMessage,
    TrackKind,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const CALL_ID: &str = "call-1";

/// Suspends a mocked operation until the test opens it
pub struct Gate {
    entered: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: AtomicBool::new(false),
            permits: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.entered.store(true, Ordering::SeqCst);
        self.permits.acquire().await.unwrap().forget();
    }

    pub async fn wait_entered(&self) {
        eventually(|| self.entered.load(Ordering::SeqCst)).await;
    }

    pub fn open(&self) {
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

/// Poll until `check` holds, failing the test after two seconds
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}

// ----- Capture -----

#[derive(Default)]
pub struct MockCapture {
    pub fail_with: Mutex<Option<MediaError>>,
    pub gate: Mutex<Option<Arc<Gate>>>,
    pub opened: Mutex<Vec<MediaTrack>>,
    pub skip_video: AtomicBool,
}

impl MockCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_tracks(&self) -> usize {
        self.opened.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl CaptureDevice for MockCapture {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>, MediaError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(err) = self.fail_with.lock().clone() {
            return Err(err);
        }

        let n = self.opened.lock().len();
        let tracks: Vec<MediaTrack> = constraints
            .to_track_kinds()
            .into_iter()
            .filter(|kind| !(*kind == TrackKind::Video && self.skip_video.load(Ordering::SeqCst)))
            .enumerate()
            .map(|(i, kind)| MediaTrack::new(format!("mock-{kind}-{}", n + i), kind))
            .collect();
        self.opened.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

// ----- Peer connections -----

pub struct MockPeer {
    pub ops: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    events: PeerEventSender,
    auto_connect: bool,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    fail_remote: bool,
    fail_candidate: bool,
    remote_gate: Option<Arc<Gate>>,
}

impl MockPeer {
    fn log(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| op.strip_prefix("add_candidate:").map(str::to_string))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn report_state(&self, state: PeerConnectionState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    pub fn gather_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(PeerEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    pub fn receive_track(&self, stream_id: &str, kind: TrackKind) {
        let _ = self.events.send(PeerEvent::RemoteTrack {
            stream_id: stream_id.to_string(),
            track: MediaTrack::new(format!("remote-{kind}"), kind),
        });
    }

    fn maybe_connect(&self) {
        if self.auto_connect
            && self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
        {
            self.report_state(PeerConnectionState::Connecting);
            self.report_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnectionBackend for MockPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.log(format!("add_track:{}", track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log("create_offer");
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log("create_answer");
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.log(format!("set_local:{}", desc.sdp));
        self.has_local.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if let Some(gate) = &self.remote_gate {
            gate.pass().await;
        }
        if self.fail_remote {
            return Err(NegotiationError::RemoteDescription("bad sdp".into()));
        }
        self.log(format!("set_remote:{}", desc.sdp));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.fail_candidate {
            return Err(NegotiationError::AddCandidate(candidate.candidate));
        }
        self.log(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.log("close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    pub peers: Mutex<Vec<Arc<MockPeer>>>,
    pub ice_servers: Mutex<Vec<IceServer>>,
    pub auto_connect: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_remote: AtomicBool,
    pub fail_candidate: AtomicBool,
    pub remote_gate: Mutex<Option<Arc<Gate>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn auto_connecting() -> Arc<Self> {
        let factory = Self::default();
        factory.auto_connect.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    /// Most recently created connection
    pub fn last(&self) -> Arc<MockPeer> {
        Arc::clone(self.peers.lock().last().unwrap())
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnectionBackend>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Create("no transport".into()));
        }
        *self.ice_servers.lock() = ice_servers.to_vec();

        let peer = Arc::new(MockPeer {
            ops: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events,
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            fail_remote: self.fail_remote.load(Ordering::SeqCst),
            fail_candidate: self.fail_candidate.load(Ordering::SeqCst),
            remote_gate: self.remote_gate.lock().clone(),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ----- Signaling -----

/// Records everything the engine sends and answers requests from a script
pub struct MockSignaling {
    pub sent: Mutex<Vec<SignalingMessage>>,
    pub initiate_ack: Mutex<Ack>,
    pub fail_type: Mutex<Option<&'static str>>,
    pub gate: Mutex<Option<(&'static str, Arc<Gate>)>>,
    pub requests: AtomicUsize,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            initiate_ack: Mutex::new(Ack::ok_with_call(CallId::from(CALL_ID))),
            fail_type: Mutex::new(None),
            gate: Mutex::new(None),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.type_name()).collect()
    }

    pub fn count(&self, message_type: &str) -> usize {
        self.sent_types()
            .into_iter()
            .filter(|t| *t == message_type)
            .count()
    }

    async fn deliver(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let gate = self
            .gate
            .lock()
            .as_ref()
            .filter(|(t, _)| *t == message.type_name())
            .map(|(_, gate)| Arc::clone(gate));
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if *self.fail_type.lock() == Some(message.type_name()) {
            return Err(SignalingError::TransportError("socket closed".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn request(&self, message: SignalingMessage) -> Result<Ack, SignalingError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let is_initiate = matches!(message, SignalingMessage::Initiate { .. });
        self.deliver(message).await?;
        if is_initiate {
            Ok(self.initiate_ack.lock().clone())
        } else {
            Ok(Ack::ok())
        }
    }

    async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.deliver(message).await
    }
}

// ----- Events -----

/// Synchronously records every event published on an engine's bus
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<CallEvent>>>,
}

impl Recorder {
    pub fn attach(engine: &CallEngine<impl SignalingChannel + 'static>) -> Self {
        let recorder = Self::default();
        for kind in EventKind::ALL {
            let events = Arc::clone(&recorder.events);
            engine
                .events()
                .on(kind, Arc::new(move |event: &CallEvent| events.lock().push(event.clone())));
        }
        recorder
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(CallEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn transitions(&self) -> Vec<(CallState, CallState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallEvent::CallStateChange { previous, current } => Some((*previous, *current)),
                _ => None,
            })
            .collect()
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<CallState> {
        self.transitions().into_iter().map(|(_, to)| to).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

// ----- Harness -----

pub struct Harness {
    pub engine: Arc<CallEngine<MockSignaling>>,
    pub signaling: Arc<MockSignaling>,
    pub capture: Arc<MockCapture>,
    pub peers: Arc<MockPeerFactory>,
    pub events: Recorder,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(MockPeerFactory::new())
    }

    pub fn with_factory(peers: Arc<MockPeerFactory>) -> Self {
        let signaling = MockSignaling::new();
        let capture = MockCapture::new();
        let engine = CallEngine::builder(ParticipantId::new("u1"), Arc::clone(&signaling))
            .with_config(CallEngineConfig::default())
            .with_capture_device(Arc::clone(&capture) as Arc<dyn CaptureDevice>)
            .with_peer_factory(Arc::clone(&peers) as Arc<dyn PeerConnectionFactory>)
            .build()
            .unwrap();
        let events = Recorder::attach(&engine);
        Self {
            engine,
            signaling,
            capture,
            peers,
            events,
        }
    }

    pub fn call_id() -> CallId {
        CallId::from(CALL_ID)
    }

    pub fn remote() -> ParticipantId {
        ParticipantId::new("u2")
    }

    /// Deliver a server push
    pub async fn push(&self, message: SignalingMessage) -> bool {
        self.engine.handle_signal(message).await
    }

    pub async fn push_incoming(&self, kind: callwire_core::CallKind) -> bool {
        self.push(SignalingMessage::Incoming {
            call_id: Self::call_id(),
            from: Self::remote(),
            call_type: kind,
            chat_context: None,
        })
        .await
    }

    pub async fn push_accepted(&self) -> bool {
        self.push(SignalingMessage::Accepted {
            call_id: Self::call_id(),
            from: Self::remote(),
        })
        .await
    }

    pub async fn push_offer(&self) -> bool {
        self.push(SignalingMessage::Offer {
            call_id: Self::call_id(),
            to: ParticipantId::new("u1"),
            sdp: "v=0 remote-offer".into(),
        })
        .await
    }

    pub async fn push_answer(&self) -> bool {
        self.push(SignalingMessage::Answer {
            call_id: Self::call_id(),
            to: ParticipantId::new("u1"),
            sdp: "v=0 remote-answer".into(),
        })
        .await
    }

    pub async fn push_candidate(&self, candidate: &str) -> bool {
        self.push(SignalingMessage::IceCandidate {
            call_id: Self::call_id(),
            to: ParticipantId::new("u1"),
            candidate: IceCandidate::new(candidate),
        })
        .await
    }

    pub async fn push_ended(&self) -> bool {
        self.push(SignalingMessage::Ended {
            call_id: Self::call_id(),
        })
        .await
    }

    /// Wait for the engine to settle back to idle
    pub async fn wait_idle(&self) {
        let engine = Arc::clone(&self.engine);
        eventually(move || engine.state() == CallState::Idle).await;
    }

    pub async fn wait_state(&self, state: CallState) {
        let engine = Arc::clone(&self.engine);
        eventually(move || engine.state() == state).await;
    }
}
