//! Typed publish/subscribe for call events
//!
//! Observers register callbacks per [`EventKind`] with [`EventBus::on`], or take
//! a broadcast receiver with [`EventBus::subscribe`] to consume every event
//! from an async task.

use crate::media::MediaStreamHandle;
use crate::types::{CallId, CallRecord, CallSession, CallState, PeerConnectionState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Category of a terminal or reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Operation not legal in the current state
    InvalidState,
    /// Capture device unavailable or permission denied
    MediaAcquisition,
    /// Signaling send failed or was negatively acknowledged
    Transport,
    /// Offer/answer/candidate application failed, or the peer connection failed
    Negotiation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidState => "InvalidStateError",
            Self::MediaAcquisition => "MediaAcquisitionError",
            Self::Transport => "TransportError",
            Self::Negotiation => "NegotiationError",
        };
        f.write_str(name)
    }
}

/// Name of an event, used as the registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// `callStateChange`
    CallStateChange,
    /// `incomingCall`
    IncomingCall,
    /// `outgoingCall`
    OutgoingCall,
    /// `localStreamReady`
    LocalStreamReady,
    /// `remoteStreamReady`
    RemoteStreamReady,
    /// `connectionStateChange`
    ConnectionStateChange,
    /// `videoToggled`
    VideoToggled,
    /// `audioToggled`
    AudioToggled,
    /// `callRejected`
    CallRejected,
    /// `callEnded`
    CallEnded,
    /// `callFailed`
    CallFailed,
    /// `error`
    Error,
    /// `cleanup`
    Cleanup,
}

impl EventKind {
    /// Every event kind
    pub const ALL: [EventKind; 13] = [
        Self::CallStateChange,
        Self::IncomingCall,
        Self::OutgoingCall,
        Self::LocalStreamReady,
        Self::RemoteStreamReady,
        Self::ConnectionStateChange,
        Self::VideoToggled,
        Self::AudioToggled,
        Self::CallRejected,
        Self::CallEnded,
        Self::CallFailed,
        Self::Error,
        Self::Cleanup,
    ];
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The engine moved between states
    CallStateChange {
        /// State before the transition
        previous: CallState,
        /// State after the transition
        current: CallState,
    },
    /// A remote participant is calling
    IncomingCall {
        /// The ringing session
        call: CallSession,
    },
    /// The server accepted our call and the remote side is ringing
    OutgoingCall {
        /// The ringing session
        call: CallSession,
    },
    /// Local capture acquired
    LocalStreamReady {
        /// Local capture handle
        stream: MediaStreamHandle,
    },
    /// A remote track arrived
    RemoteStreamReady {
        /// Remote stream, including every track received so far
        stream: MediaStreamHandle,
    },
    /// The peer connection changed status
    ConnectionStateChange {
        /// Call the connection belongs to, once known
        call_id: Option<CallId>,
        /// New status
        state: PeerConnectionState,
    },
    /// Local video enablement flipped
    VideoToggled {
        /// New enabled state
        enabled: bool,
    },
    /// Local audio enablement flipped
    AudioToggled {
        /// New enabled state
        enabled: bool,
    },
    /// The call was rejected by either side
    CallRejected {
        /// Finished call
        record: CallRecord,
    },
    /// The call was hung up, cancelled or missed
    CallEnded {
        /// Finished call
        record: CallRecord,
    },
    /// The call failed
    CallFailed {
        /// Finished call
        record: CallRecord,
        /// Failure description
        reason: String,
    },
    /// A terminal error occurred
    Error {
        /// Error category
        kind: ErrorKind,
        /// Error description
        error: String,
    },
    /// Session resources were released
    Cleanup {
        /// Call that was cleaned up, if it had an ID
        call_id: Option<CallId>,
    },
}

impl CallEvent {
    /// Registration key of this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CallStateChange { .. } => EventKind::CallStateChange,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::OutgoingCall { .. } => EventKind::OutgoingCall,
            Self::LocalStreamReady { .. } => EventKind::LocalStreamReady,
            Self::RemoteStreamReady { .. } => EventKind::RemoteStreamReady,
            Self::ConnectionStateChange { .. } => EventKind::ConnectionStateChange,
            Self::VideoToggled { .. } => EventKind::VideoToggled,
            Self::AudioToggled { .. } => EventKind::AudioToggled,
            Self::CallRejected { .. } => EventKind::CallRejected,
            Self::CallEnded { .. } => EventKind::CallEnded,
            Self::CallFailed { .. } => EventKind::CallFailed,
            Self::Error { .. } => EventKind::Error,
            Self::Cleanup { .. } => EventKind::Cleanup,
        }
    }
}

/// Callback registered on the bus
pub type EventHandler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

/// Publish/subscribe hub shared by every engine component
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    event_sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Register a handler for one event kind
    pub fn on(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Remove a previously registered handler
    ///
    /// Handlers are matched by pointer identity; unknown handlers are ignored.
    pub fn off(&self, kind: EventKind, handler: &EventHandler) {
        let mut handlers = self.handlers.write();
        if let Some(list) = handlers.get_mut(&kind) {
            if let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
                list.remove(pos);
            }
        }
    }

    /// Number of handlers registered for `kind`
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler for the event's kind, in registration order
    ///
    /// A panicking handler is logged and skipped; later handlers still run and
    /// the panic never reaches the emitter.
    pub fn emit(&self, event: CallEvent) {
        let kind = event.kind();
        // Snapshot so handlers may call `on`/`off` without deadlocking.
        let handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(event = ?kind, handler = index, "Event handler panicked");
            }
        }

        let _ = self.event_sender.send(event);
    }

    /// Subscribe to every event through a broadcast channel
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventBus")
            .field("kinds", &handlers.len())
            .field("subscribers", &self.event_sender.receiver_count())
            .finish()
    }
}
