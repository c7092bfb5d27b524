//! Callwire - call-session signaling engine for two-party WebRTC calls
//!
//! This library drives one audio or video call at a time between two
//! participants: it places and answers calls through a signaling server,
//! negotiates a peer connection, and publishes every state change as an
//! event. It features:
//!
//! - **Explicit State Machine**: nine call states with validated transitions
//! - **Pluggable Signaling**: any request/ack transport behind [`SignalingChannel`]
//! - **Candidate Buffering**: remote ICE candidates held until the remote description lands
//! - **Guaranteed Cleanup**: capture, queue and connection released on every terminal state
//! - **In-Process Relay**: a [`SignalingRelay`] for tests and loopback calls
//!
//! # Examples
//!
//! ```rust,no_run
//! use callwire_core::{CallEngine, CallKind, ParticipantId, SignalingRelay};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = SignalingRelay::new();
//! let (endpoint, inbound) = relay.register(ParticipantId::new("alice"));
//!
//! let engine = CallEngine::builder(ParticipantId::new("alice"), std::sync::Arc::new(endpoint))
//!     .build()?;
//! engine.spawn_inbound(inbound);
//!
//! let _call_id = engine
//!     .start_call(ParticipantId::new("bob"), CallKind::Video, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Call events and the event bus
pub mod events;

/// Local capture and media stream handles
pub mod media;

/// Remote ICE candidate buffering
pub mod ice;

/// Signaling protocol and handlers
pub mod signaling;

/// In-process signaling server
pub mod relay;

/// Peer connection lifecycle
pub mod peer;

/// Call session state machine
pub mod call;

/// Engine configuration and builder
pub mod service;

/// `webrtc` crate backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use call::{CallEngine, CallError};
pub use events::{CallEvent, ErrorKind, EventBus, EventHandler, EventKind};
pub use ice::{IceCandidateQueue, QueueMode};
pub use media::{
    CaptureDevice, MediaCaptureAdapter, MediaError, MediaStreamHandle, MediaTrack, StreamOrigin,
};
pub use peer::{
    ConnectionHandle, ConnectionRoute, ConnectionSignal, NegotiationError, PeerConnectionBackend,
    PeerConnectionFactory, PeerConnectionManager, PeerEvent, PeerEventSender,
};
pub use relay::{RelayEndpoint, SignalingRelay};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcPeerConnection, RtcPeerConnectionFactory, SampleCaptureDevice};
pub use service::{CallEngineBuilder, CallEngineConfig, ServiceError};
pub use signaling::{Ack, SignalingChannel, SignalingError, SignalingHandler, SignalingMessage};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEngine, CallError};
    pub use crate::events::{CallEvent, EventBus, EventKind};
    pub use crate::relay::SignalingRelay;
    pub use crate::service::{CallEngineBuilder, CallEngineConfig};
    pub use crate::signaling::{SignalingChannel, SignalingMessage};
    pub use crate::types::{
        CallId, CallKind, CallRecord, CallRole, CallSession, CallState, ParticipantId,
    };
}
