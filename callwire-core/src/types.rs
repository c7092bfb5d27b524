//! Call engine types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a new random call ID
    ///
    /// Only the signaling server mints call IDs; endpoints receive theirs in
    /// the `initiate` acknowledgment or the `incoming` push.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identifier of a call participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque reference to the conversation a call originated from
///
/// Passed through the engine and the signaling layer unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatContext(pub serde_json::Value);

impl From<&str> for ChatContext {
    fn from(s: &str) -> Self {
        Self(serde_json::Value::String(s.to_string()))
    }
}

/// Kind of call, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallKind {
    /// Media constraints requested from the capture device for this kind
    #[must_use]
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::Audio => MediaConstraints::audio_only(),
            Self::Video => MediaConstraints::video_call(),
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which side of the call this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Placed the call; sends the media offer
    Initiator,
    /// Received the call; answers the media offer
    Receiver,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No active call
    Idle,
    /// Acquiring capture and waiting for the server to acknowledge the call
    Initiating,
    /// Waiting for the receiver to answer
    Ringing,
    /// Call accepted, media negotiation in progress
    Connecting,
    /// Peer transport connected
    Connected,
    /// Hung up by either side
    Ended,
    /// Declined by the receiver
    Rejected,
    /// Nobody answered before the ring timeout
    Missed,
    /// Capture, transport or negotiation failure
    Failed,
}

impl CallState {
    /// All nine states
    pub const ALL: [CallState; 9] = [
        Self::Idle,
        Self::Initiating,
        Self::Ringing,
        Self::Connecting,
        Self::Connected,
        Self::Ended,
        Self::Rejected,
        Self::Missed,
        Self::Failed,
    ];

    /// Terminal states only exit to `Idle` once cleanup completes
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::Missed | Self::Failed
        )
    }

    /// Check whether a transition is part of the call state machine
    #[must_use]
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Initiating)
                | (Self::Idle, Self::Ringing)
                | (Self::Initiating, Self::Ringing)
                | (Self::Initiating, Self::Failed)
                | (Self::Initiating, Self::Ended)
                | (Self::Ringing, Self::Connecting)
                | (Self::Ringing, Self::Rejected)
                | (Self::Ringing, Self::Ended)
                | (Self::Ringing, Self::Missed)
                | (Self::Ringing, Self::Failed)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Failed)
                | (Self::Connecting, Self::Ended)
                | (Self::Connecting, Self::Rejected)
                | (Self::Connected, Self::Ended)
                | (Self::Connected, Self::Failed)
                | (Self::Connected, Self::Rejected)
                | (Self::Ended, Self::Idle)
                | (Self::Rejected, Self::Idle)
                | (Self::Missed, Self::Idle)
                | (Self::Failed, Self::Idle)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Media constraints for a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Convert to the track kinds that must be captured
    pub fn to_track_kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiator
    Offer,
    /// Answer from the receiver
    Answer,
}

/// Session description exchanged during offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap SDP text as an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap SDP text as an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, in the shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Network-traversal (STUN/TURN) server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// Optional username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server entry with a single URL and no credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Status of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Created, nothing negotiated yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed permanently
    Failed,
    /// Closed locally
    Closed,
}

/// One active or pending call
///
/// Carries the data that is valid once the server has assigned a call ID;
/// the current [`CallState`] is owned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// This endpoint
    pub local_participant: ParticipantId,
    /// The other endpoint
    pub remote_participant: ParticipantId,
    /// Audio or video
    pub kind: CallKind,
    /// Initiator or receiver
    pub role: CallRole,
    /// Conversation the call came from
    pub chat_context: Option<ChatContext>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// First transition into `Connected`
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Time spent connected so far
    pub fn connected_for(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

/// Summary of a finished call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call identifier, absent if the call never got one from the server
    pub call_id: Option<CallId>,
    /// This endpoint
    pub local_participant: ParticipantId,
    /// The other endpoint
    pub remote_participant: ParticipantId,
    /// Audio or video
    pub kind: CallKind,
    /// Initiator or receiver
    pub role: CallRole,
    /// Terminal state the call finished in
    pub outcome: CallState,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// When the peer transport first connected
    pub connected_at: Option<DateTime<Utc>>,
    /// When the call reached its terminal state
    pub ended_at: DateTime<Utc>,
}

impl CallRecord {
    /// Connected duration; `None` if the call never connected
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| self.ended_at - start)
    }

    /// Time from creation until the terminal state
    pub fn total_duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}
