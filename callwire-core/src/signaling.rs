//! Call signaling protocol
//!
//! Message types exchanged with the signaling server, and the
//! [`SignalingChannel`] boundary the engine sends them through. Inbound
//! push messages are fed to the engine by the host; see
//! [`crate::call::CallEngine::handle_signal`].

use crate::types::{CallId, CallKind, ChatContext, IceCandidate, ParticipantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The server answered with a negative acknowledgment
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The channel is closed
    #[error("Signaling channel closed")]
    Closed,

    /// A message or acknowledgment did not have the expected shape
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Signaling message types
///
/// Serialised as JSON with a `type` tag and camelCase fields, e.g.
/// `{"type":"ice-candidate","callId":"c1","to":"u2","candidate":{..}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Ask the server to place a call; acknowledged with the new call ID
    Initiate {
        /// Callee
        to: ParticipantId,
        /// Audio or video
        call_type: CallKind,
        /// Conversation the call came from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_context: Option<ChatContext>,
    },

    /// Push: someone is calling
    Incoming {
        /// Call ID
        call_id: CallId,
        /// Caller
        from: ParticipantId,
        /// Audio or video
        call_type: CallKind,
        /// Conversation the call came from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_context: Option<ChatContext>,
    },

    /// Receiver answers the call
    Accept {
        /// Call ID
        call_id: CallId,
        /// Receiver
        from: ParticipantId,
    },

    /// Push: the receiver answered
    Accepted {
        /// Call ID
        call_id: CallId,
        /// Receiver
        from: ParticipantId,
    },

    /// Receiver declines the call
    Reject {
        /// Call ID
        call_id: CallId,
        /// Receiver
        from: ParticipantId,
    },

    /// Push: the receiver declined
    Rejected {
        /// Call ID
        call_id: CallId,
        /// Receiver
        from: ParticipantId,
    },

    /// Hang up
    End {
        /// Call ID
        call_id: CallId,
        /// Other participant
        to: ParticipantId,
    },

    /// Push: the other side hung up
    Ended {
        /// Call ID
        call_id: CallId,
    },

    /// SDP offer from the initiator
    Offer {
        /// Call ID
        call_id: CallId,
        /// Other participant
        to: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// SDP answer from the receiver
    Answer {
        /// Call ID
        call_id: CallId,
        /// Other participant
        to: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Call ID
        call_id: CallId,
        /// Other participant
        to: ParticipantId,
        /// Candidate
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    /// Call ID carried by the message; `None` only for `initiate`
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Initiate { .. } => None,
            Self::Incoming { call_id, .. }
            | Self::Accept { call_id, .. }
            | Self::Accepted { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::Rejected { call_id, .. }
            | Self::End { call_id, .. }
            | Self::Ended { call_id }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. } => Some(call_id),
        }
    }

    /// Wire name of the message type
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "initiate",
            Self::Incoming { .. } => "incoming",
            Self::Accept { .. } => "accept",
            Self::Accepted { .. } => "accepted",
            Self::Reject { .. } => "reject",
            Self::Rejected { .. } => "rejected",
            Self::End { .. } => "end",
            Self::Ended { .. } => "ended",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Whether the server originates this message (as opposed to relaying it)
    #[must_use]
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Self::Incoming { .. } | Self::Accepted { .. } | Self::Rejected { .. } | Self::Ended { .. }
        )
    }

    /// Parse a message from its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the text is not a known message
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Serialise the message to its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if serialisation fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Server acknowledgment of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Whether the request was accepted
    pub success: bool,
    /// Call ID assigned by an `initiate` request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// Positive acknowledgment
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            call_id: None,
            error: None,
        }
    }

    /// Positive acknowledgment of an `initiate`
    #[must_use]
    pub fn ok_with_call(call_id: CallId) -> Self {
        Self {
            success: true,
            call_id: Some(call_id),
            error: None,
        }
    }

    /// Negative acknowledgment
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            call_id: None,
            error: Some(error.into()),
        }
    }

    /// Turn a negative acknowledgment into an error
    ///
    /// # Errors
    ///
    /// Returns `Rejected` with the server's reason if `success` is false
    pub fn into_result(self) -> Result<Self, SignalingError> {
        if self.success {
            Ok(self)
        } else {
            Err(SignalingError::Rejected(
                self.error.unwrap_or_else(|| "unspecified".to_string()),
            ))
        }
    }
}

/// Outbound half of the signaling transport
///
/// Implement this for your specific transport (WebSocket, socket.io, an
/// in-process relay, ...). Inbound messages are delivered separately.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a message and wait for the server's acknowledgment
    async fn request(&self, message: SignalingMessage) -> Result<Ack, SignalingError>;

    /// Send a message without waiting for an acknowledgment
    async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

/// Signaling handler wrapping a channel with logging and ack handling
pub struct SignalingHandler<T: SignalingChannel> {
    channel: Arc<T>,
}

impl<T: SignalingChannel> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<T>) -> Self {
        Self { channel }
    }

    /// Place a call and return the server-assigned call ID
    ///
    /// # Errors
    ///
    /// Returns error if sending fails, the server rejects the call, or the
    /// acknowledgment carries no call ID
    #[tracing::instrument(skip(self, chat_context), fields(to = %to, kind = %kind))]
    pub async fn initiate(
        &self,
        to: &ParticipantId,
        kind: CallKind,
        chat_context: Option<ChatContext>,
    ) -> Result<CallId, SignalingError> {
        let ack = self
            .send_with_ack(SignalingMessage::Initiate {
                to: to.clone(),
                call_type: kind,
                chat_context,
            })
            .await?;

        ack.call_id
            .ok_or_else(|| SignalingError::Malformed("initiate ack without callId".to_string()))
    }

    /// Send a request and require a positive acknowledgment
    ///
    /// # Errors
    ///
    /// Returns error if sending fails or the acknowledgment is negative
    #[tracing::instrument(skip(self, message), fields(message_type = message.type_name()))]
    pub async fn send_with_ack(&self, message: SignalingMessage) -> Result<Ack, SignalingError> {
        tracing::debug!("Sending signaling request");
        let ack = self.channel.request(message).await?.into_result();
        if let Err(e) = &ack {
            tracing::debug!(error = %e, "Signaling request rejected");
        }
        ack
    }

    /// Send a message without waiting for an acknowledgment
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    pub async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::trace!(message_type = message.type_name(), "Emitting signaling message");
        self.channel.emit(message).await
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<T> {
        &self.channel
    }
}
