//! In-process signaling server
//!
//! [`SignalingRelay`] plays the server's role for tests, demos and
//! single-process deployments: it assigns call IDs, pushes `incoming`,
//! turns `accept`/`reject`/`end` into their push counterparts and forwards
//! negotiation messages between the two legs of a call.

use crate::signaling::{Ack, SignalingChannel, SignalingError, SignalingMessage};
use crate::types::{CallId, ParticipantId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone)]
struct CallLegs {
    caller: ParticipantId,
    callee: ParticipantId,
}

impl CallLegs {
    fn involves(&self, participant: &ParticipantId) -> bool {
        &self.caller == participant || &self.callee == participant
    }

    fn other(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        if &self.caller == participant {
            Some(&self.callee)
        } else if &self.callee == participant {
            Some(&self.caller)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    endpoints: HashMap<ParticipantId, mpsc::UnboundedSender<SignalingMessage>>,
    calls: HashMap<CallId, CallLegs>,
}

impl RelayState {
    fn push(&self, to: &ParticipantId, message: SignalingMessage) -> bool {
        match self.endpoints.get(to) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn is_busy(&self, participant: &ParticipantId) -> bool {
        self.calls.values().any(|legs| legs.involves(participant))
    }
}

/// In-memory signaling server shared by its registered endpoints
#[derive(Debug, Clone, Default)]
pub struct SignalingRelay {
    state: Arc<Mutex<RelayState>>,
}

impl SignalingRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant
    ///
    /// Returns the channel the participant sends through and the stream of
    /// messages pushed to it. Registering again replaces the old stream.
    pub fn register(
        &self,
        participant: ParticipantId,
    ) -> (RelayEndpoint, UnboundedReceiverStream<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(participant.clone(), tx);
        tracing::debug!(participant = %participant, "Participant registered with relay");

        let endpoint = RelayEndpoint {
            participant,
            state: Arc::clone(&self.state),
        };
        (endpoint, UnboundedReceiverStream::new(rx))
    }

    /// Remove a participant; its calls are ended for the other leg
    pub fn unregister(&self, participant: &ParticipantId) {
        let mut state = self.state.lock();
        state.endpoints.remove(participant);

        let dropped: Vec<(CallId, CallLegs)> = state
            .calls
            .iter()
            .filter(|(_, legs)| legs.involves(participant))
            .map(|(id, legs)| (id.clone(), legs.clone()))
            .collect();
        for (call_id, legs) in dropped {
            state.calls.remove(&call_id);
            if let Some(other) = legs.other(participant) {
                state.push(other, SignalingMessage::Ended { call_id });
            }
        }
    }

    /// Whether a participant is registered and still listening
    #[must_use]
    pub fn is_online(&self, participant: &ParticipantId) -> bool {
        self.state
            .lock()
            .endpoints
            .get(participant)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of calls the relay currently tracks
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.state.lock().calls.len()
    }
}

/// One participant's connection to a [`SignalingRelay`]
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    participant: ParticipantId,
    state: Arc<Mutex<RelayState>>,
}

impl RelayEndpoint {
    /// Participant this endpoint sends as
    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    fn route(&self, message: SignalingMessage) -> Ack {
        let me = &self.participant;
        let mut state = self.state.lock();

        match message {
            SignalingMessage::Initiate {
                to,
                call_type,
                chat_context,
            } => {
                if &to == me {
                    return Ack::failure("cannot call yourself");
                }
                if !state.endpoints.get(&to).is_some_and(|tx| !tx.is_closed()) {
                    return Ack::failure("user offline");
                }
                if state.is_busy(&to) || state.is_busy(me) {
                    return Ack::failure("user busy");
                }

                let call_id = CallId::new();
                let incoming = SignalingMessage::Incoming {
                    call_id: call_id.clone(),
                    from: me.clone(),
                    call_type,
                    chat_context,
                };
                if !state.push(&to, incoming) {
                    return Ack::failure("user offline");
                }
                state.calls.insert(
                    call_id.clone(),
                    CallLegs {
                        caller: me.clone(),
                        callee: to.clone(),
                    },
                );
                tracing::debug!(call_id = %call_id, from = %me, to = %to, "Relay placed call");
                Ack::ok_with_call(call_id)
            }

            SignalingMessage::Accept { call_id, from } => {
                let Some(legs) = state.calls.get(&call_id).cloned() else {
                    return Ack::failure("unknown call");
                };
                if &legs.callee != me {
                    return Ack::failure("only the callee can accept");
                }
                state.push(&legs.caller, SignalingMessage::Accepted { call_id, from });
                Ack::ok()
            }

            SignalingMessage::Reject { call_id, from } => {
                let Some(legs) = state.calls.get(&call_id).cloned() else {
                    return Ack::failure("unknown call");
                };
                if &legs.callee != me {
                    return Ack::failure("only the callee can reject");
                }
                state.calls.remove(&call_id);
                state.push(&legs.caller, SignalingMessage::Rejected { call_id, from });
                Ack::ok()
            }

            SignalingMessage::End { call_id, .. } => {
                let Some(legs) = state.calls.get(&call_id).cloned() else {
                    return Ack::failure("unknown call");
                };
                let Some(other) = legs.other(me) else {
                    return Ack::failure("not a participant of this call");
                };
                state.calls.remove(&call_id);
                state.push(other, SignalingMessage::Ended { call_id });
                Ack::ok()
            }

            forwarded @ (SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::IceCandidate { .. }) => {
                let (call_id, to) = match &forwarded {
                    SignalingMessage::Offer { call_id, to, .. }
                    | SignalingMessage::Answer { call_id, to, .. }
                    | SignalingMessage::IceCandidate { call_id, to, .. } => (call_id, to),
                    _ => return Ack::failure("not forwardable"),
                };
                let valid = state
                    .calls
                    .get(call_id)
                    .and_then(|legs| legs.other(me))
                    .is_some_and(|other| other == to);
                if !valid {
                    return Ack::failure("unknown call");
                }
                let to = to.clone();
                if state.push(&to, forwarded) {
                    Ack::ok()
                } else {
                    Ack::failure("user offline")
                }
            }

            push => Ack::failure(format!("{} is a server push", push.type_name())),
        }
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn request(&self, message: SignalingMessage) -> Result<Ack, SignalingError> {
        tracing::trace!(participant = %self.participant, message_type = message.type_name(), "Relay request");
        Ok(self.route(message))
    }

    async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let message_type = message.type_name();
        let ack = self.route(message);
        if !ack.success {
            tracing::debug!(
                participant = %self.participant,
                message_type,
                error = ?ack.error,
                "Relay dropped message"
            );
        }
        Ok(())
    }
}
