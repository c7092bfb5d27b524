//! Inbound signaling validation tests
//!
//! Messages that do not fit the current state or call are dropped without
//! side effects; failures while applying valid ones fail the call.

mod common;

use callwire_core::{
    Ack, CallError, CallEvent, CallId, CallKind, CallState, ErrorKind, EventKind, IceCandidate,
    ParticipantId, SignalingMessage,
};
use common::{eventually, Harness};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn other_call() -> CallId {
    CallId::from("call-other")
}

#[tokio::test]
async fn answer_while_ringing_is_dropped() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    h.events.clear();

    assert!(!h.push_answer().await);

    assert_eq!(h.engine.state(), CallState::Ringing);
    assert!(h.events.events().is_empty());
    assert!(!h
        .peers
        .last()
        .ops()
        .iter()
        .any(|op| op.starts_with("set_remote")));
}

#[tokio::test]
async fn offer_to_initiator_is_dropped() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    h.push_accepted().await;

    assert!(!h.push_offer().await);
    assert_eq!(h.signaling.count("answer"), 0);
    assert_eq!(h.engine.state(), CallState::Connecting);
}

#[tokio::test]
async fn offer_before_accepting_is_dropped() {
    let h = Harness::new();
    assert!(h.push_incoming(CallKind::Audio).await);

    assert!(!h.push_offer().await);
    assert_eq!(h.engine.state(), CallState::Ringing);
}

#[tokio::test]
async fn duplicate_offer_is_dropped() {
    let h = Harness::new();
    assert!(h.push_incoming(CallKind::Audio).await);
    h.engine.accept_call().await.unwrap();

    assert!(h.push_offer().await);
    assert!(!h.push_offer().await);

    assert_eq!(h.signaling.count("answer"), 1);
    assert_eq!(h.engine.state(), CallState::Connecting);
}

#[tokio::test]
async fn accepted_for_other_call_is_dropped() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();

    let applied = h
        .push(SignalingMessage::Accepted {
            call_id: other_call(),
            from: Harness::remote(),
        })
        .await;

    assert!(!applied);
    assert_eq!(h.engine.state(), CallState::Ringing);
    assert_eq!(h.signaling.count("offer"), 0);
    assert_eq!(h.events.count(EventKind::Error), 0);
}

#[tokio::test]
async fn accepted_at_receiver_is_dropped() {
    let h = Harness::new();
    assert!(h.push_incoming(CallKind::Audio).await);

    assert!(!h.push_accepted().await);
    assert_eq!(h.engine.state(), CallState::Ringing);
}

#[tokio::test]
async fn candidate_for_other_call_is_dropped() {
    let h = Harness::new();
    assert!(h.push_incoming(CallKind::Audio).await);
    h.engine.accept_call().await.unwrap();
    h.push_offer().await;

    let applied = h
        .push(SignalingMessage::IceCandidate {
            call_id: other_call(),
            to: ParticipantId::new("u1"),
            candidate: IceCandidate::new("stray"),
        })
        .await;

    assert!(!applied);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(h.peers.last().applied_candidates().is_empty());
    assert_eq!(h.events.count(EventKind::Error), 0);
}

#[tokio::test]
async fn candidate_while_ringing_is_dropped() {
    let h = Harness::new();
    assert!(h.push_incoming(CallKind::Audio).await);
    assert!(!h.push_candidate("early").await);
}

#[tokio::test]
async fn ended_for_other_call_is_ignored() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();

    assert!(
        !h.push(SignalingMessage::Ended {
            call_id: other_call()
        })
        .await
    );
    assert_eq!(h.engine.state(), CallState::Ringing);
}

#[tokio::test]
async fn ended_while_idle_is_ignored() {
    let h = Harness::new();
    assert!(!h.push_ended().await);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn incoming_while_busy_is_dropped() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    h.events.clear();

    let applied = h
        .push(SignalingMessage::Incoming {
            call_id: other_call(),
            from: ParticipantId::new("u3"),
            call_type: CallKind::Video,
            chat_context: None,
        })
        .await;

    assert!(!applied);
    assert!(h.events.events().is_empty());
    assert_eq!(
        h.engine.current_call().unwrap().call_id,
        Harness::call_id()
    );
}

#[tokio::test]
async fn incoming_records_caller_and_context() {
    let h = Harness::new();
    let context = callwire_core::ChatContext(serde_json::json!({"chatId": "room-7"}));

    assert!(
        h.push(SignalingMessage::Incoming {
            call_id: Harness::call_id(),
            from: Harness::remote(),
            call_type: CallKind::Video,
            chat_context: Some(context.clone()),
        })
        .await
    );

    let incoming = h
        .events
        .events()
        .into_iter()
        .find_map(|e| match e {
            CallEvent::IncomingCall { call } => Some(call),
            _ => None,
        })
        .unwrap();
    assert_eq!(incoming.remote_participant, Harness::remote());
    assert_eq!(incoming.kind, CallKind::Video);
    assert_eq!(incoming.chat_context, Some(context));
}

#[tokio::test]
async fn client_messages_are_ignored() {
    let h = Harness::new();
    let applied = h
        .push(SignalingMessage::Initiate {
            to: ParticipantId::new("u1"),
            call_type: CallKind::Audio,
            chat_context: None,
        })
        .await;
    assert!(!applied);
    assert_eq!(h.engine.state(), CallState::Idle);
}

#[tokio::test]
async fn bad_answer_fails_call_with_negotiation_error() {
    let h = Harness::new();
    h.peers.fail_remote.store(true, Ordering::SeqCst);
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    h.push_accepted().await;
    h.events.clear();

    assert!(h.push_answer().await);

    assert_eq!(h.engine.state(), CallState::Idle);
    let errors: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::Error { kind, error } => Some((kind, error)),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorKind::Negotiation);
    assert!(errors[0].1.contains("remote description"));
    assert_eq!(h.engine.last_call().unwrap().outcome, CallState::Failed);
    assert_eq!(h.signaling.count("end"), 1);
    assert!(h.peers.last().is_closed());
}

#[tokio::test]
async fn rejected_candidate_fails_call() {
    let h = Harness::new();
    h.peers.fail_candidate.store(true, Ordering::SeqCst);
    assert!(h.push_incoming(CallKind::Audio).await);
    h.engine.accept_call().await.unwrap();
    h.push_offer().await;

    assert!(h.push_candidate("broken").await);
    h.wait_idle().await;

    assert_eq!(h.engine.last_call().unwrap().outcome, CallState::Failed);
    let events = h.events.clone();
    eventually(move || events.count(EventKind::CallFailed) == 1).await;
}

#[tokio::test]
async fn failed_accept_send_fails_call() {
    let h = Harness::new();
    *h.signaling.fail_type.lock() = Some("accept");
    assert!(h.push_incoming(CallKind::Audio).await);

    let err = h.engine.accept_call().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(matches!(err, CallError::Transport(_)));
    assert_eq!(h.engine.state(), CallState::Idle);
    assert_eq!(h.capture.live_tracks(), 0);
    assert!(h.peers.last().is_closed());
}

#[tokio::test]
async fn spawned_inbound_stream_feeds_engine() {
    let h = Harness::new();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let pump = h
        .engine
        .spawn_inbound(tokio_stream::wrappers::UnboundedReceiverStream::new(rx));

    tx.send(SignalingMessage::Incoming {
        call_id: Harness::call_id(),
        from: Harness::remote(),
        call_type: CallKind::Audio,
        chat_context: None,
    })
    .unwrap();
    h.wait_state(CallState::Ringing).await;

    tx.send(SignalingMessage::Ended {
        call_id: Harness::call_id(),
    })
    .unwrap();
    h.wait_idle().await;

    drop(tx);
    pump.await.unwrap();
    assert_eq!(h.engine.last_call().unwrap().outcome, CallState::Ended);
}

#[test]
fn server_push_wire_format() {
    let incoming = SignalingMessage::from_json(
        r#"{"type":"incoming","callId":"c1","from":"u2","callType":"video"}"#,
    )
    .unwrap();
    assert_eq!(
        incoming,
        SignalingMessage::Incoming {
            call_id: CallId::from("c1"),
            from: ParticipantId::new("u2"),
            call_type: CallKind::Video,
            chat_context: None,
        }
    );

    let candidate = SignalingMessage::from_json(
        r#"{"type":"ice-candidate","callId":"c1","to":"u1","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
    )
    .unwrap();
    assert_eq!(candidate.call_id(), Some(&CallId::from("c1")));
    assert_eq!(candidate.type_name(), "ice-candidate");
}

#[test]
fn ack_wire_format() {
    let ack: Ack = serde_json::from_str(r#"{"success":true,"callId":"c1"}"#).unwrap();
    assert_eq!(ack, Ack::ok_with_call(CallId::from("c1")));

    let nack: Ack = serde_json::from_str(r#"{"success":false,"error":"user offline"}"#).unwrap();
    assert!(nack.into_result().is_err());
}

#[tokio::test]
async fn stale_connection_signals_do_not_touch_new_call() {
    let h = Harness::new();
    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    let first = h.peers.last();
    h.engine.end_call().await.unwrap();

    h.engine
        .start_call(Harness::remote(), CallKind::Audio, None)
        .await
        .unwrap();
    first.report_state(callwire_core::PeerConnectionState::Failed);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(h.engine.state(), CallState::Ringing);
    let engine = Arc::clone(&h.engine);
    assert!(engine.current_call().is_some());
}
