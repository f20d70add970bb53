//! Call state machine tests
//!
//! Drives two (and three) relay-wired clients through the §4.3 transition
//! table: offer/answer handshakes, busy replies, stale answers, and every
//! teardown path.

mod common;

use common::{direct_pair, drain_events, settle, wait_for_status, TestClient};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use wirechat_calls::{
    CallEvent, CallKind, CallStatus, ChannelId, ConversationTarget, LocalRelay, NegotiationState,
    PeerLink, SdpType, SessionDescription, Signal, SignalEnvelope, SignalingTransport,
    SummaryReason, UserId,
};

#[tokio::test]
async fn outgoing_call_reaches_callee_as_incoming() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    let call_id = ana
        .service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();

    let outgoing = ana.service.current();
    assert_eq!(outgoing.status, CallStatus::Outgoing);
    assert_eq!(outgoing.call_id, Some(call_id));
    assert!(outgoing.is_initiator);
    assert!(outgoing.local_stream.is_some());

    let incoming = wait_for_status(&ben.service, CallStatus::Incoming).await;
    assert_eq!(incoming.call_id, Some(call_id));
    assert_eq!(incoming.kind, CallKind::Audio);
    assert_eq!(incoming.target, Some(ConversationTarget::User(UserId(1))));
    assert_eq!(incoming.peer.as_ref().map(|p| p.name.as_str()), Some("Ana"));
    assert!(!incoming.is_initiator);
}

#[tokio::test]
async fn accept_call_activates_both_ends() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;

    ben.service.accept_call().await.unwrap();
    assert_eq!(ben.service.current().status, CallStatus::Active);

    // The buffered remote offer survived the base64 transport encoding.
    let remote = ben.backend.last_link().remote_descriptions.lock().clone();
    assert_eq!(remote, vec![(SdpType::Offer, "v=0\r\nmock-offer\r\n".to_string())]);

    // Ana consumes the answer and goes active too.
    wait_for_status(&ana.service, CallStatus::Active).await;
    assert_eq!(
        ana.backend.last_link().negotiation_state(),
        NegotiationState::Stable
    );
}

#[tokio::test]
async fn start_call_while_busy_is_rejected_without_state_change() {
    let relay = LocalRelay::new();
    let (ana, _ben) = direct_pair(&relay, 1, 2);

    let mut events = ana.service.subscribe_events();
    let call_id = ana
        .service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    drain_events(&mut events);

    let second = ana
        .service
        .start_call(ConversationTarget::User(UserId(3)), CallKind::Video)
        .await;
    assert!(second.is_err());

    let snapshot = ana.service.current();
    assert_eq!(snapshot.status, CallStatus::Outgoing);
    assert_eq!(snapshot.call_id, Some(call_id));

    let notices: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::Notice(text) => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(notices, vec!["Another call is already active".to_string()]);
}

#[tokio::test]
async fn second_offer_gets_busy_and_current_session_is_untouched() {
    let relay = LocalRelay::new();
    let (ana, _ben) = direct_pair(&relay, 1, 2);
    let cora = TestClient::new(&relay, 3, "Cora");

    // Ana and Cora share the 1-3 channel as well.
    let side_channel = ChannelId::pair(UserId(1), UserId(3));
    ana.subscribe(side_channel.clone());
    cora.subscribe(side_channel);

    let call_x = ana
        .service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();

    let call_y = cora
        .service
        .start_call(ConversationTarget::User(UserId(1)), CallKind::Audio)
        .await
        .unwrap();

    // Cora's offer bounces off busy Ana and her own attempt ends as missed.
    wait_for_status(&cora.service, CallStatus::Idle).await;
    let summaries = cora.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].meta["status"], SummaryReason::Missed.as_str());
    assert_eq!(summaries[0].text, "Missed voice call");

    // Ana's session for call X is untouched.
    let snapshot = ana.service.current();
    assert_eq!(snapshot.status, CallStatus::Outgoing);
    assert_eq!(snapshot.call_id, Some(call_x));
    assert_ne!(call_x, call_y);
    assert!(ana.summaries().is_empty());
}

#[tokio::test]
async fn active_hangup_sends_hangup_and_reports_completed() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;
    ben.service.accept_call().await.unwrap();
    wait_for_status(&ana.service, CallStatus::Active).await;

    ana.service.hang_up().await;
    assert_eq!(ana.service.current().status, CallStatus::Idle);

    let summaries = ana.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].meta["status"], "completed");
    assert_eq!(summaries[0].message_type, "call_summary");

    // Resources are gone on the hanging-up side.
    assert!(*ana.backend.last_link().closed.lock());
    assert!(*ana.backend.last_media().stopped.lock());

    // Ben maps the remote hangup of an active call to completed too.
    wait_for_status(&ben.service, CallStatus::Idle).await;
    let summaries = ben.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].meta["status"], "completed");
    assert!(*ben.backend.last_link().closed.lock());
}

#[tokio::test]
async fn outgoing_hangup_sends_cancel_and_reports_missed() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Video)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;

    ana.service.hang_up().await;

    let summaries = ana.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].meta["status"], "missed");
    assert_eq!(summaries[0].text, "Missed video call");

    // The pending incoming side maps the cancel to canceled.
    wait_for_status(&ben.service, CallStatus::Idle).await;
    let summaries = ben.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].meta["status"], "canceled");
}

#[tokio::test]
async fn reject_reports_declined_on_both_ends() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;

    ben.service.reject_call().await.unwrap();
    assert_eq!(ben.service.current().status, CallStatus::Idle);
    assert_eq!(ben.summaries()[0].meta["status"], "declined");

    wait_for_status(&ana.service, CallStatus::Idle).await;
    assert_eq!(ana.summaries()[0].meta["status"], "declined");
}

#[tokio::test]
async fn stale_answer_is_ignored() {
    let relay = LocalRelay::new();
    let (ana, _ben) = direct_pair(&relay, 1, 2);

    let call_id = ana
        .service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();

    // Simulate negotiation having moved past the offer-sent state before
    // the (reordered) answer arrives.
    *ana.backend.last_link().state.lock() = NegotiationState::Stable;

    let impostor = Arc::new(relay.connect(UserId(2)));
    impostor
        .publish(SignalEnvelope {
            call_id,
            call_type: CallKind::Audio,
            signal: Signal::Answer(SessionDescription::encode(SdpType::Answer, "v=0\r\nlate\r\n")),
            group_id: None,
            receiver_id: Some(UserId(1)),
            sender: wirechat_calls::PeerInfo {
                id: UserId(2),
                name: "Ben".to_string(),
                avatar_url: None,
            },
        })
        .await
        .unwrap();
    settle().await;

    // No transition, no remote description applied.
    assert_eq!(ana.service.current().status, CallStatus::Outgoing);
    assert!(ana.backend.last_link().remote_descriptions.lock().is_empty());
}

#[tokio::test]
async fn hangup_while_incoming_reports_canceled() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;

    // The callee dismisses the ringing call with a hangup instead of a
    // reject: residual mapping is canceled.
    ben.service.hang_up().await;
    assert_eq!(ben.service.current().status, CallStatus::Idle);
    assert_eq!(ben.summaries()[0].meta["status"], "canceled");
}

#[tokio::test]
async fn near_simultaneous_hangups_produce_one_summary_each() {
    let relay = LocalRelay::new();
    let (ana, ben) = direct_pair(&relay, 1, 2);

    ana.service
        .start_call(ConversationTarget::User(UserId(2)), CallKind::Audio)
        .await
        .unwrap();
    wait_for_status(&ben.service, CallStatus::Incoming).await;
    ben.service.accept_call().await.unwrap();
    wait_for_status(&ana.service, CallStatus::Active).await;

    // Both ends hang up at the same time; each also receives the remote
    // hangup shortly after its own teardown.
    tokio::join!(ana.service.hang_up(), ben.service.hang_up());
    settle().await;

    assert_eq!(ana.summaries().len(), 1);
    assert_eq!(ben.summaries().len(), 1);
    assert_eq!(ana.service.current().status, CallStatus::Idle);
    assert_eq!(ben.service.current().status, CallStatus::Idle);
}
