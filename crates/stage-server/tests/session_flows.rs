//! End-to-end session flows: real client sessions against a real registry,
//! over in-memory duplex WebSockets.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use stage_client::media::LocalTrack;
use stage_client::{
    ChannelConfig, SessionConfig, SessionController, SessionError, SessionEvent, SessionState,
};
use stage_protocol::messages::ClientMessage;
use stage_protocol::types::{
    CommunicationMode, MediaKind, ParticipantRole, RtpCapabilities, StageJoined, StageKind,
    TransportOptions,
};
use stage_test_utils::{identity_token, FakeMediaStack, FakePeerConnector, TestServer};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_DEADLINE: Duration = Duration::from_secs(2);

struct TestClient {
    session: SessionController,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    stack: Arc<FakeMediaStack>,
    peers: Arc<FakePeerConnector>,
}

async fn client(server: &TestServer) -> TestClient {
    let stack = FakeMediaStack::new();
    let peers = FakePeerConnector::new(2);
    let (mut session, events) = SessionController::new(
        Arc::clone(&stack) as Arc<dyn stage_client::MediaStack>,
        Arc::clone(&peers) as Arc<dyn stage_client::PeerConnector>,
        SessionConfig::default(),
    );
    let channel = server.connect_channel(ChannelConfig::default()).await;
    session.connect_with(channel).expect("adopt channel");
    TestClient {
        session,
        events,
        stack,
        peers,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(EVENT_DEADLINE, events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_DEADLINE;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached before deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn create_then_join_yields_roster_in_join_order() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "opening night",
            StageKind::Theater,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");
    assert_eq!(alice.session.state(), SessionState::InStage);

    let snapshot = bob
        .session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("join stage");

    assert_eq!(snapshot.participants.len(), 2);
    assert_eq!(snapshot.participants[0].role, ParticipantRole::Director);
    assert_eq!(snapshot.participants[0].name, "User alice");
    assert_eq!(snapshot.participants[1].role, ParticipantRole::Actor);
    assert_eq!(snapshot.participants[1].name, "User bob");

    // Only the pre-existing participant observes the join.
    match next_event(&mut alice.events).await {
        SessionEvent::ParticipantJoined(info) => assert_eq!(info.name, "User bob"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn join_with_wrong_password_leaves_roster_untouched() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "locked",
            StageKind::Conference,
            CommunicationMode::Sfu,
            Some("s3cret".to_string()),
        )
        .await
        .expect("create stage");

    let result = bob
        .session
        .join_stage(
            &identity_token("bob"),
            &stage.stage_id,
            Some("wrong".to_string()),
        )
        .await;
    assert!(matches!(result, Err(SessionError::Permission(_))));
    assert_eq!(bob.session.state(), SessionState::Connected);

    let handle = server
        .registry
        .get_stage(stage.stage_id.clone())
        .await
        .expect("stage exists");
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.participants.len(), 1);
}

#[tokio::test]
async fn create_or_join_while_in_stage_fails_fast() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;

    alice
        .session
        .create_stage(
            &identity_token("alice"),
            "first",
            StageKind::Theater,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    let result = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "second",
            StageKind::Theater,
            CommunicationMode::Sfu,
            None,
        )
        .await;
    assert!(matches!(result, Err(SessionError::InvalidState(_))));

    let result = alice
        .session
        .join_stage(&identity_token("alice"), "whatever", None)
        .await;
    assert!(matches!(result, Err(SessionError::InvalidState(_))));

    // Membership was not overwritten.
    assert_eq!(alice.session.stage().unwrap().name, "first");
}

#[tokio::test]
async fn music_stage_publish_and_consume_flow() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");
    let alice_id = alice.session.participant_id().unwrap().to_string();

    bob.session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("join stage");
    assert!(bob.stack.is_loaded());
    assert_eq!(bob.stack.negotiated().len(), 2);

    // Alice publishes one audio track.
    alice
        .session
        .publish_track(LocalTrack::new("mic-1", MediaKind::Audio))
        .await
        .expect("publish");
    assert_eq!(alice.session.state(), SessionState::Publishing);

    // Bob receives exactly one producer announcement and ends up with a
    // playable, resumed consumer.
    let (participant_id, track) = match next_event(&mut bob.events).await {
        SessionEvent::ConsumerAdded {
            participant_id,
            track,
            ..
        } => (participant_id, track),
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(participant_id, alice_id);
    assert_eq!(track.kind, MediaKind::Audio);

    let consumers = bob.stack.consumer_states();
    assert_eq!(consumers.len(), 1);
    assert!(consumers[0].1, "local consumer must be resumed");
    assert_eq!(
        server.engine.consumer_paused(&consumers[0].0),
        Some(false),
        "engine consumer must be resumed after finish-consume"
    );

    // No duplicate consumer events.
    assert!(bob.events.try_recv().is_err());
}

#[tokio::test]
async fn late_joiner_sees_no_earlier_producer_broadcast() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;
    let mut carol = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    bob.session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("bob joins");

    alice
        .session
        .publish_track(LocalTrack::new("mic-1", MediaKind::Audio))
        .await
        .expect("publish");

    // Bob consumes it.
    assert!(matches!(
        next_event(&mut bob.events).await,
        SessionEvent::ConsumerAdded { .. }
    ));

    // Carol joins afterwards and never sees the earlier broadcast.
    carol
        .session
        .join_stage(&identity_token("carol"), &stage.stage_id, None)
        .await
        .expect("carol joins");
    assert!(
        timeout(Duration::from_millis(200), carol.events.recv())
            .await
            .is_err(),
        "late joiner must not receive producer-added for earlier tracks"
    );
    assert!(carol.stack.consumer_states().is_empty());
}

#[tokio::test]
async fn unpublish_closes_the_engine_producer() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;

    alice
        .session
        .create_stage(
            &identity_token("alice"),
            "solo",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    alice
        .session
        .publish_track(LocalTrack::new("mic-1", MediaKind::Audio))
        .await
        .expect("publish");

    alice
        .session
        .unpublish_track("mic-1")
        .await
        .expect("unpublish");

    // The close is fire-and-forget; the engine sees it shortly after.
    let engine = Arc::clone(&server.engine);
    wait_until(move || {
        engine
            .calls()
            .iter()
            .any(|call| call.starts_with("close_producer:"))
    })
    .await;

    // Unpublishing an unknown track is an error.
    let result = alice.session.unpublish_track("mic-1").await;
    assert!(matches!(result, Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn consumer_stays_paused_when_finish_consume_fails() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    bob.session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("join stage");

    // The resume leg of finish-consume fails server-side.
    server.engine.fail_on("resume_consumer");

    alice
        .session
        .publish_track(LocalTrack::new("mic-1", MediaKind::Audio))
        .await
        .expect("publish");

    // Bob's consume request happens, but without the ack the local
    // consumer is never resumed and no track surfaces.
    let engine = Arc::clone(&server.engine);
    wait_until(move || {
        engine
            .calls()
            .iter()
            .any(|call| call.starts_with("resume_consumer:"))
    })
    .await;

    assert!(
        timeout(Duration::from_millis(200), bob.events.recv())
            .await
            .is_err(),
        "no consumer-added event without a finish-consume ack"
    );
    for (consumer_id, resumed) in bob.stack.consumer_states() {
        assert!(
            !resumed,
            "consumer {consumer_id} resumed before finish-consume ack"
        );
    }
}

#[tokio::test]
async fn disconnect_mid_negotiation_leaves_no_orphans() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    // Bob drives the protocol by hand so he can vanish mid-handshake:
    // after create-receive-transport but before connect-transport.
    let bob_channel = server.connect_channel(ChannelConfig::default()).await;
    let joined: StageJoined = bob_channel
        .request(ClientMessage::JoinStage {
            identity_token: identity_token("bob"),
            stage_id: stage.stage_id.clone(),
            password: None,
        })
        .await
        .expect("join stage");

    let options: TransportOptions = bob_channel
        .request(ClientMessage::CreateReceiveTransport {
            rtp_capabilities: RtpCapabilities::default(),
        })
        .await
        .expect("create receive transport");
    assert!(server.engine.transport_exists(&options.transport_id));

    // Abrupt disconnect.
    bob_channel.close();

    // Alice sees the removal...
    loop {
        match next_event(&mut alice.events).await {
            SessionEvent::ParticipantRemoved(info) => {
                assert_eq!(info.participant_id, joined.participant_id);
                break;
            }
            SessionEvent::ParticipantJoined(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ...the roster no longer contains Bob, and no transport is orphaned.
    let handle = server
        .registry
        .get_stage(stage.stage_id.clone())
        .await
        .expect("stage exists");
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.participants.len(), 1);

    let engine = Arc::clone(&server.engine);
    let transport_id = options.transport_id.clone();
    wait_until(move || !engine.transport_exists(&transport_id)).await;
}

#[tokio::test]
async fn mesh_offer_always_comes_from_the_preexisting_side() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "duet",
            StageKind::Music,
            CommunicationMode::Mesh,
            None,
        )
        .await
        .expect("create stage");

    bob.session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("join stage");

    // Alice (pre-existing) offers; Bob (newcomer) only answers.
    let alice_peers = Arc::clone(&alice.peers);
    wait_until(move || {
        alice_peers
            .links()
            .first()
            .is_some_and(|link| link.accepted_answer().is_some())
    })
    .await;

    let alice_links = alice.peers.links();
    let alice_link = Arc::clone(&alice_links[0]);
    assert_eq!(alice_link.offer_count(), 1);
    assert_eq!(alice_link.answer_count(), 0);

    let bob_links = bob.peers.links();
    assert_eq!(bob_links.len(), 1);
    assert_eq!(bob_links[0].offer_count(), 0, "the joiner must never offer");
    assert_eq!(bob_links[0].answer_count(), 1);
    assert!(bob_links[0].accepted_offer().is_some());

    // Candidates flow both ways through the relay.
    let alice_link_clone = Arc::clone(&alice_link);
    wait_until(move || alice_link_clone.remote_candidate_count() == 2).await;
    let bob_link = Arc::clone(&bob_links[0]);
    wait_until(move || bob_link.remote_candidate_count() == 2).await;

    // Both sides establish once their local candidates are exhausted.
    let mut established = 0;
    while established < 1 {
        if let SessionEvent::PeerLinkEstablished { .. } = next_event(&mut alice.events).await {
            established += 1;
        }
    }
    let mut established = 0;
    while established < 1 {
        if let SessionEvent::PeerLinkEstablished { .. } = next_event(&mut bob.events).await {
            established += 1;
        }
    }
}

#[tokio::test]
async fn leave_then_rejoin_observes_consistent_roster() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;
    let mut bob = client(&server).await;

    let stage = alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    bob.session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("first join");

    bob.session.leave_stage().await.expect("leave");
    assert_eq!(bob.session.state(), SessionState::Connected);

    match next_event(&mut alice.events).await {
        SessionEvent::ParticipantJoined(_) => {}
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut alice.events).await {
        SessionEvent::ParticipantRemoved(info) => assert_eq!(info.name, "User bob"),
        other => panic!("unexpected event: {other:?}"),
    }

    let snapshot = bob
        .session
        .join_stage(&identity_token("bob"), &stage.stage_id, None)
        .await
        .expect("rejoin");
    assert_eq!(snapshot.participants.len(), 2);
}

#[tokio::test]
async fn disconnect_is_reachable_from_every_state() {
    let server = TestServer::spawn();

    // Disconnected: a no-op.
    let mut fresh = client(&server).await;
    fresh.session.disconnect().await;
    assert_eq!(fresh.session.state(), SessionState::Disconnected);

    // Publishing: full teardown.
    let mut alice = client(&server).await;
    alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");
    alice
        .session
        .publish_track(LocalTrack::new("mic-1", MediaKind::Audio))
        .await
        .expect("publish");
    assert_eq!(alice.session.state(), SessionState::Publishing);

    alice.session.disconnect().await;
    assert_eq!(alice.session.state(), SessionState::Disconnected);
    assert!(alice.session.stage().is_none());

    // The server releases everything Alice owned.
    let engine = Arc::clone(&server.engine);
    wait_until(move || engine.live_transport_count() == 0).await;
}

#[tokio::test]
async fn channel_loss_surfaces_single_terminal_disconnect() {
    let server = TestServer::spawn();
    let mut alice = client(&server).await;

    alice
        .session
        .create_stage(
            &identity_token("alice"),
            "rehearsal",
            StageKind::Music,
            CommunicationMode::Sfu,
            None,
        )
        .await
        .expect("create stage");

    // The whole server goes away.
    server.shutdown();

    match next_event(&mut alice.events).await {
        SessionEvent::Disconnected => {}
        other => panic!("unexpected event: {other:?}"),
    }
    // Terminal: no second notification.
    assert!(timeout(Duration::from_millis(200), alice.events.recv())
        .await
        .is_err());
}
