mod common;

use std::time::Duration;

use common::{assert_quiet, fast_config, init_tracing, linked_pair, lone_node};
use peer_mesh::manual::decode_blob;
use peer_mesh::primitive::{MockNetwork, PeerTransport, TransportPrimitive, TransportSpec};
use peer_mesh::signaling::{CandidateHint, CandidatePayload, DescriptionPayload};
use peer_mesh::{
    AppMessage, ChatMessage, FileTransfer, MediaOptions, MeshConfig, NegotiationError,
    NegotiationMode, NegotiationState, OpenOptions, PeerId, Purpose, Retraction, Role, SendError,
    SessionEvent, Signal, SignalEnvelope,
};
use uuid::Uuid;

async fn connect(left: &common::Node, right: &PeerId, purpose: Purpose) {
    left.registry
        .open(
            right.clone(),
            purpose,
            NegotiationMode::Automatic,
            OpenOptions::default(),
        )
        .await
        .expect("open session");
}

#[test_timeout::tokio_timeout_test]
async fn chat_file_and_retraction_flow_between_registries() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    connect(&alice, &bob.id, Purpose::Data).await;
    assert_eq!(
        alice.next_event().await,
        SessionEvent::Established {
            peer: bob.id.clone(),
            silent: false
        }
    );
    assert_eq!(
        bob.next_event().await,
        SessionEvent::Established {
            peer: alice.id.clone(),
            silent: false
        }
    );
    assert_eq!(bob.registry.get(&alice.id).unwrap().role, Role::Callee);

    let hello = ChatMessage::text(&alice.id, "hello bob");
    alice
        .registry
        .send(&bob.id, &AppMessage::Chat(hello.clone()))
        .await
        .unwrap();
    let (from, received) = bob.next_message().await;
    assert_eq!(from, alice.id);
    match received {
        AppMessage::Chat(chat) => {
            assert_eq!(chat.id, hello.id);
            assert_eq!(chat.content, "hello bob");
            assert_eq!(chat.sender_id, "alice");
        }
        other => panic!("expected chat, got {other:?}"),
    }

    // Larger than one fragment; arrives whole.
    let long = "z".repeat(100 * 1024);
    bob.registry.send_text(&alice.id, long.clone()).await.unwrap();
    match alice.next_message().await {
        (_, AppMessage::Chat(chat)) => assert_eq!(chat.content, long),
        other => panic!("expected chat, got {other:?}"),
    }

    let contents: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let file = FileTransfer::from_bytes(&alice.id, "notes.bin", "application/octet-stream", &contents);
    alice
        .registry
        .send(&bob.id, &AppMessage::File(file))
        .await
        .unwrap();
    match bob.next_message().await {
        (_, AppMessage::File(received)) => {
            assert_eq!(received.name, "notes.bin");
            assert_eq!(received.size, contents.len() as u64);
            assert_eq!(received.decode_data().unwrap(), contents);
        }
        other => panic!("expected file, got {other:?}"),
    }

    let request = Retraction {
        original_message_id: hello.id.clone(),
        sender_id: alice.id.to_string(),
        sender_name: None,
    };
    alice
        .registry
        .send(&bob.id, &AppMessage::RetractRequest(request.clone()))
        .await
        .unwrap();
    assert_eq!(
        bob.next_message().await,
        (alice.id.clone(), AppMessage::RetractRequest(request))
    );
    match alice.next_message().await {
        (from, AppMessage::RetractConfirm(confirm)) => {
            assert_eq!(from, bob.id);
            assert_eq!(confirm.original_message_id, hello.id);
            assert_eq!(confirm.sender_id, "bob");
        }
        other => panic!("expected retraction confirm, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn concurrent_opens_share_one_session() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    let (first, second) = tokio::join!(
        alice.registry.open(
            bob.id.clone(),
            Purpose::Data,
            NegotiationMode::Automatic,
            OpenOptions::default()
        ),
        alice.registry.open(
            bob.id.clone(),
            Purpose::Data,
            NegotiationMode::Automatic,
            OpenOptions::default()
        ),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.handshake_id, second.handshake_id);

    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert_eq!(network.transports_created(&alice.id), 1);
    assert_eq!(alice.registry.peers(), vec![bob.id.clone()]);

    // Reopening an established session reuses it.
    let again = alice
        .registry
        .open(
            bob.id.clone(),
            Purpose::Data,
            NegotiationMode::Automatic,
            OpenOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(again.state, NegotiationState::Established);
    assert_eq!(network.transports_created(&alice.id), 1);
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_offers_resolve_to_one_connection() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    let (left, right) = tokio::join!(
        connect(&alice, &bob.id, Purpose::Data),
        connect(&bob, &alice.id, Purpose::Data),
    );
    let _ = (left, right);

    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    let alice_view = alice.registry.get(&bob.id).unwrap();
    let bob_view = bob.registry.get(&alice.id).unwrap();
    assert_eq!(alice_view.handshake_id, bob_view.handshake_id);
    assert_ne!(alice_view.role, bob_view.role);

    assert_quiet(&mut alice.events, Duration::from_millis(200)).await;
    bob.registry.send_text(&alice.id, "after glare").await.unwrap();
    match alice.next_message().await {
        (_, AppMessage::Chat(chat)) => assert_eq!(chat.content, "after glare"),
        other => panic!("expected chat, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn close_is_idempotent_and_late_sends_fail_cleanly() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    connect(&alice, &bob.id, Purpose::Data).await;
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    assert!(alice.registry.close(&bob.id));
    assert!(!alice.registry.close(&bob.id));
    assert_eq!(
        alice.next_event().await,
        SessionEvent::Closed {
            peer: bob.id.clone(),
            silent: false
        }
    );
    assert_quiet(&mut alice.events, Duration::from_millis(200)).await;
    assert!(alice.registry.get(&bob.id).is_none());
    assert!(matches!(
        alice.registry.send_text(&bob.id, "gone").await,
        Err(SendError::UnknownPeer(_))
    ));

    assert_eq!(
        bob.next_event().await,
        SessionEvent::Disconnected {
            peer: alice.id.clone(),
            silent: false
        }
    );
    assert!(matches!(
        bob.registry.send_text(&alice.id, "anyone there?").await,
        Err(SendError::NotOpen)
    ));
    assert!(alice.inbox.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn closed_session_ignores_late_negotiation_signals() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut node, _outbox) = lone_node(&network, "p1", MeshConfig::localhost());
    let p1 = node.id.clone();
    let p2 = PeerId::from("p2");

    let spec = TransportSpec {
        local: p2.clone(),
        remote: p1.clone(),
        role: Role::Caller,
        purpose: Purpose::Data,
        media: MediaOptions::default(),
        channel_label: node.registry.config().data_channel_label.clone(),
        ice_servers: Vec::new(),
    };
    let (remote, _remote_events) = network.primitive().create(&spec).await.unwrap();
    let handshake_id = Uuid::new_v4();
    let offer = DescriptionPayload {
        sdp: remote.create_offer().await.unwrap(),
        purpose: Purpose::Data,
        media: MediaOptions::default(),
        candidates: Vec::new(),
        handshake_id,
        revision: 0,
        silent: false,
    };
    let from_remote = |signal: Signal| SignalEnvelope::new(p2.clone(), p1.clone(), signal);

    node.registry.handle_signal(from_remote(Signal::Offer(offer.clone())));
    let accepted = node.registry.get(&p2).expect("callee session created");
    assert_eq!(accepted.role, Role::Callee);
    assert_eq!(accepted.handshake_id, handshake_id);
    node.wait_for_state(&p2, NegotiationState::CandidateExchange)
        .await;

    assert!(node.registry.close(&p2));
    assert_eq!(
        node.next_event().await,
        SessionEvent::Closed {
            peer: p2.clone(),
            silent: false
        }
    );

    node.registry.handle_signal(from_remote(Signal::Offer(offer.clone())));
    node.registry.handle_signal(from_remote(Signal::Answer(offer.clone())));
    node.registry
        .handle_signal(from_remote(Signal::IceCandidate(CandidatePayload {
            handshake_id,
            candidate: CandidateHint::new("candidate:late 0"),
        })));
    assert!(node.registry.get(&p2).is_none());
    assert!(node.registry.peers().is_empty());
    assert_quiet(&mut node.events, Duration::from_millis(200)).await;
    assert_eq!(network.transports_created(&p1), 1);

    // A new handshake from the same peer is still accepted.
    let fresh = DescriptionPayload {
        handshake_id: Uuid::new_v4(),
        ..offer
    };
    node.registry.handle_signal(from_remote(Signal::Offer(fresh)));
    assert!(node.registry.get(&p2).is_some());
}

#[test_timeout::tokio_timeout_test]
async fn manual_blobs_carry_batched_candidates() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    alice
        .registry
        .open(
            bob.id.clone(),
            Purpose::Data,
            NegotiationMode::Manual,
            OpenOptions::default(),
        )
        .await
        .unwrap();

    let offer_blob = alice.blobs.next_blob().await.unwrap();
    match decode_blob(&offer_blob).unwrap().signal {
        Signal::Offer(offer) => assert_eq!(offer.candidates.len(), 2),
        other => panic!("expected offer blob, got {}", other.kind()),
    }
    bob.registry.accept_manual_blob(&offer_blob).unwrap();
    assert_eq!(bob.registry.get(&alice.id).unwrap().mode, NegotiationMode::Manual);

    let answer_blob = bob.blobs.next_blob().await.unwrap();
    match decode_blob(&answer_blob).unwrap().signal {
        Signal::Answer(answer) => assert_eq!(answer.candidates.len(), 2),
        other => panic!("expected answer blob, got {}", other.kind()),
    }
    alice.registry.accept_manual_blob(&answer_blob).unwrap();

    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(alice.blobs.try_next_blob().is_none());
    assert!(bob.blobs.try_next_blob().is_none());

    assert!(alice.registry.accept_manual_blob("not a blob").is_err());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn manual_offer_waits_for_gathering_timeout() {
    init_tracing();
    let network = MockNetwork::new();
    network.set_gathering_completes(false);
    let config = fast_config();
    let (mut alice, bob) = linked_pair(&network, "alice", "bob", config.clone());

    let opened_at = tokio::time::Instant::now();
    alice
        .registry
        .open(
            bob.id.clone(),
            Purpose::Data,
            NegotiationMode::Manual,
            OpenOptions::default(),
        )
        .await
        .unwrap();
    let blob = alice.blobs.next_blob().await.unwrap();
    let waited = opened_at.elapsed();
    assert!(waited >= config.gathering_timeout, "sent after {waited:?}");
    assert!(waited < config.gathering_timeout + Duration::from_millis(50));
    match decode_blob(&blob).unwrap().signal {
        Signal::Offer(offer) => assert_eq!(offer.candidates.len(), 2),
        other => panic!("expected offer blob, got {}", other.kind()),
    }
}

#[test_timeout::tokio_timeout_test]
async fn media_renegotiation_keeps_the_transport() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    alice
        .registry
        .open(
            bob.id.clone(),
            Purpose::Media,
            NegotiationMode::Automatic,
            OpenOptions {
                silent: false,
                media: MediaOptions::audio_only(),
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert_eq!(bob.registry.get(&alice.id).unwrap().media, MediaOptions::audio_only());

    let with_video = MediaOptions {
        audio: true,
        video: true,
        screen_share: false,
    };
    alice.registry.renegotiate(&bob.id, with_video).await.unwrap();

    let alice_view = alice.registry.get(&bob.id).unwrap();
    assert_eq!(alice_view.state, NegotiationState::Established);
    assert_eq!(alice_view.revision, 1);
    assert_eq!(alice_view.media, with_video);
    let bob_view = bob.registry.get(&alice.id).unwrap();
    assert_eq!(bob_view.revision, 1);
    assert_eq!(bob_view.media, with_video);
    assert_eq!(bob_view.handshake_id, alice_view.handshake_id);

    assert_eq!(network.transports_created(&alice.id), 1);
    assert_eq!(network.transports_created(&bob.id), 1);
    assert_quiet(&mut alice.events, Duration::from_millis(100)).await;
}

#[test_timeout::tokio_timeout_test]
async fn data_renegotiation_leaves_message_channel_open() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    connect(&alice, &bob.id, Purpose::Data).await;
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    alice
        .registry
        .renegotiate(&bob.id, MediaOptions::audio_only())
        .await
        .unwrap();
    alice.registry.send_text(&bob.id, "still here").await.unwrap();
    match bob.next_message().await {
        (_, AppMessage::Chat(chat)) => assert_eq!(chat.content, "still here"),
        other => panic!("expected chat, got {other:?}"),
    }
    assert_eq!(network.transports_created(&alice.id), 1);
}

#[test_timeout::tokio_timeout_test]
async fn renegotiation_refused_outside_established() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    assert!(matches!(
        alice.registry.renegotiate(&bob.id, MediaOptions::audio_only()).await,
        Err(NegotiationError::UnknownPeer(_))
    ));

    network.block(&alice.id, &bob.id);
    connect(&alice, &bob.id, Purpose::Data).await;
    assert!(matches!(
        alice.registry.renegotiate(&bob.id, MediaOptions::audio_only()).await,
        Err(NegotiationError::InvalidState(NegotiationState::OfferCreated))
            | Err(NegotiationError::InvalidState(NegotiationState::CandidateExchange))
            | Err(NegotiationError::InvalidState(NegotiationState::RemoteAccepted))
    ));

    network.unblock(&alice.id, &bob.id);
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    network.disconnect(&alice.id, &bob.id);
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Disconnected { .. }
    ));
    assert!(matches!(
        alice.registry.renegotiate(&bob.id, MediaOptions::audio_only()).await,
        Err(NegotiationError::Superseded)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn offer_for_another_purpose_replaces_session() {
    init_tracing();
    let network = MockNetwork::new();
    let (mut alice, mut bob) = linked_pair(&network, "alice", "bob", MeshConfig::localhost());

    connect(&alice, &bob.id, Purpose::Data).await;
    assert!(matches!(
        alice.next_event().await,
        SessionEvent::Established { .. }
    ));
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    connect(&bob, &alice.id, Purpose::Media).await;
    assert_eq!(
        bob.next_event().await,
        SessionEvent::Closed {
            peer: alice.id.clone(),
            silent: false
        }
    );
    assert!(matches!(
        bob.next_event().await,
        SessionEvent::Established { .. }
    ));

    let mut saw_closed = false;
    loop {
        match alice.next_event().await {
            SessionEvent::Closed { .. } => saw_closed = true,
            SessionEvent::Established { .. } => break,
            SessionEvent::Disconnected { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_closed);
    let alice_view = alice.registry.get(&bob.id).unwrap();
    assert_eq!(alice_view.purpose, Purpose::Media);
    assert_eq!(alice_view.role, Role::Callee);
}
