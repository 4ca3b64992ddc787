#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peer_mesh::message::{CallControl, GroupControl};
use peer_mesh::primitive::MockNetwork;
use peer_mesh::{
    AppMessage, ChannelSignaling, ChatMessage, FileTransfer, ManualBlobs, ManualSignaling,
    MeshConfig, MessageHandler, NegotiationState, PeerId, ReconnectPolicy, Retraction,
    SessionEvent, SessionRegistry, SessionSnapshot,
};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Timings short enough that paused-clock tests stay readable.
pub fn fast_config() -> MeshConfig {
    MeshConfig {
        checking_timeout: Duration::from_secs(2),
        gathering_timeout: Duration::from_millis(500),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(300),
            backoff_factor: 2.0,
            max_attempts: 3,
        },
        ..MeshConfig::localhost()
    }
}

/// Handler that forwards everything it is given to a channel.
pub struct Recorder {
    tx: mpsc::UnboundedSender<(PeerId, AppMessage)>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(PeerId, AppMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn record(&self, peer: &PeerId, message: AppMessage) {
        let _ = self.tx.send((peer.clone(), message));
    }
}

impl MessageHandler for Recorder {
    fn on_chat(&self, peer: &PeerId, message: ChatMessage) {
        self.record(peer, AppMessage::Chat(message));
    }

    fn on_group_chat(&self, peer: &PeerId, message: ChatMessage) {
        self.record(peer, AppMessage::Chat(message));
    }

    fn on_group_control(&self, peer: &PeerId, message: GroupControl) {
        self.record(peer, AppMessage::GroupControl(message));
    }

    fn on_call_control(&self, peer: &PeerId, message: CallControl) {
        self.record(peer, AppMessage::CallControl(message));
    }

    fn on_retract_request(&self, peer: &PeerId, message: Retraction) {
        self.record(peer, AppMessage::RetractRequest(message));
    }

    fn on_retract_confirm(&self, peer: &PeerId, message: Retraction) {
        self.record(peer, AppMessage::RetractConfirm(message));
    }

    fn on_file(&self, peer: &PeerId, message: FileTransfer) {
        self.record(peer, AppMessage::File(message));
    }
}

pub struct Node {
    pub id: PeerId,
    pub registry: SessionRegistry,
    pub events: broadcast::Receiver<SessionEvent>,
    pub inbox: mpsc::UnboundedReceiver<(PeerId, AppMessage)>,
    pub blobs: ManualBlobs,
}

impl Node {
    pub async fn next_message(&mut self) -> (PeerId, AppMessage) {
        self.inbox.recv().await.expect("handler channel closed")
    }

    pub async fn next_event(&mut self) -> SessionEvent {
        next_event(&mut self.events).await
    }

    pub async fn wait_for_state(&self, peer: &PeerId, state: NegotiationState) -> SessionSnapshot {
        wait_for_state(&self.registry, peer, state).await
    }
}

fn build_node(
    network: &MockNetwork,
    id: &str,
    config: MeshConfig,
) -> (Node, mpsc::UnboundedReceiver<peer_mesh::SignalEnvelope>) {
    let (port, outbox) = ChannelSignaling::new();
    let (manual, blobs) = ManualSignaling::new();
    let (recorder, inbox) = Recorder::new();
    let registry = SessionRegistry::builder(id, Arc::new(port))
        .config(config)
        .primitive(Arc::new(network.primitive()))
        .manual_signaling(Arc::new(manual))
        .handler(recorder)
        .build()
        .expect("build registry");
    let events = registry.subscribe();
    let node = Node {
        id: PeerId::from(id),
        registry,
        events,
        inbox,
        blobs,
    };
    (node, outbox)
}

/// Two registries on one mock network whose automatic signaling is relayed
/// to each other.
pub fn linked_pair(network: &MockNetwork, a: &str, b: &str, config: MeshConfig) -> (Node, Node) {
    let (left, left_outbox) = build_node(network, a, config.clone());
    let (right, right_outbox) = build_node(network, b, config);
    right.registry.attach_signaling(left_outbox);
    left.registry.attach_signaling(right_outbox);
    (left, right)
}

/// A single registry whose outbound signaling is handed back to the test.
pub fn lone_node(
    network: &MockNetwork,
    id: &str,
    config: MeshConfig,
) -> (Node, mpsc::UnboundedReceiver<peer_mesh::SignalEnvelope>) {
    build_node(network, id, config)
}

pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match events.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

pub async fn wait_for_state(
    registry: &SessionRegistry,
    peer: &PeerId,
    state: NegotiationState,
) -> SessionSnapshot {
    let mut snapshots = registry.watch(peer).expect("session exists");
    let snapshot = snapshots
        .wait_for(|snapshot| snapshot.state == state)
        .await
        .expect("session dropped before reaching state")
        .clone();
    snapshot
}

/// Asserts nothing arrives on `events` within `window`.
pub async fn assert_quiet(events: &mut broadcast::Receiver<SessionEvent>, window: Duration) {
    if let Ok(event) = tokio::time::timeout(window, next_event(events)).await {
        panic!("unexpected session event: {event:?}");
    }
}
