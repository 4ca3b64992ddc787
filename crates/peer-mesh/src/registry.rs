//! Owner of every live session, keyed by remote peer id. The registry
//! spawns one [`SessionActor`] per peer, forwards signaling to it, and
//! turns actor lifecycle reports into public [`SessionEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::TransferId;
use crate::config::MeshConfig;
use crate::error::{MeshError, NegotiationError, SendError};
use crate::events::{LifecycleEvent, LifecycleKind, SessionEvent};
use crate::manual::decode_blob;
use crate::message::{AppMessage, ChatMessage};
use crate::negotiation::{ChannelSlot, SessionActor, SessionCommand, SessionContext, SessionStart};
use crate::primitive::{RtcPrimitive, TransportPrimitive};
use crate::router::{self, MessageHandler, NoopHandler};
use crate::session::{
    MediaOptions, NegotiationMode, OpenOptions, PeerId, PeerSession, Purpose, Role,
    SessionSnapshot,
};
use crate::signaling::{Signal, SignalEnvelope, SignalingPort};

const EVENT_CAPACITY: usize = 256;
/// Handshakes of closed sessions remembered so their late offers are ignored.
const CLOSED_HANDSHAKE_CAPACITY: usize = 128;

struct SessionEntry {
    generation: u64,
    purpose: Purpose,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    channel: ChannelSlot,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn current(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}

struct Inner {
    local: PeerId,
    config: Arc<MeshConfig>,
    primitive: Arc<dyn TransportPrimitive>,
    signaling: Arc<dyn SignalingPort>,
    manual: Option<Arc<dyn SignalingPort>>,
    handler: Arc<dyn MessageHandler>,
    sessions: Mutex<HashMap<PeerId, SessionEntry>>,
    /// Locked only while `sessions` is held.
    closed_handshakes: Mutex<VecDeque<(PeerId, Uuid)>>,
    events: broadcast::Sender<SessionEvent>,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the session registry. Cloning is cheap; all clones share
/// the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

pub struct RegistryBuilder {
    local: PeerId,
    signaling: Arc<dyn SignalingPort>,
    config: MeshConfig,
    primitive: Option<Arc<dyn TransportPrimitive>>,
    manual: Option<Arc<dyn SignalingPort>>,
    handler: Arc<dyn MessageHandler>,
}

impl RegistryBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn primitive(mut self, primitive: Arc<dyn TransportPrimitive>) -> Self {
        self.primitive = Some(primitive);
        self
    }

    /// Port used by sessions opened in [`NegotiationMode::Manual`].
    pub fn manual_signaling(mut self, port: Arc<dyn SignalingPort>) -> Self {
        self.manual = Some(port);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Must be called inside a tokio runtime; the lifecycle supervisor is
    /// spawned here. Without an explicit primitive the webrtc-backed one
    /// is used.
    pub fn build(self) -> Result<SessionRegistry, MeshError> {
        let primitive: Arc<dyn TransportPrimitive> = match self.primitive {
            Some(primitive) => primitive,
            None => Arc::new(RtcPrimitive::new()?),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (lifecycle, lifecycle_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local: self.local,
            config: Arc::new(self.config),
            primitive,
            signaling: self.signaling,
            manual: self.manual,
            handler: self.handler,
            sessions: Mutex::new(HashMap::new()),
            closed_handshakes: Mutex::new(VecDeque::new()),
            events,
            lifecycle,
            next_generation: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            lifecycle_rx,
            inner.cancel.clone(),
        ));
        info!(
            target = "peer_mesh::registry",
            local = %inner.local,
            "session registry started"
        );
        Ok(SessionRegistry { inner })
    }
}

async fn supervise(
    registry: Weak<Inner>,
    mut lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = lifecycle.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = registry.upgrade() else {
            break;
        };
        inner.apply_lifecycle(event);
    }
    debug!(target = "peer_mesh::registry", "lifecycle supervisor stopped");
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn apply_lifecycle(&self, event: LifecycleEvent) {
        let mut sessions = self.sessions.lock();
        let current = sessions
            .get(&event.peer)
            .is_some_and(|entry| entry.generation == event.generation);
        if !current {
            debug!(
                target = "peer_mesh::registry",
                peer = %event.peer,
                generation = event.generation,
                kind = ?event.kind,
                "lifecycle report from a replaced session ignored"
            );
            return;
        }
        let LifecycleEvent {
            peer, silent, kind, ..
        } = event;
        match kind {
            LifecycleKind::Established => self.emit(SessionEvent::Established { peer, silent }),
            LifecycleKind::Disconnected => self.emit(SessionEvent::Disconnected { peer, silent }),
            LifecycleKind::Failed(reason) => {
                if let Some(entry) = sessions.remove(&peer) {
                    entry.cancel.cancel();
                    self.remember_closed(&peer, entry.current().handshake_id);
                }
                self.emit(SessionEvent::Failed {
                    peer: peer.clone(),
                    silent,
                    reason,
                });
                self.emit(SessionEvent::Closed { peer, silent });
            }
        }
    }

    fn remove_entry(&self, sessions: &mut HashMap<PeerId, SessionEntry>, peer: &PeerId) -> bool {
        let Some(entry) = sessions.remove(peer) else {
            return false;
        };
        entry.cancel.cancel();
        let snapshot = entry.current();
        self.remember_closed(peer, snapshot.handshake_id);
        let silent = snapshot.silent;
        self.emit(SessionEvent::Closed {
            peer: peer.clone(),
            silent,
        });
        true
    }

    fn remember_closed(&self, peer: &PeerId, handshake_id: Uuid) {
        let mut closed = self.closed_handshakes.lock();
        if closed.len() >= CLOSED_HANDSHAKE_CAPACITY {
            closed.pop_front();
        }
        closed.push_back((peer.clone(), handshake_id));
    }

    fn is_closed_handshake(&self, peer: &PeerId, handshake_id: Uuid) -> bool {
        self.closed_handshakes
            .lock()
            .iter()
            .any(|(closed_peer, closed_id)| closed_peer == peer && *closed_id == handshake_id)
    }

    fn spawn_session(
        &self,
        sessions: &mut HashMap<PeerId, SessionEntry>,
        session: PeerSession,
        start: SessionStart,
        ready: Option<oneshot::Sender<Result<SessionSnapshot, MeshError>>>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let cancel = self.cancel.child_token();
        let peer = session.peer_id.clone();
        let purpose = session.purpose;

        debug!(
            target = "peer_mesh::registry",
            %peer,
            generation,
            role = ?session.role,
            mode = ?session.mode,
            ?purpose,
            "spawning session"
        );
        let ctx = SessionContext {
            local: self.local.clone(),
            generation,
            config: self.config.clone(),
            primitive: self.primitive.clone(),
            automatic: self.signaling.clone(),
            manual: self.manual.clone(),
            handler: self.handler.clone(),
            lifecycle: self.lifecycle.clone(),
            snapshot: snapshot_tx,
            channel_slot: channel.clone(),
            cancel: cancel.clone(),
        };
        let actor = SessionActor::new(ctx, session, commands_rx, ready);
        tokio::spawn(actor.run(start));

        sessions.insert(
            peer,
            SessionEntry {
                generation,
                purpose,
                commands: commands_tx,
                snapshot: snapshot_rx,
                channel,
                cancel,
            },
        );
    }
}

enum Routing {
    Forward(mpsc::UnboundedSender<SessionCommand>),
    Replace,
    Create,
}

impl SessionRegistry {
    pub fn builder(local: impl Into<PeerId>, signaling: Arc<dyn SignalingPort>) -> RegistryBuilder {
        RegistryBuilder {
            local: local.into(),
            signaling,
            config: MeshConfig::default(),
            primitive: None,
            manual: None,
            handler: Arc::new(NoopHandler),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Opens (or reuses) the session with `peer` as caller. A live session
    /// with the same purpose that is negotiating or established is returned
    /// as-is; anything else is closed and replaced. Resolves once the
    /// transport is set up and the initial offer created. Automatic offers
    /// have been handed to signaling by then; Manual offers are held until
    /// candidate gathering completes or times out.
    pub async fn open(
        &self,
        peer: impl Into<PeerId>,
        purpose: Purpose,
        mode: NegotiationMode,
        options: OpenOptions,
    ) -> Result<SessionSnapshot, MeshError> {
        let peer = peer.into();
        if self.inner.cancel.is_cancelled() {
            return Err(MeshError::Shutdown);
        }
        if peer == self.inner.local {
            return Err(NegotiationError::UnknownPeer(peer).into());
        }

        let ready = {
            let mut sessions = self.inner.sessions.lock();
            if let Some(entry) = sessions.get(&peer) {
                let snapshot = entry.current();
                let reusable = entry.purpose == purpose
                    && !entry.commands.is_closed()
                    && (snapshot.state.is_in_flight() || snapshot.is_established());
                if reusable {
                    debug!(
                        target = "peer_mesh::registry",
                        %peer,
                        state = ?snapshot.state,
                        "reusing live session"
                    );
                    return Ok(snapshot);
                }
                info!(
                    target = "peer_mesh::registry",
                    %peer,
                    state = ?snapshot.state,
                    "replacing existing session"
                );
                self.inner.remove_entry(&mut sessions, &peer);
            }

            let session = PeerSession::new(
                peer.clone(),
                Role::Caller,
                mode,
                purpose,
                options,
                self.inner.config.reconnect,
            );
            let (ready_tx, ready_rx) = oneshot::channel();
            self.inner
                .spawn_session(&mut sessions, session, SessionStart::Caller, Some(ready_tx));
            ready_rx
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(NegotiationError::SessionClosed(peer).into()),
        }
    }

    /// Routes an inbound signaling envelope. Offers from unknown peers
    /// create a callee session; everything else for an unknown peer is
    /// dropped.
    pub fn handle_signal(&self, envelope: SignalEnvelope) {
        self.route_signal(envelope, NegotiationMode::Automatic);
    }

    /// Decodes a pasted manual-signaling blob and routes it. New callee
    /// sessions created this way answer through the manual port.
    pub fn accept_manual_blob(&self, blob: &str) -> Result<(), MeshError> {
        let envelope = decode_blob(blob)?;
        self.route_signal(envelope, NegotiationMode::Manual);
        Ok(())
    }

    fn route_signal(&self, envelope: SignalEnvelope, mode: NegotiationMode) {
        let inner = &self.inner;
        if envelope.to_peer != inner.local {
            debug!(
                target = "peer_mesh::registry",
                to = %envelope.to_peer,
                "envelope addressed to another peer dropped"
            );
            return;
        }
        if inner.cancel.is_cancelled() {
            return;
        }
        let SignalEnvelope {
            from_peer: peer,
            signal,
            ..
        } = envelope;

        let mut sessions = inner.sessions.lock();
        if let Signal::Offer(desc) = &signal {
            if inner.is_closed_handshake(&peer, desc.handshake_id) {
                debug!(
                    target = "peer_mesh::registry",
                    %peer,
                    handshake_id = %desc.handshake_id,
                    "offer for a closed handshake dropped"
                );
                return;
            }
        }
        let routing = match sessions.get(&peer) {
            Some(entry) => match &signal {
                Signal::Offer(desc)
                    if desc.purpose != entry.purpose
                        && desc.handshake_id != entry.current().handshake_id =>
                {
                    Routing::Replace
                }
                _ => Routing::Forward(entry.commands.clone()),
            },
            None => Routing::Create,
        };

        match routing {
            Routing::Forward(commands) => {
                if commands
                    .send(SessionCommand::Signal { signal, via: mode })
                    .is_err()
                {
                    debug!(
                        target = "peer_mesh::registry",
                        %peer,
                        "session stopped before signal was delivered"
                    );
                }
                return;
            }
            Routing::Replace => {
                info!(
                    target = "peer_mesh::registry",
                    %peer,
                    "offer for a different purpose; replacing session"
                );
                inner.remove_entry(&mut sessions, &peer);
            }
            Routing::Create => {}
        }

        match signal {
            Signal::Offer(desc) => {
                info!(
                    target = "peer_mesh::registry",
                    %peer,
                    purpose = ?desc.purpose,
                    ?mode,
                    silent = desc.silent,
                    "incoming offer; creating callee session"
                );
                let options = OpenOptions {
                    silent: desc.silent,
                    media: desc.media,
                };
                let session = PeerSession::new(
                    peer,
                    Role::Callee,
                    mode,
                    desc.purpose,
                    options,
                    inner.config.reconnect,
                );
                inner.spawn_session(&mut sessions, session, SessionStart::Callee(desc), None);
            }
            other => {
                debug!(
                    target = "peer_mesh::registry",
                    %peer,
                    kind = other.kind(),
                    "signal for unknown session dropped"
                );
            }
        }
    }

    /// Closes the session with `peer`. Returns false when there was none.
    pub fn close(&self, peer: &PeerId) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let closed = self.inner.remove_entry(&mut sessions, peer);
        if closed {
            info!(target = "peer_mesh::registry", %peer, "session closed");
        }
        closed
    }

    pub fn get(&self, peer: &PeerId) -> Option<SessionSnapshot> {
        self.inner
            .sessions
            .lock()
            .get(peer)
            .map(SessionEntry::current)
    }

    /// Change feed for one session's snapshot.
    pub fn watch(&self, peer: &PeerId) -> Option<watch::Receiver<SessionSnapshot>> {
        self.inner
            .sessions
            .lock()
            .get(peer)
            .map(|entry| entry.snapshot.clone())
    }

    pub fn is_established(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some_and(|snapshot| snapshot.is_established())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.sessions.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Changes the media of an established session without touching its
    /// message channel.
    pub async fn renegotiate(
        &self,
        peer: &PeerId,
        media: MediaOptions,
    ) -> Result<(), NegotiationError> {
        let commands = self
            .inner
            .sessions
            .lock()
            .get(peer)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| NegotiationError::UnknownPeer(peer.clone()))?;
        let (reply, response) = oneshot::channel();
        commands
            .send(SessionCommand::Renegotiate { media, reply })
            .map_err(|_| NegotiationError::SessionClosed(peer.clone()))?;
        response
            .await
            .map_err(|_| NegotiationError::SessionClosed(peer.clone()))?
    }

    pub async fn send(&self, peer: &PeerId, message: &AppMessage) -> Result<TransferId, SendError> {
        let channel = {
            let sessions = self.inner.sessions.lock();
            let entry = sessions
                .get(peer)
                .ok_or_else(|| SendError::UnknownPeer(peer.clone()))?;
            let slot = entry.channel.lock().clone();
            slot
        }
        .ok_or(SendError::NotOpen)?;
        router::send_message(
            &channel,
            message,
            &self.inner.config.chunk,
            &self.inner.config.send,
        )
        .await
    }

    pub async fn send_text(
        &self,
        peer: &PeerId,
        content: impl Into<String>,
    ) -> Result<TransferId, SendError> {
        let message = AppMessage::Chat(ChatMessage::text(&self.inner.local, content));
        self.send(peer, &message).await
    }

    /// Feeds envelopes from `incoming` into [`handle_signal`] until the
    /// channel closes or the registry shuts down.
    ///
    /// [`handle_signal`]: SessionRegistry::handle_signal
    pub fn attach_signaling(
        &self,
        mut incoming: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = incoming.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                SessionRegistry { inner }.handle_signal(envelope);
            }
        })
    }

    /// Closes every session and stops accepting new ones.
    pub fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock();
        let peers: Vec<PeerId> = sessions.keys().cloned().collect();
        for peer in &peers {
            self.inner.remove_entry(&mut sessions, peer);
        }
        self.inner.cancel.cancel();
        if !peers.is_empty() {
            warn!(
                target = "peer_mesh::registry",
                closed = peers.len(),
                "registry shut down with live sessions"
            );
        }
    }
}
