//! Per-session actor. Each session runs one task that owns its
//! [`PeerSession`], drives offer/answer/candidate exchange against the
//! transport primitive, watches connection state, runs the reconnection
//! timer and feeds inbound channel bytes to the router. Everything it
//! learns about lifecycle goes back to the registry as a [`LifecycleEvent`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::error::{MeshError, NegotiationError};
use crate::events::{LifecycleEvent, LifecycleKind};
use crate::message::AppMessage;
use crate::primitive::{
    ConnectionState, DataChannel, PeerTransport, SdpKind, TransportEvent, TransportEvents,
    TransportPrimitive, TransportSpec,
};
use crate::reconnect::ScheduleOutcome;
use crate::router::{self, InboundRouter, MessageHandler};
use crate::session::{
    MediaOptions, NegotiationMode, NegotiationState, PeerId, PeerSession, Purpose, Role,
    SessionSnapshot,
};
use crate::signaling::{
    CandidateHint, CandidatePayload, DescriptionPayload, Signal, SignalEnvelope, SignalingPort,
};

const MIN_GC_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) type ChannelSlot = Arc<Mutex<Option<Arc<dyn DataChannel>>>>;
pub(crate) type ReadyReply = oneshot::Sender<Result<SessionSnapshot, MeshError>>;

pub(crate) enum SessionCommand {
    /// `via` is the signaling path the envelope arrived on; a replacement
    /// transport answers over the same path.
    Signal {
        signal: Signal,
        via: NegotiationMode,
    },
    Renegotiate {
        media: MediaOptions,
        reply: oneshot::Sender<Result<(), NegotiationError>>,
    },
}

pub(crate) enum SessionStart {
    Caller,
    Callee(DescriptionPayload),
}

/// Collaborators and registry plumbing handed to each actor.
pub(crate) struct SessionContext {
    pub local: PeerId,
    pub generation: u64,
    pub config: Arc<MeshConfig>,
    pub primitive: Arc<dyn TransportPrimitive>,
    pub automatic: Arc<dyn SignalingPort>,
    pub manual: Option<Arc<dyn SignalingPort>>,
    pub handler: Arc<dyn MessageHandler>,
    pub lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    pub snapshot: watch::Sender<SessionSnapshot>,
    pub channel_slot: ChannelSlot,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptionKind {
    Offer,
    Answer,
}

struct PendingDescription {
    kind: DescriptionKind,
    sdp: String,
}

pub(crate) struct SessionActor {
    ctx: SessionContext,
    session: PeerSession,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: Option<TransportEvents>,
    inbound: InboundRouter,
    pending_description: Option<PendingDescription>,
    description_sent: bool,
    gather_deadline: Option<Instant>,
    checking_deadline: Option<Instant>,
    outstanding_offer: Option<(Uuid, u32)>,
    last_remote_offer: Option<(Uuid, u32)>,
    renegotiation: Option<oneshot::Sender<Result<(), NegotiationError>>>,
    ready: Option<ReadyReply>,
    /// Silence requested at open; reconnect attempts are silent but a
    /// terminal failure is reported with this flag.
    requested_silent: bool,
    /// Mode and silence in force before a reconnect attempt forced
    /// silent Automatic signaling; restored once the attempt succeeds.
    before_reconnect: Option<(NegotiationMode, bool)>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub fn new(
        ctx: SessionContext,
        session: PeerSession,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        ready: Option<ReadyReply>,
    ) -> Self {
        let inbound = InboundRouter::new(
            session.peer_id.clone(),
            ctx.local.clone(),
            ctx.config.chunk,
            ctx.handler.clone(),
        );
        let requested_silent = session.silent;
        Self {
            ctx,
            session,
            commands,
            events: None,
            inbound,
            pending_description: None,
            description_sent: false,
            gather_deadline: None,
            checking_deadline: None,
            outstanding_offer: None,
            last_remote_offer: None,
            renegotiation: None,
            ready,
            requested_silent,
            before_reconnect: None,
        }
    }

    pub async fn run(mut self, start: SessionStart) {
        let cancel = self.ctx.cancel.clone();
        let peer = self.session.peer_id.clone();
        let started = tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::from(NegotiationError::SessionClosed(peer))),
            result = self.begin(start) => result,
        };

        match started {
            Ok(()) => {
                self.publish();
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(self.session.snapshot()));
                }
                self.event_loop().await;
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    error = %reason,
                    "session could not start"
                );
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(err));
                }
                if !cancel.is_cancelled() {
                    self.fail(reason);
                }
            }
        }
        self.shutdown().await;
    }

    async fn begin(&mut self, start: SessionStart) -> Result<(), MeshError> {
        match start {
            SessionStart::Caller => self.start_offer().await,
            SessionStart::Callee(offer) => self.accept_offer(offer).await,
        }
    }

    async fn event_loop(&mut self) {
        let cancel = self.ctx.cancel.clone();
        let mut gc = tokio::time::interval(self.ctx.config.chunk.gc_timeout.max(MIN_GC_INTERVAL));
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.session.state.is_terminal() {
            let gather_at = self.gather_deadline;
            let checking_at = self.checking_deadline;
            let retry_at = self.session.reconnect.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => self.events = None,
                },
                _ = sleep_until_opt(gather_at) => self.on_gathering_timeout().await,
                _ = sleep_until_opt(checking_at) => self.on_checking_timeout(),
                _ = sleep_until_opt(retry_at) => self.on_retry_timer().await,
                _ = gc.tick() => self.inbound.gc(std::time::Instant::now()),
            }
            self.publish();
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Signal { signal, via } => match signal {
                Signal::Offer(desc) => self.on_offer(desc, via).await,
                Signal::Answer(desc) => self.on_answer(desc).await,
                Signal::IceCandidate(payload) => self.on_remote_candidate(payload).await,
            },
            SessionCommand::Renegotiate { media, reply } => {
                self.start_renegotiation(media, reply).await
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(hint) => self.on_local_candidate(hint).await,
            TransportEvent::GatheringComplete => {
                self.session.gathering_complete = true;
                if let Some(pending) = self.pending_description.take() {
                    let candidates = self.session.pending_local_candidates.clone();
                    self.send_description(pending.kind, pending.sdp, candidates)
                        .await;
                }
            }
            TransportEvent::StateChanged(state) => {
                debug!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    ?state,
                    session_state = ?self.session.state,
                    "transport state changed"
                );
                match state {
                    ConnectionState::Connected => {
                        self.session.transport_connected = true;
                        self.check_established();
                    }
                    ConnectionState::Disconnected => {
                        self.session.transport_connected = false;
                        self.on_transport_lost(false);
                    }
                    ConnectionState::Failed | ConnectionState::Closed => {
                        self.session.transport_connected = false;
                        self.on_transport_lost(true);
                    }
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
            }
            TransportEvent::ChannelOpened(channel) => {
                debug!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    label = channel.label(),
                    "message channel open"
                );
                self.session.channel = Some(channel);
                self.check_established();
            }
            TransportEvent::ChannelMessage(bytes) => {
                if let Some(reply) = self.inbound.accept(bytes, std::time::Instant::now()) {
                    self.send_reply(reply);
                }
            }
            TransportEvent::ChannelClosed => {
                self.session.channel = None;
                *self.ctx.channel_slot.lock() = None;
                if self.session.purpose == Purpose::Data
                    && self.session.state == NegotiationState::Established
                {
                    self.on_transport_lost(false);
                }
            }
        }
    }

    async fn start_offer(&mut self) -> Result<(), MeshError> {
        self.session.role = Role::Caller;
        let transport = self.create_transport().await?;
        let sdp = transport.create_offer().await?;
        if self.session.state != NegotiationState::Reconnecting {
            self.session.transition(NegotiationState::OfferCreated);
        }
        self.outstanding_offer = Some((self.session.handshake_id, self.session.revision));
        self.deliver_description(DescriptionKind::Offer, sdp).await;
        Ok(())
    }

    async fn accept_offer(&mut self, desc: DescriptionPayload) -> Result<(), MeshError> {
        self.session.role = Role::Callee;
        self.session.handshake_id = desc.handshake_id;
        self.session.revision = desc.revision;
        self.session.media = desc.media;
        self.session.silent = desc.silent;
        self.last_remote_offer = Some((desc.handshake_id, desc.revision));

        let transport = self.create_transport().await?;
        self.session.transition(NegotiationState::AnswerPending);
        transport
            .set_remote_description(SdpKind::Offer, desc.sdp)
            .await?;
        self.session.remote_description_set = true;
        self.apply_remote_candidates(desc.candidates).await;
        let sdp = transport.create_answer().await?;
        self.deliver_description(DescriptionKind::Answer, sdp).await;
        Ok(())
    }

    async fn create_transport(&mut self) -> Result<Arc<dyn PeerTransport>, MeshError> {
        self.teardown_transport().await;
        let spec = TransportSpec {
            local: self.ctx.local.clone(),
            remote: self.session.peer_id.clone(),
            role: self.session.role,
            purpose: self.session.purpose,
            media: self.session.media,
            channel_label: self.ctx.config.data_channel_label.clone(),
            ice_servers: self.ctx.config.ice_servers.clone(),
        };
        let (transport, events) = self.ctx.primitive.create(&spec).await?;
        self.session.transport = Some(transport.clone());
        self.events = Some(events);
        Ok(transport)
    }

    async fn teardown_transport(&mut self) {
        if let Some(transport) = self.session.transport.take() {
            transport.close().await;
        }
        self.events = None;
        self.session.reset_handshake(true);
        *self.ctx.channel_slot.lock() = None;
        self.pending_description = None;
        self.description_sent = false;
        self.gather_deadline = None;
        self.checking_deadline = None;
        self.outstanding_offer = None;
    }

    /// Automatic mode sends the description right away and trickles
    /// candidates after it. Manual mode holds it until gathering completes
    /// or the gathering timeout elapses, then sends one batched payload.
    async fn deliver_description(&mut self, kind: DescriptionKind, sdp: String) {
        self.description_sent = false;
        match self.session.mode {
            NegotiationMode::Automatic => self.send_description(kind, sdp, Vec::new()).await,
            NegotiationMode::Manual if self.session.gathering_complete => {
                let candidates = self.session.pending_local_candidates.clone();
                self.send_description(kind, sdp, candidates).await;
            }
            NegotiationMode::Manual => {
                self.pending_description = Some(PendingDescription { kind, sdp });
                self.gather_deadline = Some(Instant::now() + self.ctx.config.gathering_timeout);
            }
        }
    }

    async fn send_description(
        &mut self,
        kind: DescriptionKind,
        sdp: String,
        candidates: Vec<CandidateHint>,
    ) {
        let payload = DescriptionPayload {
            sdp,
            purpose: self.session.purpose,
            media: self.session.media,
            candidates,
            handshake_id: self.session.handshake_id,
            revision: self.session.revision,
            silent: self.session.silent,
        };
        let signal = match kind {
            DescriptionKind::Offer => Signal::Offer(payload),
            DescriptionKind::Answer => Signal::Answer(payload),
        };
        self.send_signal(signal).await;
        self.description_sent = true;
        self.pending_description = None;
        self.gather_deadline = None;

        let awaiting_connection = self.session.state != NegotiationState::Established;
        if awaiting_connection
            && (kind == DescriptionKind::Answer || self.session.mode == NegotiationMode::Automatic)
        {
            self.arm_checking();
        }
        if kind == DescriptionKind::Answer && self.session.state == NegotiationState::AnswerPending
        {
            self.session.transition(NegotiationState::CandidateExchange);
        }
    }

    async fn send_signal(&self, signal: Signal) {
        let port = match self.session.mode {
            NegotiationMode::Manual => self.ctx.manual.as_ref().unwrap_or(&self.ctx.automatic),
            NegotiationMode::Automatic => &self.ctx.automatic,
        };
        let kind = signal.kind();
        let envelope = SignalEnvelope::new(self.ctx.local.clone(), self.session.peer_id.clone(), signal);
        if let Err(err) = port.send(envelope).await {
            warn!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                kind,
                error = %err,
                "failed to send signaling message"
            );
        }
    }

    fn arm_checking(&mut self) {
        self.checking_deadline = Some(Instant::now() + self.ctx.config.checking_timeout);
    }

    async fn on_local_candidate(&mut self, hint: CandidateHint) {
        if self.session.state != NegotiationState::Established {
            self.session.pending_local_candidates.push(hint.clone());
        }
        match self.session.mode {
            NegotiationMode::Automatic => {
                let payload = CandidatePayload {
                    handshake_id: self.session.handshake_id,
                    candidate: hint,
                };
                self.send_signal(Signal::IceCandidate(payload)).await;
            }
            NegotiationMode::Manual if self.description_sent => {
                debug!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    "candidate gathered after manual payload was sent; not delivered"
                );
            }
            NegotiationMode::Manual => {}
        }
    }

    async fn on_offer(&mut self, desc: DescriptionPayload, via: NegotiationMode) {
        let identity = (desc.handshake_id, desc.revision);
        if self.last_remote_offer == Some(identity) {
            debug!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                handshake_id = %desc.handshake_id,
                "duplicate offer dropped"
            );
            return;
        }
        let same_handshake = desc.handshake_id == self.session.handshake_id;
        let state = self.session.state;
        match state {
            NegotiationState::Established
                if same_handshake && desc.revision > self.session.revision =>
            {
                self.answer_renegotiation(desc).await;
            }
            NegotiationState::Established => {
                debug!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    "offer for a new handshake while established; dropped"
                );
            }
            NegotiationState::OfferCreated | NegotiationState::Reconnecting
                if self.outstanding_offer.is_some() =>
            {
                if self.ctx.local > self.session.peer_id {
                    info!(
                        target = "peer_mesh::negotiation",
                        peer = %self.session.peer_id,
                        "offer collision; keeping local offer"
                    );
                    return;
                }
                info!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    "offer collision; yielding to remote offer"
                );
                self.outstanding_offer = None;
                if let Some(reply) = self.renegotiation.take() {
                    let _ = reply.send(Err(NegotiationError::Superseded));
                    if same_handshake {
                        self.session.transition(NegotiationState::Established);
                        self.answer_renegotiation(desc).await;
                        return;
                    }
                }
                self.session.mode = via;
                if let Err(err) = self.accept_offer(desc).await {
                    self.negotiation_failed(err);
                }
            }
            _ if same_handshake && desc.revision <= self.session.revision => {
                debug!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    ?state,
                    "late offer dropped"
                );
            }
            _ => {
                self.session.reconnect.cancel();
                self.session.mode = via;
                if let Err(err) = self.accept_offer(desc).await {
                    self.negotiation_failed(err);
                }
            }
        }
    }

    async fn answer_renegotiation(&mut self, desc: DescriptionPayload) {
        let Some(transport) = self.session.transport.clone() else {
            return;
        };
        let identity = (desc.handshake_id, desc.revision);
        let answered = async {
            transport
                .set_remote_description(SdpKind::Offer, desc.sdp)
                .await?;
            transport.create_answer().await
        }
        .await;
        match answered {
            Ok(sdp) => {
                self.last_remote_offer = Some(identity);
                self.session.revision = desc.revision;
                self.session.media = desc.media;
                self.send_description(DescriptionKind::Answer, sdp, Vec::new())
                    .await;
                info!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    revision = desc.revision,
                    "renegotiation answered"
                );
            }
            Err(err) => {
                warn!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    error = %err,
                    "renegotiation offer rejected"
                );
            }
        }
    }

    async fn on_answer(&mut self, desc: DescriptionPayload) {
        if self.outstanding_offer != Some((desc.handshake_id, desc.revision)) {
            debug!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                state = ?self.session.state,
                "unexpected answer dropped"
            );
            return;
        }
        let Some(transport) = self.session.transport.clone() else {
            return;
        };
        if let Err(err) = transport
            .set_remote_description(SdpKind::Answer, desc.sdp)
            .await
        {
            warn!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                error = %err,
                "answer rejected by transport"
            );
            return;
        }
        self.outstanding_offer = None;
        self.session.remote_description_set = true;

        if let Some(reply) = self.renegotiation.take() {
            self.session.transition(NegotiationState::Established);
            self.checking_deadline = None;
            let _ = reply.send(Ok(()));
            info!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                revision = desc.revision,
                "renegotiation complete"
            );
            return;
        }

        if self.session.state == NegotiationState::OfferCreated {
            self.session.transition(NegotiationState::RemoteAccepted);
        }
        self.apply_remote_candidates(desc.candidates).await;
        if self.session.mode == NegotiationMode::Manual {
            self.arm_checking();
        }
        if self.session.state == NegotiationState::RemoteAccepted {
            self.session.transition(NegotiationState::CandidateExchange);
        }
        self.check_established();
    }

    async fn on_remote_candidate(&mut self, payload: CandidatePayload) {
        if payload.handshake_id != self.session.handshake_id {
            debug!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                "candidate for a previous handshake dropped"
            );
            return;
        }
        if !self.session.remote_description_set {
            self.session.pending_remote_candidates.push(payload.candidate);
            return;
        }
        self.apply_remote_candidates(vec![payload.candidate]).await;
        if self.session.state == NegotiationState::RemoteAccepted {
            self.session.transition(NegotiationState::CandidateExchange);
        }
    }

    async fn apply_remote_candidates(&mut self, extra: Vec<CandidateHint>) {
        let Some(transport) = self.session.transport.clone() else {
            return;
        };
        let mut candidates = std::mem::take(&mut self.session.pending_remote_candidates);
        candidates.extend(extra);
        for candidate in candidates {
            if let Err(err) = transport.add_remote_candidate(candidate).await {
                warn!(
                    target = "peer_mesh::negotiation",
                    peer = %self.session.peer_id,
                    error = %err,
                    "remote candidate rejected"
                );
            }
        }
    }

    async fn start_renegotiation(
        &mut self,
        media: MediaOptions,
        reply: oneshot::Sender<Result<(), NegotiationError>>,
    ) {
        let state = self.session.state;
        let transport = match (state, self.session.transport.clone()) {
            (NegotiationState::Disconnected | NegotiationState::Reconnecting, _) => {
                let _ = reply.send(Err(NegotiationError::Superseded));
                return;
            }
            (NegotiationState::Established, Some(transport)) => transport,
            _ => {
                let _ = reply.send(Err(NegotiationError::InvalidState(state)));
                return;
            }
        };

        let previous = self.session.media;
        let offered = async {
            transport.apply_media(media).await?;
            transport.create_offer().await
        }
        .await;
        let sdp = match offered {
            Ok(sdp) => sdp,
            Err(err) => {
                self.session.media = previous;
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        self.session.media = media;
        self.session.revision += 1;
        self.session.transition(NegotiationState::OfferCreated);
        self.outstanding_offer = Some((self.session.handshake_id, self.session.revision));
        self.renegotiation = Some(reply);
        info!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            revision = self.session.revision,
            ?media,
            "renegotiation offer created"
        );
        self.deliver_description(DescriptionKind::Offer, sdp).await;
    }

    async fn on_gathering_timeout(&mut self) {
        self.gather_deadline = None;
        if let Some(pending) = self.pending_description.take() {
            let candidates = self.session.pending_local_candidates.clone();
            warn!(
                target = "peer_mesh::negotiation",
                peer = %self.session.peer_id,
                candidates = candidates.len(),
                "candidate gathering timed out; sending what was gathered"
            );
            self.send_description(pending.kind, pending.sdp, candidates)
                .await;
        }
    }

    fn on_checking_timeout(&mut self) {
        self.checking_deadline = None;
        if let Some(reply) = self.renegotiation.take() {
            self.outstanding_offer = None;
            self.session.transition(NegotiationState::Established);
            let _ = reply.send(Err(NegotiationError::Unanswered));
            return;
        }
        let state = self.session.state;
        if state == NegotiationState::Established || state.is_terminal() {
            return;
        }
        warn!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            ?state,
            "connection checking timed out"
        );
        match self.session.purpose {
            Purpose::Data => self.schedule_retry(),
            Purpose::Media => self.fail("connection checking timed out".to_string()),
        }
    }

    async fn on_retry_timer(&mut self) {
        let Some(attempt) = self.session.reconnect.fire() else {
            return;
        };
        if self.session.state == NegotiationState::Established {
            debug!(
                target = "peer_mesh::reconnect",
                peer = %self.session.peer_id,
                attempt,
                "session recovered before retry; skipping"
            );
            return;
        }
        info!(
            target = "peer_mesh::reconnect",
            peer = %self.session.peer_id,
            attempt,
            "reconnect attempt starting"
        );
        self.before_reconnect
            .get_or_insert((self.session.mode, self.session.silent));
        self.session.mode = NegotiationMode::Automatic;
        self.session.silent = true;
        self.session.handshake_id = Uuid::new_v4();
        self.session.revision = 0;
        self.session.transition(NegotiationState::Reconnecting);
        if let Err(err) = self.start_offer().await {
            warn!(
                target = "peer_mesh::reconnect",
                peer = %self.session.peer_id,
                attempt,
                error = %err,
                "reconnect attempt failed"
            );
            self.schedule_retry();
        }
    }

    fn on_transport_lost(&mut self, failed: bool) {
        let mut was_established = self.session.state == NegotiationState::Established;
        if let Some(reply) = self.renegotiation.take() {
            was_established = true;
            self.outstanding_offer = None;
            let _ = reply.send(Err(NegotiationError::Superseded));
        }

        match self.session.purpose {
            Purpose::Media if failed => self.fail("media transport failed".to_string()),
            Purpose::Media => {
                if was_established {
                    self.session.transition(NegotiationState::Disconnected);
                    self.emit(LifecycleKind::Disconnected);
                }
            }
            Purpose::Data => {
                if was_established {
                    self.session.transition(NegotiationState::Disconnected);
                    self.emit(LifecycleKind::Disconnected);
                }
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        match self.session.reconnect.schedule(Instant::now()) {
            ScheduleOutcome::Armed { attempt, delay } => {
                self.checking_deadline = None;
                self.session.transition(NegotiationState::Disconnected);
                info!(
                    target = "peer_mesh::reconnect",
                    peer = %self.session.peer_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
            }
            ScheduleOutcome::AlreadyArmed => {}
            ScheduleOutcome::Exhausted { attempts } => {
                self.fail(format!("reconnect attempts exhausted after {attempts}"));
            }
        }
    }

    fn negotiation_failed(&mut self, err: MeshError) {
        warn!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            error = %err,
            "negotiation failed"
        );
        match self.session.purpose {
            Purpose::Data => self.schedule_retry(),
            Purpose::Media => self.fail(err.to_string()),
        }
    }

    fn check_established(&mut self) {
        let state = self.session.state;
        if self.renegotiation.is_some()
            || state == NegotiationState::Established
            || state.is_terminal()
            || !self.session.connection_ready()
        {
            return;
        }
        self.session.transition(NegotiationState::Established);
        self.session.reconnect.reset();
        self.session.pending_local_candidates.clear();
        self.session.pending_remote_candidates.clear();
        self.checking_deadline = None;
        self.gather_deadline = None;
        *self.ctx.channel_slot.lock() = self.session.channel.clone();
        info!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            role = ?self.session.role,
            purpose = ?self.session.purpose,
            silent = self.session.silent,
            "session established"
        );
        self.emit(LifecycleKind::Established);
        if let Some((mode, silent)) = self.before_reconnect.take() {
            self.session.mode = mode;
            self.session.silent = silent;
        }
    }

    fn send_reply(&self, reply: AppMessage) {
        let Some(channel) = self.session.channel.clone() else {
            return;
        };
        let chunk = self.ctx.config.chunk;
        let send = self.ctx.config.send;
        let peer = self.session.peer_id.clone();
        tokio::spawn(async move {
            if let Err(err) = router::send_message(&channel, &reply, &chunk, &send).await {
                warn!(
                    target = "peer_mesh::router",
                    %peer,
                    error = %err,
                    "failed to send automatic reply"
                );
            }
        });
    }

    fn fail(&mut self, reason: String) {
        warn!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            %reason,
            "session failed"
        );
        self.session.transition(NegotiationState::Failed);
        self.report(LifecycleKind::Failed(reason), self.requested_silent);
    }

    fn emit(&self, kind: LifecycleKind) {
        self.report(kind, self.session.silent);
    }

    fn report(&self, kind: LifecycleKind, silent: bool) {
        let _ = self.ctx.lifecycle.send(LifecycleEvent {
            peer: self.session.peer_id.clone(),
            generation: self.ctx.generation,
            silent,
            kind,
        });
    }

    fn publish(&self) {
        let next = self.session.snapshot();
        self.ctx.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        if let Some(reply) = self.renegotiation.take() {
            let _ = reply.send(Err(NegotiationError::SessionClosed(
                self.session.peer_id.clone(),
            )));
        }
        let purged = self.inbound.purge();
        if let Some(transport) = self.session.transport.take() {
            transport.close().await;
        }
        self.events = None;
        self.session.channel = None;
        *self.ctx.channel_slot.lock() = None;
        if !self.session.state.is_terminal() {
            self.session.transition(NegotiationState::Closed);
        }
        self.publish();
        debug!(
            target = "peer_mesh::negotiation",
            peer = %self.session.peer_id,
            purged_transfers = purged,
            "session actor stopped"
        );
    }
}
