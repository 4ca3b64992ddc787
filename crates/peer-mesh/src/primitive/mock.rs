//! In-memory stand-in for the connectivity primitive. Transports created on
//! the same [`MockNetwork`] find each other through the endpoint id embedded
//! in their descriptions and candidates, and "connect" once both sides have
//! applied the other's description and at least one candidate. Tests steer
//! link failures through the network handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    ConnectionState, DataChannel, PeerTransport, SdpKind, TransportEvent, TransportEvents,
    TransportPrimitive, TransportSpec,
};
use crate::error::PrimitiveError;
use crate::session::{MediaOptions, PeerId, Purpose};
use crate::signaling::CandidateHint;

const DEFAULT_CANDIDATES: usize = 2;

#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    candidates_per_side: usize,
    complete_gathering: bool,
    blocked: HashSet<(PeerId, PeerId)>,
    failing_creates: HashMap<PeerId, usize>,
    stalled: Arc<Mutex<HashMap<PeerId, usize>>>,
    created: HashMap<PeerId, usize>,
}

struct Endpoint {
    local: PeerId,
    remote: PeerId,
    purpose: Purpose,
    label: String,
    media: MediaOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    local_set: bool,
    remote_endpoint: Option<u64>,
    remote_candidates: usize,
    linked: Option<u64>,
    channel_open: Arc<AtomicBool>,
    closed: bool,
}

fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                next_id: 1,
                endpoints: HashMap::new(),
                candidates_per_side: DEFAULT_CANDIDATES,
                complete_gathering: true,
                blocked: HashSet::new(),
                failing_creates: HashMap::new(),
                stalled: Arc::new(Mutex::new(HashMap::new())),
                created: HashMap::new(),
            })),
        }
    }

    pub fn primitive(&self) -> MockPrimitive {
        MockPrimitive {
            network: self.clone(),
        }
    }

    /// Local candidates each transport emits after its first description.
    pub fn set_candidates_per_side(&self, count: usize) {
        self.inner.lock().candidates_per_side = count;
    }

    /// When disabled, transports never report gathering complete.
    pub fn set_gathering_completes(&self, enabled: bool) {
        self.inner.lock().complete_gathering = enabled;
    }

    /// Prevents new links between `a` and `b` from forming.
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        self.inner.lock().blocked.insert(pair_key(a, b));
    }

    pub fn unblock(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.inner.lock();
        state.blocked.remove(&pair_key(a, b));
        let ids: Vec<u64> = state.endpoints.keys().copied().collect();
        for id in ids {
            state.try_link(id);
        }
    }

    /// The next `count` transports created for `local` fail at setup.
    pub fn fail_next_creates(&self, local: &PeerId, count: usize) {
        self.inner
            .lock()
            .failing_creates
            .insert(local.clone(), count);
    }

    /// Channels owned by `local` report `bytes` as buffered.
    pub fn stall(&self, local: &PeerId, bytes: usize) {
        let stalled = self.inner.lock().stalled.clone();
        stalled.lock().insert(local.clone(), bytes);
    }

    pub fn unstall(&self, local: &PeerId) {
        let stalled = self.inner.lock().stalled.clone();
        stalled.lock().remove(local);
    }

    pub fn transports_created(&self, local: &PeerId) -> usize {
        self.inner.lock().created.get(local).copied().unwrap_or(0)
    }

    /// Breaks every live link between `a` and `b`; both sides observe
    /// `Disconnected` and their channels stop accepting writes.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.inner
            .lock()
            .break_links(a, b, ConnectionState::Disconnected);
    }

    pub fn fail(&self, a: &PeerId, b: &PeerId) {
        self.inner.lock().break_links(a, b, ConnectionState::Failed);
    }

    /// Restores links broken by [`disconnect`](Self::disconnect), as when
    /// ICE recovers on its own.
    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        let state = self.inner.lock();
        let key = pair_key(a, b);
        for endpoint in state.endpoints.values() {
            if endpoint.closed || pair_key(&endpoint.local, &endpoint.remote) != key {
                continue;
            }
            if endpoint.linked.is_some() && !endpoint.channel_open.load(Ordering::SeqCst) {
                endpoint.channel_open.store(true, Ordering::SeqCst);
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged(ConnectionState::Connected));
            }
        }
    }
}

impl NetworkState {
    fn endpoint_ready(&self, id: u64) -> Option<u64> {
        let endpoint = self.endpoints.get(&id)?;
        if endpoint.closed
            || endpoint.linked.is_some()
            || !endpoint.local_set
            || endpoint.remote_candidates == 0
        {
            return None;
        }
        endpoint.remote_endpoint
    }

    fn try_link(&mut self, id: u64) {
        let Some(other) = self.endpoint_ready(id) else {
            return;
        };
        if self.endpoint_ready(other) != Some(id) {
            return;
        }
        let (local, remote, purpose) = match self.endpoints.get(&id) {
            Some(endpoint) => (
                endpoint.local.clone(),
                endpoint.remote.clone(),
                endpoint.purpose,
            ),
            None => return,
        };
        if self.blocked.contains(&pair_key(&local, &remote)) {
            trace!(target = "peer_mesh::mock", %local, %remote, "link blocked");
            return;
        }

        let (Some(a_tx), Some(b_tx)) = (
            self.endpoints.get(&id).map(|e| e.events.clone()),
            self.endpoints.get(&other).map(|e| e.events.clone()),
        ) else {
            return;
        };
        for (this, peer, this_tx, peer_tx) in [(id, other, &a_tx, &b_tx), (other, id, &b_tx, &a_tx)]
        {
            let Some(endpoint) = self.endpoints.get_mut(&this) else {
                continue;
            };
            endpoint.linked = Some(peer);
            endpoint.channel_open.store(true, Ordering::SeqCst);
            let _ = this_tx.send(TransportEvent::StateChanged(ConnectionState::Connecting));
            let _ = this_tx.send(TransportEvent::StateChanged(ConnectionState::Connected));
            if purpose == Purpose::Data {
                let channel = MockChannel {
                    owner: endpoint.local.clone(),
                    label: endpoint.label.clone(),
                    open: endpoint.channel_open.clone(),
                    peer_tx: peer_tx.clone(),
                    stalled: self.stalled.clone(),
                };
                let _ = this_tx.send(TransportEvent::ChannelOpened(Arc::new(channel)));
            }
        }
        trace!(target = "peer_mesh::mock", %local, %remote, "mock link established");
    }

    fn break_links(&mut self, a: &PeerId, b: &PeerId, state: ConnectionState) {
        let key = pair_key(a, b);
        for endpoint in self.endpoints.values() {
            if endpoint.closed
                || endpoint.linked.is_none()
                || pair_key(&endpoint.local, &endpoint.remote) != key
            {
                continue;
            }
            endpoint.channel_open.store(false, Ordering::SeqCst);
            let _ = endpoint.events.send(TransportEvent::StateChanged(state));
        }
    }
}

#[derive(Clone)]
pub struct MockPrimitive {
    network: MockNetwork,
}

#[async_trait]
impl TransportPrimitive for MockPrimitive {
    async fn create(
        &self,
        spec: &TransportSpec,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), PrimitiveError> {
        let mut state = self.network.inner.lock();
        *state.created.entry(spec.local.clone()).or_default() += 1;
        if let Some(remaining) = state.failing_creates.get_mut(&spec.local) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PrimitiveError::Setup("mock transport setup refused".into()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                local: spec.local.clone(),
                remote: spec.remote.clone(),
                purpose: spec.purpose,
                label: spec.channel_label.clone(),
                media: spec.media,
                events: tx,
                local_set: false,
                remote_endpoint: None,
                remote_candidates: 0,
                linked: None,
                channel_open: Arc::new(AtomicBool::new(false)),
                closed: false,
            },
        );
        let transport = MockTransport {
            id,
            network: self.network.clone(),
        };
        Ok((Arc::new(transport), rx))
    }
}

struct MockTransport {
    id: u64,
    network: MockNetwork,
}

impl MockTransport {
    fn describe(&self, kind: &str) -> Result<String, PrimitiveError> {
        let mut state = self.network.inner.lock();
        let candidates = state.candidates_per_side;
        let complete = state.complete_gathering;
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(PrimitiveError::Closed)?;
        if kind == "answer" && endpoint.remote_endpoint.is_none() {
            return Err(PrimitiveError::Description(
                "answer requested before remote offer".into(),
            ));
        }
        let media = endpoint.media;
        let sdp = format!(
            "mock-sdp {kind} endpoint={} audio={} video={} screen={}",
            self.id, media.audio, media.video, media.screen_share
        );
        if !endpoint.local_set {
            endpoint.local_set = true;
            for index in 0..candidates {
                let _ = endpoint
                    .events
                    .send(TransportEvent::LocalCandidate(CandidateHint {
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                        ..CandidateHint::new(format!("candidate:mock {} {index}", self.id))
                    }));
            }
            if complete {
                let _ = endpoint.events.send(TransportEvent::GatheringComplete);
            }
        }
        state.try_link(self.id);
        Ok(sdp)
    }
}

fn parse_endpoint(text: &str, marker: &str) -> Option<u64> {
    let rest = text.split(marker).nth(1)?;
    rest.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, PrimitiveError> {
        self.describe("offer")
    }

    async fn create_answer(&self) -> Result<String, PrimitiveError> {
        self.describe("answer")
    }

    async fn set_remote_description(
        &self,
        _kind: SdpKind,
        sdp: String,
    ) -> Result<(), PrimitiveError> {
        let remote = parse_endpoint(&sdp, "endpoint=")
            .ok_or_else(|| PrimitiveError::Description(format!("unparsable sdp: {sdp}")))?;
        let mut state = self.network.inner.lock();
        if !state.endpoints.contains_key(&remote) {
            return Err(PrimitiveError::Description(format!(
                "unknown remote endpoint {remote}"
            )));
        }
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(PrimitiveError::Closed)?;
        if endpoint.linked.is_some_and(|linked| linked != remote) {
            return Err(PrimitiveError::Description(
                "description belongs to another transport".into(),
            ));
        }
        endpoint.remote_endpoint = Some(remote);
        state.try_link(self.id);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateHint) -> Result<(), PrimitiveError> {
        let from = parse_endpoint(&candidate.candidate, "candidate:mock ")
            .ok_or_else(|| PrimitiveError::Candidate(candidate.candidate.clone()))?;
        let mut state = self.network.inner.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(PrimitiveError::Closed)?;
        match endpoint.remote_endpoint {
            None => {
                return Err(PrimitiveError::Candidate(
                    "remote description not set".into(),
                ));
            }
            Some(remote) if remote != from => {
                return Err(PrimitiveError::Candidate(format!(
                    "candidate from endpoint {from}, expected {remote}"
                )));
            }
            Some(_) => endpoint.remote_candidates += 1,
        }
        state.try_link(self.id);
        Ok(())
    }

    async fn apply_media(&self, media: MediaOptions) -> Result<(), PrimitiveError> {
        let mut state = self.network.inner.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or(PrimitiveError::Closed)?;
        endpoint.media = media;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.inner.lock();
        let linked = match state.endpoints.get_mut(&self.id) {
            Some(endpoint) if !endpoint.closed => {
                endpoint.closed = true;
                endpoint.channel_open.store(false, Ordering::SeqCst);
                endpoint.linked.take()
            }
            _ => None,
        };
        if let Some(peer) = linked.and_then(|id| state.endpoints.get_mut(&id)) {
            peer.linked = None;
            peer.channel_open.store(false, Ordering::SeqCst);
            if peer.purpose == Purpose::Data {
                let _ = peer.events.send(TransportEvent::ChannelClosed);
            }
        }
    }
}

struct MockChannel {
    owner: PeerId,
    label: String,
    open: Arc<AtomicBool>,
    peer_tx: mpsc::UnboundedSender<TransportEvent>,
    stalled: Arc<Mutex<HashMap<PeerId, usize>>>,
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.stalled.lock().get(&self.owner).copied().unwrap_or(0)
    }

    async fn send(&self, data: Bytes) -> Result<(), PrimitiveError> {
        if !self.is_open() {
            return Err(PrimitiveError::Channel("channel not open".into()));
        }
        self.peer_tx
            .send(TransportEvent::ChannelMessage(data))
            .map_err(|_| PrimitiveError::Closed)
    }
}
