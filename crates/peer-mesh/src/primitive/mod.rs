//! Seam over the platform's connectivity primitive (ICE/DTLS/SCTP). The
//! negotiation engine only ever talks to these traits; `rtc` binds them to
//! webrtc-rs and `mock` provides an in-memory loopback for tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::PrimitiveError;
use crate::session::{MediaOptions, PeerId, Purpose, Role};
use crate::signaling::CandidateHint;

pub mod mock;
pub mod rtc;

pub use mock::{MockNetwork, MockPrimitive};
pub use rtc::RtcPrimitive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub local: PeerId,
    pub remote: PeerId,
    pub role: Role,
    pub purpose: Purpose,
    pub media: MediaOptions,
    pub channel_label: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Everything a transport instance reports back to its session actor.
pub enum TransportEvent {
    LocalCandidate(CandidateHint),
    GatheringComplete,
    StateChanged(ConnectionState),
    ChannelOpened(Arc<dyn DataChannel>),
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(hint) => {
                f.debug_tuple("LocalCandidate").field(hint).finish()
            }
            TransportEvent::GatheringComplete => f.write_str("GatheringComplete"),
            TransportEvent::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            TransportEvent::ChannelOpened(channel) => f
                .debug_tuple("ChannelOpened")
                .field(&channel.label())
                .finish(),
            TransportEvent::ChannelMessage(bytes) => {
                f.debug_tuple("ChannelMessage").field(&bytes.len()).finish()
            }
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait TransportPrimitive: Send + Sync {
    /// Builds a fresh transport instance. Callers create the message
    /// channel up front for Data sessions; callees learn about it through
    /// [`TransportEvent::ChannelOpened`].
    async fn create(
        &self,
        spec: &TransportSpec,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), PrimitiveError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, PrimitiveError>;
    /// Creates an answer to the applied remote offer and installs it.
    async fn create_answer(&self) -> Result<String, PrimitiveError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String)
    -> Result<(), PrimitiveError>;
    async fn add_remote_candidate(&self, candidate: CandidateHint) -> Result<(), PrimitiveError>;
    /// Adjusts sending tracks ahead of a renegotiation offer.
    async fn apply_media(&self, media: MediaOptions) -> Result<(), PrimitiveError>;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn buffered_amount(&self) -> usize;
    async fn send(&self, data: Bytes) -> Result<(), PrimitiveError>;
}
