use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SignalingError;
use crate::session::{MediaOptions, PeerId, Purpose};

/// One negotiation message between two peers, as carried by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from_peer: PeerId,
    pub to_peer: PeerId,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(from_peer: PeerId, to_peer: PeerId, signal: Signal) -> Self {
        Self {
            from_peer,
            to_peer,
            signal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(CandidatePayload),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice_candidate",
        }
    }

    pub fn handshake_id(&self) -> Uuid {
        match self {
            Signal::Offer(desc) | Signal::Answer(desc) => desc.handshake_id,
            Signal::IceCandidate(candidate) => candidate.handshake_id,
        }
    }
}

/// Offer or answer. An answer echoes the `handshake_id` and `revision` of
/// the offer it accepts; `candidates` is only filled in manual mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub sdp: String,
    pub purpose: Purpose,
    #[serde(default)]
    pub media: MediaOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateHint>,
    pub handshake_id: Uuid,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub handshake_id: Uuid,
    pub candidate: CandidateHint,
}

/// A connectivity path descriptor gathered by the negotiation primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateHint {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateHint {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Outbound half of the negotiation channel. Delivery, ordering and
/// reconnection of the relay itself belong to the implementor; inbound
/// envelopes are handed to [`SessionRegistry::handle_signal`].
///
/// [`SessionRegistry::handle_signal`]: crate::registry::SessionRegistry::handle_signal
#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}

/// In-process port that forwards envelopes to an mpsc receiver. Useful for
/// wiring two registries together or for relaying through a custom bus.
#[derive(Clone, Debug)]
pub struct ChannelSignaling {
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

impl ChannelSignaling {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalingPort for ChannelSignaling {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).map_err(|_| SignalingError::Closed)
    }
}
