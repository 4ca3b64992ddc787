use thiserror::Error;

use crate::chunk::ChunkError;
use crate::session::{NegotiationState, PeerId};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling blob invalid: {0}")]
    InvalidBlob(String),
    #[error("signaling relay rejected envelope: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    Description(String),
    #[error("invalid candidate: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("data channel is not open")]
    NotOpen,
    #[error("send buffer saturated ({buffered} bytes queued)")]
    Saturated { buffered: usize },
    #[error("message could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("renegotiation superseded by reconnection in progress")]
    Superseded,
    #[error("renegotiation offer was not answered in time")]
    Unanswered,
    #[error("operation not valid in state {0:?}")]
    InvalidState(NegotiationState),
    #[error("session for peer {0} is closed")]
    SessionClosed(PeerId),
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("session registry is shut down")]
    Shutdown,
}
