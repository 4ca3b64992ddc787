use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::primitive::{DataChannel, PeerTransport};
use crate::reconnect::{ReconnectPolicy, ReconnectScheduler};
use crate::signaling::CandidateHint;

/// Opaque, stable identifier of a remote party.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationMode {
    /// Descriptions and trickled candidates go out over the signaling relay.
    #[default]
    Automatic,
    /// One batched blob per description, exchanged out of band.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Data,
    Media,
}

/// Call parameters of a media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaOptions {
    pub audio: bool,
    pub video: bool,
    pub screen_share: bool,
}

impl MediaOptions {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferCreated,
    AnswerPending,
    RemoteAccepted,
    CandidateExchange,
    Established,
    Disconnected,
    Reconnecting,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// A handshake is underway and has not yet produced a connection.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            NegotiationState::New
                | NegotiationState::OfferCreated
                | NegotiationState::AnswerPending
                | NegotiationState::RemoteAccepted
                | NegotiationState::CandidateExchange
                | NegotiationState::Reconnecting
        )
    }
}

/// Caller-supplied knobs for [`SessionRegistry::open`].
///
/// [`SessionRegistry::open`]: crate::registry::SessionRegistry::open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub silent: bool,
    pub media: MediaOptions,
}

/// Read-only view of a session, published by its actor on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub mode: NegotiationMode,
    pub purpose: Purpose,
    pub state: NegotiationState,
    pub media: MediaOptions,
    pub silent: bool,
    pub reconnect_attempts: u32,
    pub pending_local_candidates: usize,
    pub handshake_id: Uuid,
    pub revision: u32,
}

impl SessionSnapshot {
    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }
}

/// State owned exclusively by one session actor.
pub(crate) struct PeerSession {
    pub peer_id: PeerId,
    pub role: Role,
    pub mode: NegotiationMode,
    pub purpose: Purpose,
    pub state: NegotiationState,
    pub media: MediaOptions,
    pub silent: bool,
    pub handshake_id: Uuid,
    pub revision: u32,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub channel: Option<Arc<dyn DataChannel>>,
    pub transport_connected: bool,
    pub remote_description_set: bool,
    pub pending_local_candidates: Vec<CandidateHint>,
    pub pending_remote_candidates: Vec<CandidateHint>,
    pub gathering_complete: bool,
    pub reconnect: ReconnectScheduler,
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        role: Role,
        mode: NegotiationMode,
        purpose: Purpose,
        options: OpenOptions,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            reconnect: ReconnectScheduler::new(peer_id.clone(), policy),
            peer_id,
            role,
            mode,
            purpose,
            state: NegotiationState::New,
            media: options.media,
            silent: options.silent,
            handshake_id: Uuid::new_v4(),
            revision: 0,
            transport: None,
            channel: None,
            transport_connected: false,
            remote_description_set: false,
            pending_local_candidates: Vec::new(),
            pending_remote_candidates: Vec::new(),
            gathering_complete: false,
        }
    }

    pub fn transition(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        debug!(
            target = "peer_mesh::session",
            peer = %self.peer_id,
            from = ?self.state,
            to = ?next,
            "session state transition"
        );
        self.state = next;
    }

    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// Connected transport, plus an open message channel for Data sessions.
    pub fn connection_ready(&self) -> bool {
        self.transport_connected && (self.purpose == Purpose::Media || self.channel_open())
    }

    /// Drops everything tied to the current transport instance. The message
    /// channel is kept unless `drop_channel` is set.
    pub fn reset_handshake(&mut self, drop_channel: bool) {
        self.transport = None;
        if drop_channel {
            self.channel = None;
        }
        self.transport_connected = false;
        self.remote_description_set = false;
        self.gathering_complete = false;
        self.pending_local_candidates.clear();
        self.pending_remote_candidates.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer_id: self.peer_id.clone(),
            role: self.role,
            mode: self.mode,
            purpose: self.purpose,
            state: self.state,
            media: self.media,
            silent: self.silent,
            reconnect_attempts: self.reconnect.attempts(),
            pending_local_candidates: self.pending_local_candidates.len(),
            handshake_id: self.handshake_id,
            revision: self.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_and_terminal_states() {
        assert!(NegotiationState::OfferCreated.is_in_flight());
        assert!(NegotiationState::Reconnecting.is_in_flight());
        assert!(!NegotiationState::Established.is_in_flight());
        assert!(!NegotiationState::Disconnected.is_terminal());
        assert!(NegotiationState::Failed.is_terminal());
    }

    #[test]
    fn media_session_is_ready_without_channel() {
        let mut session = PeerSession::new(
            PeerId::from("p1"),
            Role::Caller,
            NegotiationMode::Automatic,
            Purpose::Media,
            OpenOptions::default(),
            ReconnectPolicy::default(),
        );
        assert!(!session.connection_ready());
        session.transport_connected = true;
        assert!(session.connection_ready());

        session.purpose = Purpose::Data;
        assert!(!session.connection_ready());
    }
}
