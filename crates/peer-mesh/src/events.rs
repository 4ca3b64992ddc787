use crate::session::PeerId;

/// Lifecycle notifications published by the registry. `silent` marks
/// background sessions whose transitions should not reach the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established { peer: PeerId, silent: bool },
    Disconnected { peer: PeerId, silent: bool },
    Failed { peer: PeerId, silent: bool, reason: String },
    Closed { peer: PeerId, silent: bool },
}

impl SessionEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            SessionEvent::Established { peer, .. }
            | SessionEvent::Disconnected { peer, .. }
            | SessionEvent::Failed { peer, .. }
            | SessionEvent::Closed { peer, .. } => peer,
        }
    }

    pub fn is_silent(&self) -> bool {
        match self {
            SessionEvent::Established { silent, .. }
            | SessionEvent::Disconnected { silent, .. }
            | SessionEvent::Failed { silent, .. }
            | SessionEvent::Closed { silent, .. } => *silent,
        }
    }
}

/// What a session actor reports to the registry's supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleKind {
    Established,
    Disconnected,
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct LifecycleEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub silent: bool,
    pub kind: LifecycleKind,
}
