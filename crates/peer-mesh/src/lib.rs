//! Peer connection orchestration: per-peer sessions negotiated over a
//! pluggable signaling port, with reconnection, renegotiation, message
//! fragmentation and inbound routing on top of a WebRTC-style transport.

pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod manual;
pub mod message;
mod negotiation;
pub mod primitive;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use chunk::{ChunkConfig, ChunkError, TransferId};
pub use config::{IceServer, MeshConfig, SendConfig};
pub use error::{MeshError, NegotiationError, PrimitiveError, SendError, SignalingError};
pub use events::SessionEvent;
pub use manual::{ManualBlobs, ManualSignaling};
pub use message::{AppMessage, ChatKind, ChatMessage, FileTransfer, Retraction};
pub use reconnect::ReconnectPolicy;
pub use registry::{RegistryBuilder, SessionRegistry};
pub use router::{MessageHandler, NoopHandler};
pub use session::{
    MediaOptions, NegotiationMode, NegotiationState, OpenOptions, PeerId, Purpose, Role,
    SessionSnapshot,
};
pub use signaling::{ChannelSignaling, Signal, SignalEnvelope, SignalingPort};
