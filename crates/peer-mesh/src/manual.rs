//! Out-of-band signaling: negotiation payloads are handed to the user as
//! opaque text blobs to copy between devices. Sessions in manual mode wait
//! for candidate gathering to finish before sending, so each blob carries a
//! full description plus every candidate.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SignalingError;
use crate::signaling::{SignalEnvelope, SignalingPort};

pub fn encode_blob(envelope: &SignalEnvelope) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(envelope)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_blob(blob: &str) -> Result<SignalEnvelope, SignalingError> {
    let compact: String = blob.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| SignalingError::InvalidBlob(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| SignalingError::InvalidBlob(err.to_string()))
}

#[derive(Clone, Debug)]
pub struct ManualSignaling {
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving end of [`ManualSignaling`]; each item is a blob to display.
#[derive(Debug)]
pub struct ManualBlobs {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ManualSignaling {
    pub fn new() -> (Self, ManualBlobs) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ManualBlobs { rx })
    }
}

impl ManualBlobs {
    pub async fn next_blob(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_next_blob(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl SignalingPort for ManualSignaling {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let blob = encode_blob(&envelope)?;
        debug!(
            target = "peer_mesh::manual",
            peer = %envelope.to_peer,
            kind = envelope.signal.kind(),
            blob_len = blob.len(),
            "manual signaling blob ready"
        );
        self.tx.send(blob).map_err(|_| SignalingError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MediaOptions, PeerId, Purpose};
    use crate::signaling::{CandidateHint, DescriptionPayload, Signal};
    use uuid::Uuid;

    fn offer() -> SignalEnvelope {
        SignalEnvelope::new(
            PeerId::from("alice"),
            PeerId::from("bob"),
            Signal::Offer(DescriptionPayload {
                sdp: "v=0\r\n".into(),
                purpose: Purpose::Data,
                media: MediaOptions::default(),
                candidates: vec![CandidateHint::new("c1"), CandidateHint::new("c2")],
                handshake_id: Uuid::new_v4(),
                revision: 0,
                silent: false,
            }),
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn blob_carries_offer_with_all_candidates() {
        let (port, mut blobs) = ManualSignaling::new();
        let envelope = offer();
        port.send(envelope.clone()).await.unwrap();
        let blob = blobs.next_blob().await.expect("blob");

        // pasted text often picks up line wrapping
        let wrapped = blob
            .as_bytes()
            .chunks(40)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let decoded = decode_blob(&wrapped).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_blob_is_rejected() {
        assert!(matches!(
            decode_blob("not base64 at all!"),
            Err(SignalingError::InvalidBlob(_))
        ));
        let not_json = STANDARD.encode(b"hello");
        assert!(matches!(
            decode_blob(&not_json),
            Err(SignalingError::InvalidBlob(_))
        ));
    }
}
