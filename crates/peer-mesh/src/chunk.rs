use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::millis;
use crate::session::PeerId;

pub const FRAGMENT_VERSION: u8 = 0xC7;
const FLAG_METADATA: u8 = 0x01;
const HEADER_LEN: usize = 1 + 1 + 16 + 4 + 4;
const METADATA_LEN_PREFIX: usize = 2;
pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_INFLIGHT: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Upper bound on payload bytes carried by one fragment.
    pub max_fragment_bytes: usize,
    /// Upper bound on a reassembled message.
    pub max_message_bytes: usize,
    /// Partial transfers kept per session before the oldest is evicted.
    pub max_inflight: usize,
    /// Idle time after which a partial transfer that stopped receiving
    /// fragments is dropped.
    #[serde(with = "millis")]
    pub gc_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
        }
    }
}

impl ChunkConfig {
    pub fn fragment_capacity(&self) -> usize {
        self.max_fragment_bytes.max(1)
    }

    pub fn max_fragments(&self) -> usize {
        self.max_message_bytes.div_ceil(self.fragment_capacity()).max(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("fragment malformed: {0}")]
    Malformed(&'static str),
    #[error("fragment metadata invalid: {0}")]
    Metadata(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u128);

impl TransferId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u128())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Descriptor travelling on fragment 0 of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub transfer_id: TransferId,
    pub index: u32,
    pub total: u32,
    pub metadata: Option<TransferMetadata>,
    pub payload: Bytes,
}

/// Splits `payload` into index-tagged fragments of at most
/// `max_fragment_bytes` each. A payload that fits yields a single fragment
/// with `total == 1`. Metadata is attached to index 0 only.
pub fn split(
    payload: &Bytes,
    max_fragment_bytes: usize,
    transfer_id: TransferId,
    metadata: Option<TransferMetadata>,
) -> Result<Vec<Fragment>, ChunkError> {
    let capacity = max_fragment_bytes.max(1);
    let count = payload.len().div_ceil(capacity).max(1);
    let total =
        u32::try_from(count).map_err(|_| ChunkError::MessageTooLarge(payload.len()))?;

    let mut metadata = metadata;
    let mut fragments = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * capacity;
        let end = (start + capacity).min(payload.len());
        fragments.push(Fragment {
            transfer_id,
            index: index as u32,
            total,
            metadata: if index == 0 { metadata.take() } else { None },
            payload: payload.slice(start..end),
        });
    }
    Ok(fragments)
}

pub fn encode_fragment(fragment: &Fragment) -> Result<Bytes, ChunkError> {
    let metadata = match &fragment.metadata {
        Some(meta) => {
            let encoded =
                serde_json::to_vec(meta).map_err(|err| ChunkError::Metadata(err.to_string()))?;
            if encoded.len() > u16::MAX as usize {
                return Err(ChunkError::Metadata("metadata exceeds 64 KiB".into()));
            }
            Some(encoded)
        }
        None => None,
    };
    let meta_len = metadata
        .as_ref()
        .map(|m| METADATA_LEN_PREFIX + m.len())
        .unwrap_or(0);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + meta_len + fragment.payload.len());
    buf.put_u8(FRAGMENT_VERSION);
    buf.put_u8(if metadata.is_some() { FLAG_METADATA } else { 0 });
    buf.put_u128(fragment.transfer_id.0);
    buf.put_u32(fragment.index);
    buf.put_u32(fragment.total);
    if let Some(meta) = metadata {
        buf.put_u16(meta.len() as u16);
        buf.put_slice(&meta);
    }
    buf.put_slice(&fragment.payload);
    Ok(buf.freeze())
}

/// Returns `Ok(None)` when `bytes` is not a fragment at all, so callers can
/// treat it as a plain unfragmented message.
pub fn decode_fragment(bytes: &Bytes) -> Result<Option<Fragment>, ChunkError> {
    if bytes.first().copied() != Some(FRAGMENT_VERSION) {
        return Ok(None);
    }
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("fragment shorter than header"));
    }
    let flags = bytes[1];
    let transfer_id = TransferId(u128::from_be_bytes(read_array(&bytes[2..18])));
    let index = u32::from_be_bytes(read_array(&bytes[18..22]));
    let total = u32::from_be_bytes(read_array(&bytes[22..26]));
    if total == 0 {
        return Err(ChunkError::Malformed("fragment total cannot be zero"));
    }
    if index >= total {
        return Err(ChunkError::Malformed("fragment index exceeds total"));
    }

    let mut offset = HEADER_LEN;
    let metadata = if flags & FLAG_METADATA != 0 {
        if bytes.len() < offset + METADATA_LEN_PREFIX {
            return Err(ChunkError::Malformed("metadata length missing"));
        }
        let len = u16::from_be_bytes(read_array(&bytes[offset..offset + 2])) as usize;
        offset += METADATA_LEN_PREFIX;
        if bytes.len() < offset + len {
            return Err(ChunkError::Malformed("metadata truncated"));
        }
        let meta = serde_json::from_slice::<TransferMetadata>(&bytes[offset..offset + len])
            .map_err(|err| ChunkError::Metadata(err.to_string()))?;
        offset += len;
        Some(meta)
    } else {
        None
    };

    Ok(Some(Fragment {
        transfer_id,
        index,
        total,
        metadata,
        payload: bytes.slice(offset..),
    }))
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub transfer_id: TransferId,
    pub payload: Bytes,
    pub metadata: Option<TransferMetadata>,
}

#[derive(Debug)]
struct PartialTransfer {
    last_progress: Instant,
    total: u32,
    received: u32,
    received_bytes: usize,
    slots: Vec<Option<Bytes>>,
    metadata: Option<TransferMetadata>,
}

impl PartialTransfer {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            last_progress: now,
            total,
            received: 0,
            received_bytes: 0,
            slots: vec![None; total as usize],
            metadata: None,
        }
    }
}

/// In-flight transfers keyed by `(peer, transfer)`.
#[derive(Debug)]
pub struct TransferTable {
    partials: HashMap<(PeerId, TransferId), PartialTransfer>,
    config: ChunkConfig,
}

impl TransferTable {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn contains(&self, peer: &PeerId, transfer_id: TransferId) -> bool {
        self.partials.contains_key(&(peer.clone(), transfer_id))
    }

    /// Drops every partial transfer from `peer`, returning how many were
    /// discarded. Nothing partial is ever delivered.
    pub fn purge_peer(&mut self, peer: &PeerId) -> usize {
        let before = self.partials.len();
        self.partials.retain(|(owner, _), _| owner != peer);
        before - self.partials.len()
    }

    /// Drops partial transfers that have not received a new fragment within
    /// `gc_timeout`. Transfers still making progress are kept however long
    /// they take.
    pub fn gc(&mut self, now: Instant) -> Vec<TransferId> {
        let timeout = self.config.gc_timeout;
        let mut dropped = Vec::new();
        self.partials.retain(|(_, transfer_id), partial| {
            let expired = now.saturating_duration_since(partial.last_progress) > timeout;
            if expired {
                dropped.push(*transfer_id);
            }
            !expired
        });
        dropped
    }

    fn evict_oldest(&mut self) -> Option<TransferId> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.last_progress)
            .map(|(key, _)| key.clone())?;
        self.partials.remove(&oldest);
        Some(oldest.1)
    }
}

/// Places `fragment` into `table`, returning the full payload once every
/// slot of its transfer is filled.
pub fn reassemble(
    peer: &PeerId,
    fragment: Fragment,
    table: &mut TransferTable,
    now: Instant,
) -> Result<Option<Reassembled>, ChunkError> {
    if fragment.total == 0 || fragment.index >= fragment.total {
        return Err(ChunkError::Malformed("fragment index out of range"));
    }
    if fragment.total as usize > table.config.max_fragments() {
        return Err(ChunkError::MessageTooLarge(
            fragment.total as usize * table.config.fragment_capacity(),
        ));
    }

    if fragment.total == 1 {
        if fragment.payload.len() > table.config.max_message_bytes {
            return Err(ChunkError::MessageTooLarge(fragment.payload.len()));
        }
        return Ok(Some(Reassembled {
            transfer_id: fragment.transfer_id,
            payload: fragment.payload,
            metadata: fragment.metadata,
        }));
    }

    let key = (peer.clone(), fragment.transfer_id);
    if !table.partials.contains_key(&key) && table.partials.len() >= table.config.max_inflight {
        if let Some(evicted) = table.evict_oldest() {
            warn!(
                target = "peer_mesh::chunk",
                peer = %peer,
                transfer_id = %evicted,
                "transfer table full; evicted oldest partial transfer"
            );
        }
    }

    let max_message_bytes = table.config.max_message_bytes;
    let entry = table
        .partials
        .entry(key.clone())
        .or_insert_with(|| PartialTransfer::new(fragment.total, now));

    if entry.total != fragment.total {
        table.partials.remove(&key);
        return Err(ChunkError::Malformed("fragment total changed for transfer"));
    }

    let slot = fragment.index as usize;
    if entry.slots[slot].is_some() {
        debug!(
            target = "peer_mesh::chunk",
            peer = %peer,
            transfer_id = %fragment.transfer_id,
            index = fragment.index,
            "duplicate fragment ignored"
        );
        return Ok(None);
    }
    if fragment.metadata.is_some() {
        entry.metadata = fragment.metadata;
    }
    entry.last_progress = now;
    entry.received_bytes = entry.received_bytes.saturating_add(fragment.payload.len());
    entry.received += 1;
    entry.slots[slot] = Some(fragment.payload);

    if entry.received_bytes > max_message_bytes {
        let size = entry.received_bytes;
        table.partials.remove(&key);
        return Err(ChunkError::MessageTooLarge(size));
    }
    if entry.received < entry.total {
        return Ok(None);
    }

    let Some(complete) = table.partials.remove(&key) else {
        return Ok(None);
    };
    let mut combined = BytesMut::with_capacity(complete.received_bytes);
    for part in complete.slots {
        match part {
            Some(bytes) => combined.put_slice(&bytes),
            None => return Err(ChunkError::Malformed("missing fragment during reassembly")),
        }
    }
    Ok(Some(Reassembled {
        transfer_id: fragment.transfer_id,
        payload: combined.freeze(),
        metadata: complete.metadata,
    }))
}
