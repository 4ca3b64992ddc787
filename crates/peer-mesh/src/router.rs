use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::chunk::{self, ChunkConfig, TransferId, TransferTable};
use crate::config::SendConfig;
use crate::error::SendError;
use crate::message::{AppMessage, ChatMessage, Classified, Retraction};
use crate::primitive::DataChannel;
use crate::session::PeerId;

/// Typed callbacks for classified inbound messages. Every method defaults to
/// a no-op so collaborators implement only what they consume.
pub trait MessageHandler: Send + Sync {
    fn on_chat(&self, _peer: &PeerId, _message: ChatMessage) {}
    fn on_group_chat(&self, _peer: &PeerId, _message: ChatMessage) {}
    fn on_group_control(&self, _peer: &PeerId, _message: crate::message::GroupControl) {}
    fn on_call_control(&self, _peer: &PeerId, _message: crate::message::CallControl) {}
    fn on_retract_request(&self, _peer: &PeerId, _message: Retraction) {}
    fn on_retract_confirm(&self, _peer: &PeerId, _message: Retraction) {}
    fn on_file(&self, _peer: &PeerId, _message: crate::message::FileTransfer) {}
}

/// Handler that drops everything.
pub struct NoopHandler;

impl MessageHandler for NoopHandler {}

/// Inbound half of the router for one session. Owned by the session actor,
/// which makes it the single consumer of that peer's bytes.
pub struct InboundRouter {
    peer: PeerId,
    local: PeerId,
    table: TransferTable,
    handler: Arc<dyn MessageHandler>,
}

impl InboundRouter {
    pub fn new(
        peer: PeerId,
        local: PeerId,
        config: ChunkConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            peer,
            local,
            table: TransferTable::new(config),
            handler,
        }
    }

    pub fn pending_transfers(&self) -> usize {
        self.table.len()
    }

    /// Feeds one inbound unit through fragment parsing, reassembly,
    /// classification and dispatch. Returns a reply the caller should send
    /// back on the channel, if any.
    pub fn accept(&mut self, bytes: Bytes, now: Instant) -> Option<AppMessage> {
        let payload = match chunk::decode_fragment(&bytes) {
            Ok(Some(fragment)) => {
                match chunk::reassemble(&self.peer, fragment, &mut self.table, now) {
                    Ok(Some(done)) => {
                        trace!(
                            target = "peer_mesh::router",
                            peer = %self.peer,
                            transfer_id = %done.transfer_id,
                            bytes = done.payload.len(),
                            "transfer reassembled"
                        );
                        done.payload
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(
                            target = "peer_mesh::router",
                            peer = %self.peer,
                            error = %err,
                            "dropping fragment"
                        );
                        return None;
                    }
                }
            }
            Ok(None) => bytes,
            Err(err) => {
                warn!(
                    target = "peer_mesh::router",
                    peer = %self.peer,
                    error = %err,
                    "dropping malformed fragment"
                );
                return None;
            }
        };
        self.dispatch(payload)
    }

    fn dispatch(&self, payload: Bytes) -> Option<AppMessage> {
        let value = match serde_json::from_slice::<serde_json::Value>(&payload) {
            Ok(value) => value,
            Err(_) => match std::str::from_utf8(&payload) {
                Ok(text) => {
                    debug!(
                        target = "peer_mesh::router",
                        peer = %self.peer,
                        "non-json payload delivered as text chat"
                    );
                    self.handler
                        .on_chat(&self.peer, ChatMessage::text(&self.peer, text));
                    return None;
                }
                Err(_) => {
                    warn!(
                        target = "peer_mesh::router",
                        peer = %self.peer,
                        bytes = payload.len(),
                        "dropping undecodable binary payload"
                    );
                    return None;
                }
            },
        };

        let message = match AppMessage::classify(value, &self.peer) {
            Ok(Classified::Message(message)) => message,
            Ok(Classified::Unknown(kind)) => {
                warn!(
                    target = "peer_mesh::router",
                    peer = %self.peer,
                    kind = kind.as_deref().unwrap_or("<missing>"),
                    "unknown message type dropped"
                );
                return None;
            }
            Err(err) => {
                warn!(
                    target = "peer_mesh::router",
                    peer = %self.peer,
                    error = %err,
                    "malformed message dropped"
                );
                return None;
            }
        };

        match message {
            AppMessage::Chat(chat) if chat.group_id.is_some() => {
                self.handler.on_group_chat(&self.peer, chat)
            }
            AppMessage::Chat(chat) => self.handler.on_chat(&self.peer, chat),
            AppMessage::GroupControl(group) => self.handler.on_group_control(&self.peer, group),
            AppMessage::CallControl(call) => self.handler.on_call_control(&self.peer, call),
            AppMessage::RetractRequest(request) => {
                let confirm = Retraction {
                    original_message_id: request.original_message_id.clone(),
                    sender_id: self.local.to_string(),
                    sender_name: None,
                };
                self.handler.on_retract_request(&self.peer, request);
                return Some(AppMessage::RetractConfirm(confirm));
            }
            AppMessage::RetractConfirm(confirm) => {
                self.handler.on_retract_confirm(&self.peer, confirm)
            }
            AppMessage::File(file) => self.handler.on_file(&self.peer, file),
        }
        None
    }

    pub fn gc(&mut self, now: Instant) {
        for transfer_id in self.table.gc(now) {
            debug!(
                target = "peer_mesh::router",
                peer = %self.peer,
                %transfer_id,
                "stale partial transfer discarded"
            );
        }
    }

    /// Discards every partial transfer; nothing incomplete is delivered.
    pub fn purge(&mut self) -> usize {
        self.table.purge_peer(&self.peer)
    }
}

/// Serializes `message`, splits it against the fragment limit and writes
/// every fragment, waiting out send-buffer pressure between writes.
pub async fn send_message(
    channel: &Arc<dyn DataChannel>,
    message: &AppMessage,
    chunk_config: &ChunkConfig,
    send_config: &SendConfig,
) -> Result<TransferId, SendError> {
    let encoded = Bytes::from(message.to_bytes()?);
    if encoded.len() > chunk_config.max_message_bytes {
        return Err(chunk::ChunkError::MessageTooLarge(encoded.len()).into());
    }
    let metadata = message.transfer_metadata(encoded.len());
    send_payload(channel, encoded, Some(metadata), chunk_config, send_config).await
}

pub async fn send_payload(
    channel: &Arc<dyn DataChannel>,
    payload: Bytes,
    metadata: Option<chunk::TransferMetadata>,
    chunk_config: &ChunkConfig,
    send_config: &SendConfig,
) -> Result<TransferId, SendError> {
    if !channel.is_open() {
        return Err(SendError::NotOpen);
    }
    let transfer_id = TransferId::random();
    let fragments = chunk::split(
        &payload,
        chunk_config.fragment_capacity(),
        transfer_id,
        metadata,
    )?;
    let total = fragments.len();
    for fragment in fragments {
        wait_for_capacity(channel, send_config).await?;
        let encoded = chunk::encode_fragment(&fragment)?;
        channel.send(encoded).await.map_err(|err| {
            if channel.is_open() {
                SendError::Primitive(err)
            } else {
                SendError::NotOpen
            }
        })?;
    }
    trace!(
        target = "peer_mesh::router",
        %transfer_id,
        fragments = total,
        bytes = payload.len(),
        "message written"
    );
    Ok(transfer_id)
}

async fn wait_for_capacity(
    channel: &Arc<dyn DataChannel>,
    config: &SendConfig,
) -> Result<(), SendError> {
    let deadline = tokio::time::Instant::now() + config.saturation_wait;
    loop {
        if !channel.is_open() {
            return Err(SendError::NotOpen);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= config.high_water_bytes {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SendError::Saturated { buffered });
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FileTransfer;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::{seq::SliceRandom, thread_rng};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        chats: Mutex<Vec<ChatMessage>>,
        group_chats: AtomicUsize,
        files: Mutex<Vec<FileTransfer>>,
        retractions: AtomicUsize,
    }

    impl MessageHandler for Recorder {
        fn on_chat(&self, _peer: &PeerId, message: ChatMessage) {
            self.chats.lock().push(message);
        }
        fn on_group_chat(&self, _peer: &PeerId, _message: ChatMessage) {
            self.group_chats.fetch_add(1, Ordering::SeqCst);
        }
        fn on_retract_request(&self, _peer: &PeerId, _message: Retraction) {
            self.retractions.fetch_add(1, Ordering::SeqCst);
        }
        fn on_file(&self, _peer: &PeerId, message: FileTransfer) {
            self.files.lock().push(message);
        }
    }

    struct CaptureChannel {
        open: AtomicBool,
        buffered: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
    }

    impl CaptureChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                buffered: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DataChannel for CaptureChannel {
        fn label(&self) -> &str {
            "capture"
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
        async fn send(&self, data: Bytes) -> Result<(), crate::error::PrimitiveError> {
            self.sent.lock().push(data);
            Ok(())
        }
    }

    fn chunk_config(fragment: usize) -> ChunkConfig {
        ChunkConfig {
            max_fragment_bytes: fragment,
            ..ChunkConfig::default()
        }
    }

    fn inbound(handler: Arc<Recorder>) -> InboundRouter {
        InboundRouter::new(
            PeerId::from("bob"),
            PeerId::from("alice"),
            chunk_config(1024),
            handler,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn ten_kib_chat_reassembles_from_shuffled_fragments() {
        let capture = CaptureChannel::new();
        let channel: Arc<dyn DataChannel> = capture.clone();
        let content = "x".repeat(10 * 1024 - 200);
        let chat = ChatMessage::text(&PeerId::from("bob"), content.clone());
        let message = AppMessage::Chat(chat);
        let encoded_len = message.to_bytes().unwrap().len();
        assert!(encoded_len > 9 * 1024 && encoded_len <= 10 * 1024);

        let transfer_id = send_message(&channel, &message, &chunk_config(1024), &SendConfig::default())
            .await
            .unwrap();
        let mut sent = capture.sent.lock().clone();
        assert_eq!(sent.len(), 10);
        for (index, bytes) in sent.iter().enumerate() {
            let fragment = chunk::decode_fragment(bytes).unwrap().unwrap();
            assert_eq!(fragment.transfer_id, transfer_id);
            assert_eq!(fragment.total, 10);
            assert_eq!(fragment.index as usize, index);
        }

        sent.shuffle(&mut thread_rng());
        let recorder = Arc::new(Recorder::default());
        let mut router = inbound(recorder.clone());
        for bytes in sent {
            assert!(router.accept(bytes, Instant::now()).is_none());
        }
        let chats = recorder.chats.lock();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].content, content);
        assert_eq!(router.pending_transfers(), 0);
    }

    #[test]
    fn plain_text_and_group_chat_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let mut router = inbound(recorder.clone());
        router.accept(Bytes::from_static(b"hello there"), Instant::now());
        router.accept(
            Bytes::from_static(br#"{"type":"text","id":"1","content":"hi","groupId":"g"}"#),
            Instant::now(),
        );
        router.accept(Bytes::from_static(br#"{"type":"mystery"}"#), Instant::now());
        router.accept(Bytes::from_static(&[0xff, 0xfe, 0x00]), Instant::now());

        let chats = recorder.chats.lock();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].content, "hello there");
        assert_eq!(chats[0].sender_id, "bob");
        assert_eq!(recorder.group_chats.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retraction_request_yields_confirmation_from_local_peer() {
        let recorder = Arc::new(Recorder::default());
        let mut router = inbound(recorder.clone());
        let reply = router.accept(
            Bytes::from_static(br#"{"type":"retract-message-request","originalMessageId":"m1"}"#),
            Instant::now(),
        );
        assert_eq!(recorder.retractions.load(Ordering::SeqCst), 1);
        match reply {
            Some(AppMessage::RetractConfirm(confirm)) => {
                assert_eq!(confirm.original_message_id, "m1");
                assert_eq!(confirm.sender_id, "alice");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn file_metadata_rides_first_fragment_and_partial_is_purged() {
        let capture = CaptureChannel::new();
        let channel: Arc<dyn DataChannel> = capture.clone();
        let data = vec![42u8; 6000];
        let file = FileTransfer::from_bytes(&PeerId::from("bob"), "blob.bin", "application/x-test", &data);
        send_message(&channel, &AppMessage::File(file), &chunk_config(1024), &SendConfig::default())
            .await
            .unwrap();
        let sent = capture.sent.lock().clone();
        let first = chunk::decode_fragment(&sent[0]).unwrap().unwrap();
        let meta = first.metadata.expect("metadata on index 0");
        assert_eq!(meta.name.as_deref(), Some("blob.bin"));
        assert_eq!(meta.total_size, 6000);

        let recorder = Arc::new(Recorder::default());
        let mut router = inbound(recorder.clone());
        for bytes in sent.iter().skip(1) {
            router.accept(bytes.clone(), Instant::now());
        }
        assert!(recorder.files.lock().is_empty());
        assert_eq!(router.purge(), 1);

        for bytes in sent {
            router.accept(bytes, Instant::now());
        }
        let files = recorder.files.lock();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].decode_data().unwrap(), data);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn closed_and_saturated_channels_fail_sends() {
        let capture = CaptureChannel::new();
        let channel: Arc<dyn DataChannel> = capture.clone();
        let message = AppMessage::Chat(ChatMessage::text(&PeerId::from("a"), "hi"));
        let send = SendConfig {
            high_water_bytes: 1024,
            poll_interval: Duration::from_millis(50),
            saturation_wait: Duration::from_millis(500),
        };

        capture.buffered.store(4096, Ordering::SeqCst);
        let started = tokio::time::Instant::now();
        let err = send_message(&channel, &message, &ChunkConfig::default(), &send)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Saturated { buffered: 4096 }));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(capture.sent.lock().is_empty());

        capture.buffered.store(0, Ordering::SeqCst);
        capture.open.store(false, Ordering::SeqCst);
        let err = send_message(&channel, &message, &ChunkConfig::default(), &send)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotOpen));
    }
}
