use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::{
    ConnectionState, DataChannel, PeerTransport, SdpKind, TransportEvent, TransportEvents,
    TransportPrimitive, TransportSpec,
};
use crate::error::PrimitiveError;
use crate::session::{MediaOptions, Purpose, Role};
use crate::signaling::CandidateHint;

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Production primitive backed by webrtc-rs.
pub struct RtcPrimitive {
    api: API,
}

impl RtcPrimitive {
    pub fn new() -> Result<Self, PrimitiveError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        Ok(Self {
            api: build_api(setting)?,
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, PrimitiveError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl TransportPrimitive for RtcPrimitive {
    async fn create(
        &self,
        spec: &TransportSpec,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), PrimitiveError> {
        let config = RTCConfiguration {
            ice_servers: spec
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = spec.remote.to_string();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => TransportEvent::LocalCandidate(CandidateHint {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(err) => {
                            warn!(
                                target = "peer_mesh::rtc",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => TransportEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let tx = events_tx.clone();
        let log_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let peer = log_peer.clone();
            Box::pin(async move {
                debug!(target = "peer_mesh::rtc", %peer, ?state, "peer connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                let _ = tx.send(TransportEvent::StateChanged(mapped));
            })
        }));

        if spec.purpose == Purpose::Data {
            match spec.role {
                Role::Caller => {
                    let dc_init = RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    };
                    let dc = pc
                        .create_data_channel(&spec.channel_label, Some(dc_init))
                        .await
                        .map_err(to_setup_error)?;
                    wire_data_channel(&dc, events_tx.clone());
                }
                Role::Callee => {
                    let tx = events_tx.clone();
                    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            trace!(
                                target = "peer_mesh::rtc",
                                label = dc.label(),
                                "remote data channel announced"
                            );
                            wire_data_channel(&dc, tx);
                        })
                    }));
                }
            }
        }

        let transport = RtcTransport { pc };
        if spec.purpose == Purpose::Media && spec.role == Role::Caller {
            transport.apply_media(spec.media).await?;
        }
        Ok((Arc::new(transport), events_rx))
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<TransportEvent>) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                debug!(target = "peer_mesh::rtc", label = dc.label(), "data channel opened");
                let channel = RtcDataChannel {
                    label: dc.label().to_string(),
                    dc,
                };
                let _ = tx.send(TransportEvent::ChannelOpened(Arc::new(channel)));
            }
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelMessage(msg.data));
        })
    }));

    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            trace!(target = "peer_mesh::rtc", "data channel closed");
            let _ = tx.send(TransportEvent::ChannelClosed);
        })
    }));
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String, PrimitiveError> {
        let offer = self.pc.create_offer(None).await.map_err(to_description_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_description_error)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PrimitiveError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_description_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_description_error)?;
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), PrimitiveError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(to_description_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_description_error)
    }

    async fn add_remote_candidate(&self, candidate: CandidateHint) -> Result<(), PrimitiveError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PrimitiveError::Candidate(err.to_string()))
    }

    /// Disabled kinds keep their transceiver as recvonly so the m-line and
    /// the remote's track survive; re-enabling flips it back to sendrecv.
    async fn apply_media(&self, media: MediaOptions) -> Result<(), PrimitiveError> {
        let transceivers = self.pc.get_transceivers().await;
        let wanted = [
            (RTPCodecType::Audio, media.audio),
            (RTPCodecType::Video, media.video || media.screen_share),
        ];
        for (kind, send) in wanted {
            match transceivers.iter().find(|transceiver| transceiver.kind() == kind) {
                Some(transceiver) => {
                    let direction = if send {
                        RTCRtpTransceiverDirection::Sendrecv
                    } else {
                        RTCRtpTransceiverDirection::Recvonly
                    };
                    if transceiver.direction() != direction {
                        debug!(
                            target = "peer_mesh::rtc",
                            %kind,
                            %direction,
                            "transceiver direction changed"
                        );
                        transceiver.set_direction(direction).await;
                    }
                }
                None if send => {
                    self.pc
                        .add_transceiver_from_kind(kind, None)
                        .await
                        .map_err(to_setup_error)?;
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "peer_mesh::rtc", error = %err, "peer connection close failed");
        }
    }
}

struct RtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, data: Bytes) -> Result<(), PrimitiveError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| PrimitiveError::Channel(err.to_string()))
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PrimitiveError {
    PrimitiveError::Setup(err.to_string())
}

fn to_description_error<E: std::fmt::Display>(err: E) -> PrimitiveError {
    PrimitiveError::Description(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PeerId;

    fn spec(purpose: Purpose) -> TransportSpec {
        spec_with_media(purpose, MediaOptions::audio_only())
    }

    fn spec_with_media(purpose: Purpose, media: MediaOptions) -> TransportSpec {
        TransportSpec {
            local: PeerId::from("local"),
            remote: PeerId::from("remote"),
            role: Role::Caller,
            purpose,
            media,
            channel_label: "peer-mesh-data".into(),
            ice_servers: Vec::new(),
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn caller_offer_describes_channel_or_tracks() {
        let primitive = RtcPrimitive::new().expect("build api");

        let (data, _events) = primitive.create(&spec(Purpose::Data)).await.expect("data");
        let offer = data.create_offer().await.expect("offer");
        assert!(offer.contains("m=application"));
        data.close().await;

        let (media, _events) = primitive.create(&spec(Purpose::Media)).await.expect("media");
        let offer = media.create_offer().await.expect("offer");
        assert!(offer.contains("m=audio"));
        assert!(!offer.contains("m=video"));
        media.close().await;
    }

    fn section_direction<'a>(sdp: &'a str, kind: &str) -> Option<&'a str> {
        let section = sdp
            .split("m=")
            .skip(1)
            .find(|section| section.starts_with(kind))?;
        section.lines().map(str::trim).find(|line| {
            matches!(
                *line,
                "a=sendrecv" | "a=sendonly" | "a=recvonly" | "a=inactive"
            )
        })
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn dropping_video_stops_sending_without_removing_the_section() {
        let primitive = RtcPrimitive::new().expect("build api");
        let call = MediaOptions {
            audio: true,
            video: true,
            screen_share: false,
        };
        let (media, _events) = primitive
            .create(&spec_with_media(Purpose::Media, call))
            .await
            .expect("media");
        let offer = media.create_offer().await.expect("offer");
        assert_eq!(section_direction(&offer, "video"), Some("a=sendrecv"));

        media
            .apply_media(MediaOptions::audio_only())
            .await
            .expect("audio only");
        let offer = media.create_offer().await.expect("re-offer");
        assert_eq!(section_direction(&offer, "video"), Some("a=recvonly"));
        assert_eq!(section_direction(&offer, "audio"), Some("a=sendrecv"));
        assert_eq!(offer.matches("m=video").count(), 1);

        media.apply_media(call).await.expect("video again");
        let offer = media.create_offer().await.expect("third offer");
        assert_eq!(section_direction(&offer, "video"), Some("a=sendrecv"));
        media.close().await;
    }
}
