//! [`PeerSession`] backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    DataChannel, MediaSink, PeerEvent, PeerEventSender, PeerSession, PeerSessionConfig,
    PeerSessionFactory,
};
use crate::error::{RtcError, peer_error};
use crate::types::{
    ConnectionState, DataChannelState, DataMessage, IceCandidate, IceServer, MediaKind, SdpKind,
    SessionDescription,
};

const VIDEO_TRACK_ID: &str = "video0";
const AUDIO_TRACK_ID: &str = "audio0";

fn build_api() -> Result<API, RtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(peer_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(peer_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(config: &PeerSessionConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
        ice_transport_policy: if config.relay_only {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        },
        ..Default::default()
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::ProvisionalAnswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => return Err(RtcError::NotImplemented("sdp rollback")),
    };
    result.map_err(peer_error)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::ProvisionalAnswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::Internal("session description without a type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

/// Forward open and message callbacks of one data channel into the event sink.
fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: &PeerEventSender, origin: &'static str) {
    let open_events = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let label = label.clone();
        Box::pin(async move {
            debug!(target = "vitals_rtc::peer", %label, origin, "data channel open");
            let _ = events.send(PeerEvent::DataChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            trace!(
                target = "vitals_rtc::peer",
                origin,
                len = msg.data.len(),
                text = msg.is_string,
                "data channel message"
            );
            let message = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => DataMessage::Text(text),
                    Err(err) => {
                        warn!(target = "vitals_rtc::peer", error = %err, "non-utf8 text message");
                        return;
                    }
                }
            } else {
                DataMessage::Binary(msg.data)
            };
            let _ = events.send(PeerEvent::DataMessage(message));
        })
    }));

    dc.on_close(Box::new(move || {
        Box::pin(async move {
            trace!(target = "vitals_rtc::peer", origin, "data channel closed");
        })
    }));
}

/// Drain RTCP for a sender so the interceptors keep working.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

struct RtcDataChannel(Arc<RTCDataChannel>);

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.0.label().to_string()
    }

    fn ready_state(&self) -> DataChannelState {
        match self.0.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                DataChannelState::Connecting
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), RtcError> {
        self.0.send_text(text).await.map(|_| ()).map_err(peer_error)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), RtcError> {
        self.0.send(&data).await.map(|_| ()).map_err(peer_error)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.0.close().await.map_err(peer_error)
    }
}

struct LocalTracks {
    video: Option<Arc<TrackLocalStaticSample>>,
    audio: Option<Arc<TrackLocalStaticSample>>,
}

#[async_trait]
impl MediaSink for LocalTracks {
    async fn write_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), RtcError> {
        let track = match kind {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
        .ok_or_else(|| RtcError::Peer(format!("no local {kind:?} track")))?;
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(peer_error)
    }
}

pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    local_channel: Arc<RTCDataChannel>,
    remote_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    media: Option<Arc<LocalTracks>>,
}

impl WebRtcPeerSession {
    async fn new(config: PeerSessionConfig, events: PeerEventSender) -> Result<Self, RtcError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(&config))
                .await
                .map_err(peer_error)?,
        );
        debug!(
            target = "vitals_rtc::peer",
            relay_only = config.relay_only,
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "vitals_rtc::peer", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index.map(i32::from).unwrap_or(0),
                            sdp_mid: init.sdp_mid,
                        }));
                    }
                    Err(err) => warn!(
                        target = "vitals_rtc::peer",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(target = "vitals_rtc::peer", ?state, "peer connection state changed");
                let _ = events.send(PeerEvent::ConnectionState(map_connection_state(state)));
            })
        }));

        let remote_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let remote_slot = Arc::clone(&remote_channel);
        let remote_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&remote_slot);
            let events = remote_events.clone();
            Box::pin(async move {
                debug!(target = "vitals_rtc::peer", label = dc.label(), "remote data channel announced");
                wire_data_channel(&dc, &events, "remote");
                *slot.lock() = Some(dc);
            })
        }));

        let video = if config.video {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    ..Default::default()
                },
                VIDEO_TRACK_ID.to_owned(),
                VIDEO_TRACK_ID.to_owned(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(peer_error)?;
            spawn_rtcp_drain(sender);
            Some(track)
        } else {
            None
        };
        let audio = if config.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                AUDIO_TRACK_ID.to_owned(),
                AUDIO_TRACK_ID.to_owned(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(peer_error)?;
            spawn_rtcp_drain(sender);
            Some(track)
        } else {
            None
        };
        let media = (video.is_some() || audio.is_some())
            .then(|| Arc::new(LocalTracks { video, audio }));

        let local_channel = pc
            .create_data_channel(
                &config.data_channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(peer_error)?;
        wire_data_channel(&local_channel, &events, "local");

        Ok(Self {
            pc,
            local_channel,
            remote_channel,
            media,
        })
    }
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        from_rtc_description(offer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(peer_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: u16::try_from(candidate.sdp_mline_index).ok(),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(peer_error)
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let channel = self
            .remote_channel
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.local_channel));
        Some(Arc::new(RtcDataChannel(channel)))
    }

    fn media_sink(&self) -> Option<Arc<dyn MediaSink>> {
        self.media
            .as_ref()
            .map(|media| Arc::clone(media) as Arc<dyn MediaSink>)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(peer_error)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerSessionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, RtcError> {
        let session = WebRtcPeerSession::new(config, events).await?;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_only_maps_to_relay_policy() {
        let mut config = PeerSessionConfig {
            ice_servers: vec![IceServer::with_credentials(
                vec!["turn:relay.example.com:443".into()],
                "user",
                "secret",
            )],
            relay_only: true,
            audio: false,
            video: true,
            data_channel_label: "dataChannel".into(),
        };
        let rtc = rtc_configuration(&config);
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(rtc.ice_servers[0].username, "user");
        assert_eq!(rtc.ice_servers[0].credential, "secret");

        config.relay_only = false;
        assert_eq!(
            rtc_configuration(&config).ice_transport_policy,
            RTCIceTransportPolicy::All
        );
    }

    #[test]
    fn peer_states_map_onto_session_states() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn rollback_descriptions_are_rejected() {
        let result = to_rtc_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        });
        assert!(matches!(result, Err(RtcError::NotImplemented(_))));
    }
}
