//! The peer-session capability the negotiation layer drives. Everything the
//! session needs from a WebRTC stack goes through these traits; events flow
//! back through the [`PeerEventSender`] handed over at construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::RtcConfig;
use crate::error::RtcError;
use crate::types::{
    ConnectionState, DataChannelState, DataMessage, IceCandidate, IceServer, MediaKind,
    SessionDescription,
};

mod native;

pub use native::WebRtcPeerFactory;

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub ice_servers: Vec<IceServer>,
    pub relay_only: bool,
    pub audio: bool,
    pub video: bool,
    pub data_channel_label: String,
}

impl From<&RtcConfig> for PeerSessionConfig {
    fn from(config: &RtcConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            relay_only: config.relay_only,
            audio: config.audio_enabled,
            video: config.video_enabled,
            data_channel_label: config.data_channel_label.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate.
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    DataChannelOpen,
    DataMessage(DataMessage),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), RtcError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    /// The channel messages go out on; a remote-opened channel wins over the
    /// local one once it exists.
    fn data_channel(&self) -> Option<Arc<dyn DataChannel>>;
    fn media_sink(&self) -> Option<Arc<dyn MediaSink>>;
    async fn close(&self) -> Result<(), RtcError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> DataChannelState;
    async fn send_text(&self, text: String) -> Result<(), RtcError>;
    async fn send_binary(&self, data: Bytes) -> Result<(), RtcError>;
    async fn close(&self) -> Result<(), RtcError>;
}

/// Accepts encoded media samples from a capture pipeline.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn write_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), RtcError>;
}

#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, RtcError>;
}
