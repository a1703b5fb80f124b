//! In-memory stand-ins for the signaling server and the WebRTC stack, for
//! tests and for embedding applications that want to exercise their UI flow
//! without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{RtcError, SignalingError};
use crate::peer::{
    DataChannel, MediaSink, PeerEvent, PeerEventSender, PeerSession, PeerSessionConfig,
    PeerSessionFactory,
};
use crate::signaling::{InboundFrame, SignalingConnector, SignalingTransport};
use crate::types::{
    ConnectionState, DataChannelState, DataMessage, IceCandidate, MediaKind, SessionDescription,
};

pub const MOCK_OFFER_SDP: &str = "v=0\r\no=- 4215 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\na=mid:1\r\n";

enum ScriptedFrame {
    Frame(InboundFrame),
    Close,
}

/// Client half of an in-memory signaling connection.
pub struct ScriptedTransport {
    inbound: mpsc::UnboundedReceiver<ScriptedFrame>,
    outbound: mpsc::UnboundedSender<String>,
    reads: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
    closed: bool,
}

/// Server half: queue frames for the client and inspect what it sent.
pub struct ScriptedServer {
    inbound: mpsc::UnboundedSender<ScriptedFrame>,
    outbound: mpsc::UnboundedReceiver<String>,
    reads: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

pub fn scripted_pair() -> (ScriptedTransport, ScriptedServer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let reads = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    (
        ScriptedTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            reads: Arc::clone(&reads),
            disconnects: Arc::clone(&disconnects),
            closed: false,
        },
        ScriptedServer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            reads,
            disconnects,
        },
    )
}

impl ScriptedServer {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self
            .inbound
            .send(ScriptedFrame::Frame(InboundFrame::Text(text.into())));
    }

    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub fn push_binary(&self, data: Vec<u8>) {
        let _ = self
            .inbound
            .send(ScriptedFrame::Frame(InboundFrame::Binary(data)));
    }

    pub fn close(&self) {
        let _ = self.inbound.send(ScriptedFrame::Close);
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Number of `receive_one` calls the client has made.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::Connection("scripted channel closed".into()));
        }
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Connection("scripted server went away".into()))
    }

    async fn receive_one(&mut self) -> Result<InboundFrame, SignalingError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(SignalingError::Connection("scripted channel closed".into()));
        }
        match self.inbound.recv().await {
            Some(ScriptedFrame::Frame(frame)) => Ok(frame),
            Some(ScriptedFrame::Close) | None => {
                self.closed = true;
                Err(SignalingError::Connection("scripted channel closed".into()))
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands out prepared transports in order and records the endpoints asked for.
#[derive(Default)]
pub struct ScriptedConnector {
    transports: Mutex<VecDeque<ScriptedTransport>>,
    opened: Mutex<Vec<Url>>,
}

impl ScriptedConnector {
    pub fn new(transports: Vec<ScriptedTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, transport: ScriptedTransport) {
        self.transports.lock().push_back(transport);
    }

    pub fn opened(&self) -> Vec<Url> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl SignalingConnector for ScriptedConnector {
    async fn open(&self, endpoint: &Url) -> Result<Box<dyn SignalingTransport>, SignalingError> {
        self.opened.lock().push(endpoint.clone());
        let transport = self
            .transports
            .lock()
            .pop_front()
            .ok_or_else(|| SignalingError::Connection("connection refused".into()))?;
        Ok(Box::new(transport))
    }
}

pub struct MockDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<DataMessage>>,
    closes: AtomicUsize,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: DataChannelState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<DataMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                DataMessage::Text(text) => Some(text.clone()),
                DataMessage::Binary(_) => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<(), RtcError> {
        self.sent.lock().push(DataMessage::Text(text));
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), RtcError> {
        self.sent.lock().push(DataMessage::Binary(data));
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DataChannelState::Closed;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMediaSink {
    samples: Mutex<Vec<(MediaKind, Bytes, Duration)>>,
}

impl MockMediaSink {
    pub fn samples(&self) -> Vec<(MediaKind, Bytes, Duration)> {
        self.samples.lock().clone()
    }
}

#[async_trait]
impl MediaSink for MockMediaSink {
    async fn write_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), RtcError> {
        self.samples.lock().push((kind, data, duration));
        Ok(())
    }
}

/// Peer session that records every call and lets the test drive its events.
pub struct MockPeerSession {
    config: PeerSessionConfig,
    events: PeerEventSender,
    offer_sdp: String,
    gathered: Vec<IceCandidate>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    added: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
    channel: Arc<MockDataChannel>,
    media: Arc<MockMediaSink>,
}

impl MockPeerSession {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.emit(PeerEvent::ConnectionState(state));
    }

    /// Mark the data channel open and report it.
    pub fn open_data_channel(&self) {
        self.channel.set_state(DataChannelState::Open);
        self.emit(PeerEvent::DataChannelOpen);
    }

    pub fn receive(&self, message: DataMessage) {
        self.emit(PeerEvent::DataMessage(message));
    }

    pub fn config(&self) -> &PeerSessionConfig {
        &self.config
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Arc<MockDataChannel> {
        Arc::clone(&self.channel)
    }

    pub fn media(&self) -> Arc<MockMediaSink> {
        Arc::clone(&self.media)
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        Ok(SessionDescription::offer(self.offer_sdp.clone()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        *self.local.lock() = Some(description);
        for candidate in &self.gathered {
            self.emit(PeerEvent::IceCandidate(candidate.clone()));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        if self.remote.lock().is_none() {
            return Err(RtcError::Peer("remote description not set".into()));
        }
        self.added.lock().push(candidate);
        Ok(())
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        Some(Arc::clone(&self.channel) as Arc<dyn DataChannel>)
    }

    fn media_sink(&self) -> Option<Arc<dyn MediaSink>> {
        Some(Arc::clone(&self.media) as Arc<dyn MediaSink>)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates [`MockPeerSession`]s and keeps a handle to each one.
pub struct MockPeerFactory {
    offer_sdp: String,
    gathered: Vec<IceCandidate>,
    fail_create: bool,
    sessions: Mutex<Vec<Arc<MockPeerSession>>>,
}

impl Default for MockPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self {
            offer_sdp: MOCK_OFFER_SDP.to_string(),
            gathered: Vec::new(),
            fail_create: false,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Candidates every session reports once its local description is set.
    pub fn with_gathered_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.gathered = candidates;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last_session(&self) -> Option<Arc<MockPeerSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl PeerSessionFactory for MockPeerFactory {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, RtcError> {
        if self.fail_create {
            return Err(RtcError::Peer("mock peer creation failed".into()));
        }
        let channel = Arc::new(MockDataChannel::new(config.data_channel_label.clone()));
        let session = Arc::new(MockPeerSession {
            config,
            events,
            offer_sdp: self.offer_sdp.clone(),
            gathered: self.gathered.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            added: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            channel,
            media: Arc::new(MockMediaSink::default()),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}
