use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{RtcConfig, has_turn_server};
use crate::error::RtcError;
use crate::event::{EventSink, SessionEvent, SessionObserver};
use crate::lifecycle::{Attempt, Lifecycle};
use crate::messaging::{Messenger, PredictionState};
use crate::negotiation::{NegotiationPhase, exchange_offer};
use crate::peer::{PeerEvent, PeerSession, PeerSessionConfig, PeerSessionFactory};
use crate::prediction::{BodyPrediction, FramePrediction};
use crate::sdp::{CandidateCache, CandidateRoute};
use crate::signaling::{SignalingClient, SignalingConnector, SignalingOptions, WebSocketConnector};
use crate::types::{IceCandidate, MediaKind};

struct Inner {
    config: RtcConfig,
    connector: Arc<dyn SignalingConnector>,
    factory: Arc<dyn PeerSessionFactory>,
    lifecycle: Arc<Lifecycle>,
    messenger: Messenger,
    events: EventSink,
    sending_frames: AtomicBool,
}

/// One kiosk-to-backend streaming session.
///
/// `connect` runs signaling and the offer/answer exchange and resolves once the
/// peer reports connected, fails, or the connect timeout elapses. Events reach
/// the embedding application through the observer channel given at
/// construction.
#[derive(Clone)]
pub struct RtcSession {
    inner: Arc<Inner>,
}

impl RtcSession {
    pub fn new(
        config: RtcConfig,
        factory: Arc<dyn PeerSessionFactory>,
        observer: Option<SessionObserver>,
    ) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector), factory, observer)
    }

    pub fn with_connector(
        config: RtcConfig,
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerSessionFactory>,
        observer: Option<SessionObserver>,
    ) -> Self {
        let events = EventSink::new(observer);
        let lifecycle = Arc::new(Lifecycle::new(events.clone()));
        let messenger = Messenger::new(Arc::clone(&lifecycle), events.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                factory,
                lifecycle,
                messenger,
                events,
                sending_frames: AtomicBool::new(true),
            }),
        }
    }

    pub fn config(&self) -> &RtcConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.is_connected()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.inner.lifecycle.phase()
    }

    pub async fn connect(&self) -> Result<(), RtcError> {
        if self.is_connected() {
            debug!(target = "vitals_rtc::session", "already connected");
            return Ok(());
        }
        let endpoint = self.inner.config.signaling_endpoint()?;
        let Attempt {
            id: attempt,
            shutdown,
            mut completion,
        } = self.inner.lifecycle.begin_attempt()?;
        info!(
            target = "vitals_rtc::session",
            attempt,
            url = %endpoint,
            "connecting"
        );

        if let Err(err) = self.negotiate(attempt, endpoint, shutdown).await {
            warn!(target = "vitals_rtc::session", attempt, error = %err, "negotiation failed");
            self.inner.lifecycle.fail_attempt(attempt);
            self.inner.lifecycle.teardown(Some(attempt)).await;
            return Err(err);
        }

        let limit = self.inner.config.connect_timeout;
        let outcome = match timeout(limit, &mut completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(abandoned()),
            Err(_) => {
                if self.inner.lifecycle.expire_attempt(attempt) {
                    warn!(
                        target = "vitals_rtc::session",
                        attempt,
                        timeout_secs = limit.as_secs_f64(),
                        "connection attempt timed out"
                    );
                    Err(RtcError::ConnectionTimeout(limit))
                } else {
                    completion.await.unwrap_or_else(|_| Err(abandoned()))
                }
            }
        };
        if let Err(err) = &outcome {
            debug!(target = "vitals_rtc::session", attempt, error = %err, "connect failed");
            self.inner.lifecycle.teardown(Some(attempt)).await;
        }
        outcome
    }

    async fn negotiate(
        &self,
        attempt: u64,
        endpoint: Url,
        shutdown: CancellationToken,
    ) -> Result<(), RtcError> {
        let inner = &self.inner;
        let (trickle_tx, trickle_rx) = mpsc::unbounded_channel::<IceCandidate>();
        let signaling = SignalingClient::connect(
            inner.connector.as_ref(),
            endpoint,
            SignalingOptions {
                max_correlated_frames: inner.config.max_correlated_frames,
                ice_servers: inner.config.ice_servers.clone(),
            },
            Arc::new(trickle_tx),
        )
        .await?;
        let signaling = Arc::new(signaling);
        if let Err(err) = inner
            .lifecycle
            .attach_signaling(attempt, Arc::clone(&signaling))
        {
            signaling.disconnect().await;
            return Err(err);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer_config = PeerSessionConfig {
            ice_servers: signaling.ice_servers().to_vec(),
            ..PeerSessionConfig::from(&inner.config)
        };
        if peer_config.relay_only && !has_turn_server(&peer_config.ice_servers) {
            warn!(
                target = "vitals_rtc::session",
                attempt,
                ice_servers = peer_config.ice_servers.len(),
                "relay-only policy without a TURN server, no candidates will be gathered"
            );
        }
        let peer = inner.factory.create(peer_config, event_tx).await?;
        if let Err(err) = inner.lifecycle.attach_peer(attempt, Arc::clone(&peer)) {
            if let Err(close_err) = peer.close().await {
                debug!(target = "vitals_rtc::session", error = %close_err, "peer close failed");
            }
            return Err(err);
        }

        let candidates = Arc::new(CandidateCache::new());
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_peer_events(
            Arc::clone(inner),
            attempt,
            event_rx,
            Arc::clone(&candidates),
            forward_tx,
            shutdown.clone(),
        ));

        let lifecycle = Arc::clone(&inner.lifecycle);
        exchange_offer(peer.as_ref(), &signaling, &candidates, |phase| {
            lifecycle.set_phase(attempt, phase)
        })
        .await?;

        // Late local candidates queue up until the offer request has its answer.
        tokio::spawn(forward_local_candidates(
            Arc::clone(&signaling),
            forward_rx,
            shutdown.clone(),
        ));
        tokio::spawn(apply_remote_candidates(peer, trickle_rx, shutdown));
        Ok(())
    }

    /// Tear the session down. Cancels a pending connect; a no-op when idle.
    pub async fn disconnect(&self) {
        self.inner.lifecycle.disconnect().await;
    }

    pub fn predictions(&self) -> PredictionState {
        self.inner.messenger.predictions()
    }

    pub fn intermediate(&self) -> Option<FramePrediction> {
        self.predictions().intermediate
    }

    pub fn final_value(&self) -> Option<FramePrediction> {
        self.predictions().final_value
    }

    pub async fn send_text(&self, text: impl Into<String>) {
        self.inner.messenger.send_text(text).await;
    }

    pub async fn send_binary(&self, data: Bytes) {
        self.inner.messenger.send_binary(data).await;
    }

    pub async fn send_participant_id(&self, participant_id: &str) {
        self.inner.messenger.send_participant_id(participant_id).await;
    }

    pub async fn send_survey_data(&self, survey: &BTreeMap<String, i64>) -> Result<(), RtcError> {
        self.inner.messenger.send_survey_data(survey).await
    }

    pub async fn send_weight_data(&self, weight: Option<f64>) -> Result<(), RtcError> {
        self.inner.messenger.send_weight_data(weight).await
    }

    pub async fn send_body_data(&self, body: &BodyPrediction) -> Result<(), RtcError> {
        self.inner.messenger.send_body_data(body).await
    }

    /// Callback for the final prediction; fires at most once per registration.
    /// If a final prediction was already recorded it fires immediately with
    /// that record.
    pub fn on_session_end(&self, handler: impl FnOnce(FramePrediction) + Send + 'static) {
        self.inner.messenger.on_session_end(Box::new(handler));
    }

    /// Ask the backend to wrap up and stop forwarding media. `on_end` runs
    /// when the next final prediction arrives; an earlier final does not count.
    pub async fn end_session(&self, on_end: impl FnOnce(FramePrediction) + Send + 'static) {
        self.set_sending_frames(false);
        self.inner.messenger.end_session(Box::new(on_end)).await;
    }

    pub fn set_sending_frames(&self, enabled: bool) {
        self.inner.sending_frames.store(enabled, Ordering::SeqCst);
    }

    pub fn is_sending_frames(&self) -> bool {
        self.inner.sending_frames.load(Ordering::SeqCst)
    }

    /// Forward one encoded media sample. Dropped while frame sending is off or
    /// before a peer session exists.
    pub async fn push_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), RtcError> {
        if !self.is_sending_frames() {
            return Ok(());
        }
        match self.inner.lifecycle.media_sink() {
            Some(sink) => sink.write_sample(kind, data, duration).await,
            None => Ok(()),
        }
    }
}

fn abandoned() -> RtcError {
    RtcError::Connection("connection attempt abandoned".into())
}

async fn run_peer_events(
    inner: Arc<Inner>,
    attempt: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    candidates: Arc<CandidateCache>,
    forward: mpsc::UnboundedSender<IceCandidate>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            PeerEvent::IceCandidate(candidate) => match candidates.record(candidate.clone()) {
                CandidateRoute::Embed => {
                    debug!(target = "vitals_rtc::session", attempt, "candidate held for the offer");
                }
                CandidateRoute::Forward => {
                    let _ = forward.send(candidate);
                }
            },
            PeerEvent::ConnectionState(state) => {
                inner.lifecycle.on_connection_state(attempt, state).await;
            }
            PeerEvent::DataChannelOpen => {
                inner.events.emit(SessionEvent::DataChannelOpen);
                if let Some(participant_id) = inner.config.participant_id.as_deref() {
                    inner.messenger.send_participant_id(participant_id).await;
                }
            }
            PeerEvent::DataMessage(message) => inner.messenger.dispatch(message),
        }
    }
    debug!(target = "vitals_rtc::session", attempt, "peer event loop finished");
}

/// Sends candidates gathered after the offer, one request at a time, in order.
async fn forward_local_candidates(
    signaling: Arc<SignalingClient>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    shutdown: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            candidate = candidates.recv() => match candidate {
                Some(candidate) => candidate,
                None => break,
            },
        };
        if let Err(err) = signaling.send_ice_candidate(&candidate).await {
            warn!(
                target = "vitals_rtc::session",
                error = %err,
                "failed to forward local candidate"
            );
        }
    }
}

/// Applies remote candidates once the answer is in place, in arrival order.
async fn apply_remote_candidates(
    peer: Arc<dyn PeerSession>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    shutdown: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            candidate = candidates.recv() => match candidate {
                Some(candidate) => candidate,
                None => break,
            },
        };
        if let Err(err) = peer.add_ice_candidate(candidate).await {
            warn!(
                target = "vitals_rtc::session",
                error = %err,
                "failed to add remote candidate"
            );
        }
    }
}
