//! Connection lifecycle: the connected flag, the single outstanding connect
//! completion, and teardown of everything an attempt created.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RtcError;
use crate::event::{EventSink, SessionEvent};
use crate::negotiation::NegotiationPhase;
use crate::peer::{DataChannel, MediaSink, PeerSession};
use crate::signaling::SignalingClient;
use crate::types::ConnectionState;

pub(crate) type Completion = oneshot::Receiver<Result<(), RtcError>>;

pub(crate) struct Attempt {
    pub id: u64,
    pub shutdown: CancellationToken,
    pub completion: Completion,
}

struct SessionResources {
    attempt: u64,
    shutdown: CancellationToken,
    signaling: Option<Arc<SignalingClient>>,
    peer: Option<Arc<dyn PeerSession>>,
}

struct LifecycleState {
    connected: bool,
    attempt: u64,
    pending: Option<oneshot::Sender<Result<(), RtcError>>>,
    phase: NegotiationPhase,
    resources: Option<SessionResources>,
}

pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    events: EventSink,
}

impl Lifecycle {
    pub(crate) fn new(events: EventSink) -> Self {
        Self {
            state: Mutex::new(LifecycleState {
                connected: false,
                attempt: 0,
                pending: None,
                phase: NegotiationPhase::Idle,
                resources: None,
            }),
            events,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn phase(&self) -> NegotiationPhase {
        self.state.lock().phase
    }

    /// Register the completion for a new attempt. Fails while another
    /// attempt still waits for its outcome.
    pub(crate) fn begin_attempt(&self) -> Result<Attempt, RtcError> {
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err(RtcError::ConnectInProgress);
        }
        if state.resources.is_some() {
            return Err(RtcError::ConnectInProgress);
        }
        let (tx, rx) = oneshot::channel();
        state.attempt += 1;
        state.pending = Some(tx);
        state.phase = NegotiationPhase::Idle;
        let shutdown = CancellationToken::new();
        state.resources = Some(SessionResources {
            attempt: state.attempt,
            shutdown: shutdown.clone(),
            signaling: None,
            peer: None,
        });
        Ok(Attempt {
            id: state.attempt,
            shutdown,
            completion: rx,
        })
    }

    pub(crate) fn set_phase(&self, attempt: u64, phase: NegotiationPhase) {
        let mut state = self.state.lock();
        if state.attempt == attempt && state.pending.is_some() {
            debug!(target = "vitals_rtc::lifecycle", attempt, %phase, "negotiation phase");
            state.phase = phase;
        }
    }

    pub(crate) fn attach_signaling(
        &self,
        attempt: u64,
        signaling: Arc<SignalingClient>,
    ) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        match state.resources.as_mut() {
            Some(resources) if resources.attempt == attempt => {
                resources.signaling = Some(signaling);
                Ok(())
            }
            _ => Err(cancelled()),
        }
    }

    pub(crate) fn attach_peer(
        &self,
        attempt: u64,
        peer: Arc<dyn PeerSession>,
    ) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        match state.resources.as_mut() {
            Some(resources) if resources.attempt == attempt => {
                resources.peer = Some(peer);
                Ok(())
            }
            _ => Err(cancelled()),
        }
    }

    pub(crate) fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let peer = self.current_peer()?;
        peer.data_channel()
    }

    pub(crate) fn media_sink(&self) -> Option<Arc<dyn MediaSink>> {
        let peer = self.current_peer()?;
        peer.media_sink()
    }

    fn current_peer(&self) -> Option<Arc<dyn PeerSession>> {
        self.state
            .lock()
            .resources
            .as_ref()
            .and_then(|resources| resources.peer.clone())
    }

    /// Drop the completion of a failed attempt. Returns whether it was still pending.
    pub(crate) fn fail_attempt(&self, attempt: u64) -> bool {
        let mut state = self.state.lock();
        if state.attempt != attempt {
            return false;
        }
        let pending = state.pending.take().is_some();
        if pending {
            state.phase = NegotiationPhase::Failed;
        }
        pending
    }

    /// Claim the completion when the connect timer fires. `false` means a
    /// resolution got there first and is already in the channel.
    pub(crate) fn expire_attempt(&self, attempt: u64) -> bool {
        let mut state = self.state.lock();
        if state.attempt != attempt {
            return false;
        }
        match state.pending.take() {
            Some(_) => {
                state.phase = NegotiationPhase::TimedOut;
                true
            }
            None => false,
        }
    }

    /// React to a peer connection state report from attempt `attempt`.
    pub(crate) async fn on_connection_state(&self, attempt: u64, connection: ConnectionState) {
        self.events
            .emit(SessionEvent::ConnectionStateChanged(connection));
        match connection {
            ConnectionState::Connected => {
                let pending = {
                    let mut state = self.state.lock();
                    if state.attempt != attempt || state.connected {
                        return;
                    }
                    if state.pending.is_none() {
                        debug!(
                            target = "vitals_rtc::lifecycle",
                            attempt, "ignoring connected report for a settled attempt"
                        );
                        return;
                    }
                    state.connected = true;
                    state.phase = NegotiationPhase::Connected;
                    state.pending.take()
                };
                info!(target = "vitals_rtc::lifecycle", attempt, "peer connected");
                if let Some(tx) = pending {
                    let _ = tx.send(Ok(()));
                }
                self.events.emit(SessionEvent::Connected);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                let (pending, was_connected) = {
                    let mut state = self.state.lock();
                    if state.attempt != attempt {
                        return;
                    }
                    let was_connected = state.connected;
                    state.connected = false;
                    let pending = state.pending.take();
                    if was_connected || pending.is_some() {
                        state.phase = NegotiationPhase::Failed;
                    }
                    (pending, was_connected)
                };
                if let Some(tx) = pending {
                    let _ = tx.send(Err(RtcError::Connection(format!(
                        "peer connection {connection:?} before it was established"
                    ))));
                }
                if was_connected {
                    warn!(
                        target = "vitals_rtc::lifecycle",
                        attempt,
                        state = ?connection,
                        "peer connection lost"
                    );
                    self.teardown(Some(attempt)).await;
                    self.events.emit(SessionEvent::Disconnected);
                }
            }
            other => {
                debug!(target = "vitals_rtc::lifecycle", attempt, state = ?other, "peer state");
            }
        }
    }

    /// Caller-initiated disconnect. Also cancels a pending connect.
    pub(crate) async fn disconnect(&self) {
        let (pending, was_connected) = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            state.connected = false;
            let pending = state.pending.take();
            if was_connected || pending.is_some() {
                state.phase = NegotiationPhase::Idle;
            }
            (pending, was_connected)
        };
        let cancelled_attempt = pending.is_some();
        if let Some(tx) = pending {
            let _ = tx.send(Err(RtcError::Connection("disconnected by caller".into())));
        }
        if !was_connected && !cancelled_attempt {
            debug!(target = "vitals_rtc::lifecycle", "disconnect ignored, not connected");
        }
        self.teardown(None).await;
        if was_connected {
            info!(target = "vitals_rtc::lifecycle", "disconnected");
            self.events.emit(SessionEvent::Disconnected);
        }
    }

    /// Release resources, data channel first, then the peer session, then
    /// signaling. With `Some(attempt)` only that attempt's resources are
    /// touched. Safe to call repeatedly.
    pub(crate) async fn teardown(&self, attempt: Option<u64>) -> bool {
        let resources = {
            let mut state = self.state.lock();
            let owned = match (&state.resources, attempt) {
                (Some(resources), Some(attempt)) => resources.attempt == attempt,
                _ => true,
            };
            if owned { state.resources.take() } else { None }
        };
        let Some(resources) = resources else {
            return false;
        };
        resources.shutdown.cancel();
        if let Some(peer) = resources.peer {
            if let Some(channel) = peer.data_channel() {
                if let Err(err) = channel.close().await {
                    warn!(target = "vitals_rtc::lifecycle", error = %err, "data channel close failed");
                }
            }
            if let Err(err) = peer.close().await {
                warn!(target = "vitals_rtc::lifecycle", error = %err, "peer session close failed");
            }
        }
        if let Some(signaling) = resources.signaling {
            signaling.disconnect().await;
        }
        debug!(
            target = "vitals_rtc::lifecycle",
            attempt = resources.attempt,
            "session resources released"
        );
        true
    }
}

fn cancelled() -> RtcError {
    RtcError::Connection("connection attempt was cancelled".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_lifecycle() -> (Lifecycle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Lifecycle::new(EventSink::new(Some(tx))), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn second_attempt_is_rejected_while_first_is_pending() {
        let (lifecycle, _rx) = make_lifecycle();
        let _first = lifecycle.begin_attempt().unwrap();
        assert!(matches!(
            lifecycle.begin_attempt(),
            Err(RtcError::ConnectInProgress)
        ));
    }

    #[tokio::test]
    async fn connected_resolves_pending_once() {
        let (lifecycle, mut rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();

        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Connected)
            .await;
        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Connected)
            .await;

        assert!(attempt.completion.await.unwrap().is_ok());
        assert!(lifecycle.is_connected());
        assert_eq!(lifecycle.phase(), NegotiationPhase::Connected);
        let connected = drain(&mut rx)
            .into_iter()
            .filter(|event| *event == SessionEvent::Connected)
            .count();
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn failure_before_connect_rejects_pending() {
        let (lifecycle, mut rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();
        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Failed)
            .await;
        assert!(matches!(
            attempt.completion.await.unwrap(),
            Err(RtcError::Connection(_))
        ));
        assert!(!drain(&mut rx).contains(&SessionEvent::Disconnected));
    }

    #[tokio::test]
    async fn timer_and_resolution_settle_once() {
        let (lifecycle, _rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();
        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Connected)
            .await;
        assert!(!lifecycle.expire_attempt(attempt.id));
        assert!(attempt.completion.await.unwrap().is_ok());

        let (lifecycle, _rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();
        assert!(lifecycle.expire_attempt(attempt.id));
        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Connected)
            .await;
        assert!(!lifecycle.is_connected());
        assert_eq!(lifecycle.phase(), NegotiationPhase::TimedOut);
    }

    #[tokio::test]
    async fn stale_attempt_reports_are_ignored() {
        let (lifecycle, _rx) = make_lifecycle();
        let first = lifecycle.begin_attempt().unwrap();
        assert!(lifecycle.fail_attempt(first.id));
        assert!(lifecycle.teardown(Some(first.id)).await);

        let second = lifecycle.begin_attempt().unwrap();
        lifecycle
            .on_connection_state(first.id, ConnectionState::Failed)
            .await;
        lifecycle
            .on_connection_state(second.id, ConnectionState::Connected)
            .await;
        assert!(second.completion.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn disconnect_notifies_once() {
        let (lifecycle, mut rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();
        lifecycle
            .on_connection_state(attempt.id, ConnectionState::Connected)
            .await;
        drain(&mut rx);

        lifecycle.disconnect().await;
        lifecycle.disconnect().await;
        assert!(!lifecycle.is_connected());
        assert_eq!(drain(&mut rx), vec![SessionEvent::Disconnected]);
        assert!(!lifecycle.teardown(None).await);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_attempt() {
        let (lifecycle, mut rx) = make_lifecycle();
        let attempt = lifecycle.begin_attempt().unwrap();
        lifecycle.disconnect().await;
        assert!(matches!(
            attempt.completion.await.unwrap(),
            Err(RtcError::Connection(_))
        ));
        assert!(attempt.shutdown.is_cancelled());
        assert!(drain(&mut rx).is_empty());
    }
}
