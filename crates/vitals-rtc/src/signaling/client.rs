use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::correlator::{Correlator, TrickleSink};
use super::message::{IceCandidateMessage, ResponseMessage, SdpMessage};
use super::transport::SignalingConnector;
use crate::config::DEFAULT_MAX_CORRELATED_FRAMES;
use crate::error::SignalingError;
use crate::types::{IceCandidate, IceServer, SessionDescription};

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub max_correlated_frames: usize,
    /// Bootstrap ICE configuration handed back to the caller on connect.
    pub ice_servers: Vec<IceServer>,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            max_correlated_frames: DEFAULT_MAX_CORRELATED_FRAMES,
            ice_servers: Vec::new(),
        }
    }
}

/// Request/response client over one signaling connection. Requests are
/// serialized: a second call waits until the first has its response.
pub struct SignalingClient {
    endpoint: Url,
    correlator: Mutex<Correlator>,
    shutdown: CancellationToken,
    ice_servers: Vec<IceServer>,
}

impl SignalingClient {
    pub async fn connect(
        connector: &dyn SignalingConnector,
        endpoint: Url,
        options: SignalingOptions,
        trickle: Arc<dyn TrickleSink>,
    ) -> Result<Self, SignalingError> {
        info!(
            target = "vitals_rtc::signaling",
            url = %endpoint,
            "opening signaling connection"
        );
        let transport = connector.open(&endpoint).await?;
        let shutdown = CancellationToken::new();
        let correlator = Correlator::new(
            transport,
            trickle,
            options.max_correlated_frames,
            shutdown.clone(),
        );
        Ok(Self {
            endpoint,
            correlator: Mutex::new(correlator),
            shutdown,
            ice_servers: options.ice_servers,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn send_sdp(
        &self,
        description: &SessionDescription,
    ) -> Result<SdpMessage, SignalingError> {
        self.ensure_open()?;
        debug!(
            target = "vitals_rtc::signaling",
            kind = %description.kind,
            len = description.sdp.len(),
            "sending session description"
        );
        let mut correlator = self.correlator.lock().await;
        correlator
            .send_and_wait(&SdpMessage::new(description))
            .await
    }

    pub async fn send_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<ResponseMessage, SignalingError> {
        self.ensure_open()?;
        let mut correlator = self.correlator.lock().await;
        correlator
            .send_and_wait(&IceCandidateMessage::from(candidate))
            .await
    }

    /// Close the connection, abandoning any request still waiting for a reply.
    pub async fn disconnect(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let mut correlator = self.correlator.lock().await;
        correlator.close().await;
        debug!(
            target = "vitals_rtc::signaling",
            url = %self.endpoint,
            "signaling connection closed"
        );
    }

    fn ensure_open(&self) -> Result<(), SignalingError> {
        if self.shutdown.is_cancelled() {
            Err(SignalingError::Connection(
                "signaling client disconnected".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedConnector, scripted_pair};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn make_client(
        connector: &ScriptedConnector,
    ) -> (SignalingClient, mpsc::UnboundedReceiver<IceCandidate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Url::parse("ws://127.0.0.1:9/signal").unwrap();
        let client = SignalingClient::connect(
            connector,
            endpoint,
            SignalingOptions {
                ice_servers: vec![IceServer::stun("stun:stun.example.com:3478")],
                ..SignalingOptions::default()
            },
            Arc::new(tx),
        )
        .await
        .unwrap();
        (client, rx)
    }

    #[tokio::test]
    async fn offer_round_trip_returns_answer() {
        let (transport, mut server) = scripted_pair();
        let connector = ScriptedConnector::new(vec![transport]);
        server.push_json(&json!({"type": "answer", "data": {"sdp": "v=0\r\n", "type": "answer"}}));
        let (client, _rx) = make_client(&connector).await;

        assert_eq!(client.ice_servers().len(), 1);
        let answer = client
            .send_sdp(&SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(answer.into_description(), SessionDescription::answer("v=0\r\n"));
        assert!(server.try_next_sent().is_some());
        assert_eq!(connector.opened()[0].as_str(), "ws://127.0.0.1:9/signal");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_blocks_further_requests() {
        let (transport, server) = scripted_pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (client, _rx) = make_client(&connector).await;

        client.disconnect().await;
        client.disconnect().await;
        assert!(client.is_closed());
        assert_eq!(server.disconnects(), 1);

        let result = client
            .send_sdp(&SessionDescription::offer("v=0\r\n"))
            .await;
        assert!(matches!(result, Err(SignalingError::Connection(_))));
    }

    #[tokio::test]
    async fn disconnect_cancels_an_in_flight_request() {
        let (transport, _server) = scripted_pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (client, _rx) = make_client(&connector).await;
        let client = Arc::new(client);

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .send_sdp(&SessionDescription::offer("v=0\r\n"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        client.disconnect().await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(SignalingError::Connection(_))
        ));
    }
}
