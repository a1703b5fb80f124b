use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::message::{
    ERROR_TYPE, Envelope, ICE_CANDIDATE_TYPE, IceCandidateMessage, ResponsePayload,
};
use super::transport::{InboundFrame, SignalingTransport};
use crate::error::SignalingError;
use crate::types::IceCandidate;

/// Receives remote candidates that arrive while a request is waiting for its
/// response. Called synchronously, in arrival order.
pub trait TrickleSink: Send + Sync {
    fn remote_did_trickle(&self, candidate: IceCandidate);
}

impl TrickleSink for mpsc::UnboundedSender<IceCandidate> {
    fn remote_did_trickle(&self, candidate: IceCandidate) {
        if self.send(candidate).is_err() {
            debug!(
                target = "vitals_rtc::signaling",
                "dropping remote candidate, receiver is gone"
            );
        }
    }
}

/// Pairs one outgoing request with its response on a channel that also
/// carries unsolicited candidates.
pub struct Correlator {
    transport: Box<dyn SignalingTransport>,
    trickle: Arc<dyn TrickleSink>,
    max_frames: usize,
    cancel: CancellationToken,
}

impl Correlator {
    pub fn new(
        transport: Box<dyn SignalingTransport>,
        trickle: Arc<dyn TrickleSink>,
        max_frames: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            trickle,
            max_frames: max_frames.max(1),
            cancel,
        }
    }

    pub async fn send_and_wait<M, R>(&mut self, message: &M) -> Result<R, SignalingError>
    where
        M: Serialize + Sync,
        R: DeserializeOwned,
    {
        let text = serde_json::to_string(message)
            .map_err(|err| SignalingError::Internal(format!("encode request: {err}")))?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled()),
            sent = self.transport.send_text(text) => sent?,
        }

        for read in 1..=self.max_frames {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(cancelled()),
                frame = self.transport.receive_one() => frame?,
            };
            if let Some(response) = classify::<R>(frame, self.trickle.as_ref())? {
                trace!(target = "vitals_rtc::signaling", read, "response matched");
                return Ok(response);
            }
        }
        Err(SignalingError::TooManyIceCandidates)
    }

    pub async fn close(&mut self) {
        self.transport.disconnect().await;
    }
}

fn cancelled() -> SignalingError {
    SignalingError::Connection("signaling client disconnected".into())
}

/// `Ok(None)` means the frame was a trickled candidate and was dispatched.
fn classify<R: DeserializeOwned>(
    frame: InboundFrame,
    trickle: &dyn TrickleSink,
) -> Result<Option<R>, SignalingError> {
    let text = match frame {
        InboundFrame::Text(text) => text,
        InboundFrame::Binary(data) => {
            return Err(SignalingError::UnsupportedMessage(format!(
                "binary frame ({} bytes)",
                data.len()
            )));
        }
    };
    let envelope: Envelope = serde_json::from_str(&text)
        .map_err(|err| SignalingError::UnsupportedMessage(format!("{err}: {}", preview(&text))))?;

    if envelope.kind == ERROR_TYPE {
        let payload: Option<ResponsePayload> = serde_json::from_value(envelope.data).ok().flatten();
        let (code, message) = match payload {
            Some(payload) => (payload.code, payload.message),
            None => (None, None),
        };
        return Err(SignalingError::ErrorResponse {
            code,
            message: message.unwrap_or_else(|| "unspecified error".into()),
        });
    }

    // Candidates first: their payload also fits the loose response shapes.
    if envelope.kind == ICE_CANDIDATE_TYPE {
        let message: IceCandidateMessage = serde_json::from_str(&text).map_err(|err| {
            SignalingError::UnsupportedMessage(format!("malformed ice-candidate: {err}"))
        })?;
        let candidate = IceCandidate::from(message);
        debug!(
            target = "vitals_rtc::signaling",
            mline = candidate.sdp_mline_index,
            mid = candidate.sdp_mid.as_deref().unwrap_or(""),
            "remote candidate trickled"
        );
        trickle.remote_did_trickle(candidate);
        return Ok(None);
    }

    if let Ok(response) = serde_json::from_str::<R>(&text) {
        return Ok(Some(response));
    }

    Err(SignalingError::UnsupportedMessage(format!(
        "unexpected `{}` message",
        envelope.kind
    )))
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::scripted_pair;
    use crate::signaling::message::{ResponseKind, ResponseMessage, SdpMessage};
    use crate::types::{SdpKind, SessionDescription};
    use serde_json::json;

    fn ice(index: i32) -> serde_json::Value {
        json!({
            "type": "ice-candidate",
            "data": {"sdp": format!("candidate:{index} 1 udp 1 10.0.0.{index} 5000 typ relay"),
                     "sdpMLineIndex": index, "sdpMid": index.to_string()}
        })
    }

    fn answer() -> serde_json::Value {
        json!({"type": "answer", "data": {"sdp": "v=0\r\n", "type": "answer"}})
    }

    fn make_correlator(
        transport: crate::mock::ScriptedTransport,
    ) -> (Correlator, mpsc::UnboundedReceiver<IceCandidate>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let correlator = Correlator::new(Box::new(transport), Arc::new(tx), 10, cancel.clone());
        (correlator, rx, cancel)
    }

    fn offer() -> SdpMessage {
        SdpMessage::new(&SessionDescription::offer("v=0\r\n"))
    }

    #[tokio::test]
    async fn candidates_before_answer_are_trickled_in_order() {
        let (transport, mut server) = scripted_pair();
        server.push_json(&ice(0));
        server.push_json(&ice(1));
        server.push_json(&answer());
        let (mut correlator, mut trickled, _) = make_correlator(transport);

        let response: SdpMessage = correlator.send_and_wait(&offer()).await.unwrap();
        assert_eq!(response.data.kind, SdpKind::Answer);

        let first = trickled.try_recv().unwrap();
        let second = trickled.try_recv().unwrap();
        assert_eq!(first.sdp_mline_index, 0);
        assert_eq!(second.sdp_mline_index, 1);
        assert!(trickled.try_recv().is_err());

        let sent = server.try_next_sent().unwrap();
        assert!(sent.contains("\"type\":\"offer\""));
        assert_eq!(server.reads(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_ten_candidates() {
        let (transport, server) = scripted_pair();
        for index in 0..12 {
            server.push_json(&ice(index));
        }
        let (mut correlator, mut trickled, _) = make_correlator(transport);

        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        assert!(matches!(result, Err(SignalingError::TooManyIceCandidates)));
        assert_eq!(server.reads(), 10);

        let mut count = 0;
        while trickled.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn error_envelope_fails_immediately() {
        let (transport, server) = scripted_pair();
        server.push_json(&ice(0));
        server.push_json(&json!({"type": "error", "data": {"code": 409, "message": "room busy"}}));
        server.push_json(&answer());
        let (mut correlator, mut trickled, _) = make_correlator(transport);

        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        match result {
            Err(SignalingError::ErrorResponse { code, message }) => {
                assert_eq!(code, Some(409));
                assert_eq!(message, "room busy");
            }
            other => panic!("expected error response, got {other:?}"),
        }
        assert_eq!(server.reads(), 2);
        assert!(trickled.try_recv().is_ok());
    }

    #[tokio::test]
    async fn error_envelope_wins_even_when_response_shape_matches() {
        let (transport, server) = scripted_pair();
        server.push_json(&json!({"type": "error"}));
        let (mut correlator, _trickled, _) = make_correlator(transport);

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mline_index: 0,
            sdp_mid: None,
        };
        let result: Result<ResponseMessage, _> = correlator
            .send_and_wait(&IceCandidateMessage::from(&candidate))
            .await;
        assert!(matches!(
            result,
            Err(SignalingError::ErrorResponse { code: None, .. })
        ));
    }

    #[tokio::test]
    async fn candidate_forward_is_acknowledged() {
        let (transport, server) = scripted_pair();
        server.push_json(&json!({"type": "success"}));
        let (mut correlator, _trickled, _) = make_correlator(transport);

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        };
        let response: ResponseMessage = correlator
            .send_and_wait(&IceCandidateMessage::from(&candidate))
            .await
            .unwrap();
        assert_eq!(response.kind, ResponseKind::Success);
    }

    #[tokio::test]
    async fn request_specific_ack_completes_candidate_forward() {
        let (transport, server) = scripted_pair();
        server.push_json(&json!({"type": "ice-candidate-received", "data": {"message": "ok"}}));
        let (mut correlator, _trickled, _) = make_correlator(transport);

        let candidate = IceCandidate {
            candidate: "candidate:2".into(),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        };
        let response: ResponseMessage = correlator
            .send_and_wait(&IceCandidateMessage::from(&candidate))
            .await
            .unwrap();
        assert_eq!(response.kind, ResponseKind::Other);
    }

    #[tokio::test]
    async fn trickled_candidate_is_not_taken_as_ack() {
        let (transport, server) = scripted_pair();
        server.push_json(&ice(3));
        server.push_json(&json!({"type": "success"}));
        let (mut correlator, mut trickled, _) = make_correlator(transport);

        let candidate = IceCandidate {
            candidate: "candidate:4".into(),
            sdp_mline_index: 0,
            sdp_mid: None,
        };
        let response: ResponseMessage = correlator
            .send_and_wait(&IceCandidateMessage::from(&candidate))
            .await
            .unwrap();
        assert_eq!(response.kind, ResponseKind::Success);
        assert_eq!(trickled.try_recv().unwrap().sdp_mline_index, 3);
        assert_eq!(server.reads(), 2);
    }

    #[tokio::test]
    async fn binary_and_unknown_frames_are_unsupported() {
        let (transport, server) = scripted_pair();
        server.push_binary(vec![1, 2, 3]);
        let (mut correlator, _trickled, _) = make_correlator(transport);
        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        assert!(matches!(result, Err(SignalingError::UnsupportedMessage(_))));

        let (transport, server) = scripted_pair();
        server.push_json(&json!({"type": "ice-server", "data": []}));
        let (mut correlator, _trickled, _) = make_correlator(transport);
        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        assert!(matches!(result, Err(SignalingError::UnsupportedMessage(_))));

        let (transport, server) = scripted_pair();
        server.push_text("not json");
        let (mut correlator, _trickled, _) = make_correlator(transport);
        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        assert!(matches!(result, Err(SignalingError::UnsupportedMessage(_))));
    }

    #[tokio::test]
    async fn closed_channel_is_a_connection_error() {
        let (transport, server) = scripted_pair();
        server.close();
        let (mut correlator, _trickled, _) = make_correlator(transport);
        let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
        assert!(matches!(result, Err(SignalingError::Connection(_))));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_pending_read() {
        let (transport, _server) = scripted_pair();
        let (mut correlator, _trickled, cancel) = make_correlator(transport);
        let waiter = tokio::spawn(async move {
            let result: Result<SdpMessage, _> = correlator.send_and_wait(&offer()).await;
            result
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SignalingError::Connection(_))));
    }
}
