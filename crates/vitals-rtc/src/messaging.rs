//! Application messages over the data channel: outbound sends and the
//! inbound prediction stream with its fill-forward state.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::RtcError;
use crate::event::{EventSink, SessionEvent};
use crate::lifecycle::Lifecycle;
use crate::prediction::{BodyPrediction, FillForward, FramePrediction};
use crate::types::{DataChannelState, DataMessage};

pub const END_SESSION_MESSAGE: &str = "end session";

pub type SessionEndHandler = Box<dyn FnOnce(FramePrediction) + Send>;

#[derive(Debug, Clone, Default)]
pub struct PredictionState {
    pub intermediate: Option<FramePrediction>,
    pub final_value: Option<FramePrediction>,
}

pub(crate) struct Messenger {
    lifecycle: Arc<Lifecycle>,
    events: EventSink,
    predictions: Mutex<PredictionState>,
    on_session_end: Mutex<Option<SessionEndHandler>>,
}

impl Messenger {
    pub(crate) fn new(lifecycle: Arc<Lifecycle>, events: EventSink) -> Self {
        Self {
            lifecycle,
            events,
            predictions: Mutex::new(PredictionState::default()),
            on_session_end: Mutex::new(None),
        }
    }

    pub(crate) fn predictions(&self) -> PredictionState {
        self.predictions.lock().clone()
    }

    pub(crate) fn set_session_end_handler(&self, handler: SessionEndHandler) {
        *self.on_session_end.lock() = Some(handler);
    }

    /// Like [`Self::set_session_end_handler`], but a final prediction that
    /// already arrived is delivered right away instead of waiting for the next.
    pub(crate) fn on_session_end(&self, handler: SessionEndHandler) {
        let recorded = self.predictions.lock().final_value.clone();
        match recorded {
            Some(final_value) => {
                debug!(target = "vitals_rtc::messaging", "final prediction already recorded");
                handler(final_value);
            }
            None => self.set_session_end_handler(handler),
        }
    }

    /// Best effort: a missing or unopened channel is logged, never an error.
    pub(crate) async fn send(&self, message: DataMessage) {
        let Some(channel) = self.lifecycle.data_channel() else {
            warn!(target = "vitals_rtc::messaging", "no data channel, message dropped");
            return;
        };
        let state = channel.ready_state();
        if state != DataChannelState::Open {
            warn!(
                target = "vitals_rtc::messaging",
                ?state,
                "data channel is not open, message dropped"
            );
            return;
        }
        let result = match message {
            DataMessage::Text(text) => channel.send_text(text).await,
            DataMessage::Binary(data) => channel.send_binary(data).await,
        };
        if let Err(err) = result {
            warn!(target = "vitals_rtc::messaging", error = %err, "data channel send failed");
        }
    }

    pub(crate) async fn send_text(&self, text: impl Into<String>) {
        self.send(DataMessage::Text(text.into())).await;
    }

    pub(crate) async fn send_binary(&self, data: Bytes) {
        self.send(DataMessage::Binary(data)).await;
    }

    async fn send_json(&self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    pub(crate) async fn send_participant_id(&self, participant_id: &str) {
        debug!(target = "vitals_rtc::messaging", participant_id, "sending participant id");
        self.send_json(json!({ "ParticipantID": participant_id }))
            .await;
    }

    pub(crate) async fn end_session(&self, on_end: SessionEndHandler) {
        self.set_session_end_handler(on_end);
        self.send_text(END_SESSION_MESSAGE).await;
    }

    pub(crate) async fn send_survey_data(
        &self,
        survey: &BTreeMap<String, i64>,
    ) -> Result<(), RtcError> {
        self.send_participant_payload("surveyResult", json!(survey))
            .await
    }

    pub(crate) async fn send_weight_data(&self, weight: Option<f64>) -> Result<(), RtcError> {
        self.send_participant_payload("weightDataDict", json!({ "Weight": weight }))
            .await
    }

    pub(crate) async fn send_body_data(&self, body: &BodyPrediction) -> Result<(), RtcError> {
        self.send_participant_payload(
            "bodyDataDict",
            json!({ "Weight": body.weight, "Body Fat": body.body_fat }),
        )
        .await
    }

    /// Payloads tied to a participant need the ids from the final prediction.
    async fn send_participant_payload(&self, key: &str, payload: Value) -> Result<(), RtcError> {
        let (participant_id, person_id) = {
            let predictions = self.predictions.lock();
            let final_value = predictions.final_value.as_ref();
            (
                final_value.and_then(|value| value.participant_id.clone()),
                final_value.and_then(|value| value.person_id.clone()),
            )
        };
        let Some(participant_id) = participant_id else {
            warn!(
                target = "vitals_rtc::messaging",
                key, "no participant id from a final prediction, not sending"
            );
            return Err(RtcError::MissingParticipantId);
        };
        let mut body = serde_json::Map::new();
        body.insert("ParticipantID".into(), Value::String(participant_id));
        body.insert(
            "PersonID".into(),
            person_id.map(Value::String).unwrap_or(Value::Null),
        );
        body.insert(key.into(), payload);
        self.send_json(Value::Object(body)).await;
        Ok(())
    }

    pub(crate) fn dispatch(&self, message: DataMessage) {
        match message {
            DataMessage::Binary(data) => self.events.emit(SessionEvent::BinaryMessage(data)),
            DataMessage::Text(text) => match serde_json::from_str::<FramePrediction>(&text) {
                Ok(record) => self.apply_prediction(record),
                Err(err) => warn!(
                    target = "vitals_rtc::messaging",
                    error = %err,
                    len = text.len(),
                    "dropping undecodable data channel message"
                ),
            },
        }
    }

    fn apply_prediction(&self, record: FramePrediction) {
        if record.is_final {
            let merged = {
                let mut predictions = self.predictions.lock();
                let merged = record.filled_from(predictions.final_value.as_ref());
                predictions.final_value = Some(merged.clone());
                merged
            };
            self.events
                .emit(SessionEvent::FinalPrediction(merged.clone()));
            let handler = self.on_session_end.lock().take();
            if let Some(handler) = handler {
                info!(target = "vitals_rtc::messaging", "final prediction received, ending session");
                handler(merged);
            }
        } else {
            let merged = {
                let mut predictions = self.predictions.lock();
                let merged = record.filled_from(predictions.intermediate.as_ref());
                predictions.intermediate = Some(merged.clone());
                merged
            };
            self.events.emit(SessionEvent::Prediction(merged));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeerFactory, MockPeerSession};
    use crate::peer::{PeerSessionConfig, PeerSessionFactory};
    use crate::RtcConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Fixture {
        messenger: Messenger,
        peer: Arc<MockPeerSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _attempt: crate::lifecycle::Attempt,
    }

    async fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Some(tx));
        let lifecycle = Arc::new(Lifecycle::new(sink.clone()));
        let factory = MockPeerFactory::new();
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(PeerSessionConfig::from(&RtcConfig::default()), peer_tx)
            .await
            .unwrap();
        let attempt = lifecycle.begin_attempt().unwrap();
        lifecycle.attach_peer(attempt.id, peer).unwrap();
        Fixture {
            messenger: Messenger::new(lifecycle, sink),
            peer: factory.last_session().unwrap(),
            events: rx,
            _attempt: attempt,
        }
    }

    fn text(value: serde_json::Value) -> DataMessage {
        DataMessage::Text(value.to_string())
    }

    #[tokio::test]
    async fn sends_are_dropped_until_channel_opens() {
        let fixture = fixture().await;
        fixture.messenger.send_text("hello").await;
        assert!(fixture.peer.channel().sent().is_empty());

        fixture.peer.channel().set_state(DataChannelState::Open);
        fixture.messenger.send_text("hello").await;
        fixture
            .messenger
            .send_binary(Bytes::from_static(&[1, 2]))
            .await;
        assert_eq!(fixture.peer.channel().sent().len(), 2);
    }

    #[tokio::test]
    async fn participant_id_envelope() {
        let fixture = fixture().await;
        fixture.peer.channel().set_state(DataChannelState::Open);
        fixture.messenger.send_participant_id("P-001").await;
        let sent: Value =
            serde_json::from_str(&fixture.peer.channel().sent_text()[0]).unwrap();
        assert_eq!(sent, json!({"ParticipantID": "P-001"}));
    }

    #[tokio::test]
    async fn intermediate_predictions_fill_forward() {
        let mut fixture = fixture().await;
        fixture
            .messenger
            .dispatch(text(json!({"hr": 70.0, "hrv": 40.0})));
        fixture.messenger.dispatch(text(json!({"hr": 72.0})));

        let state = fixture.messenger.predictions();
        let current = state.intermediate.unwrap();
        assert_eq!(current.hr, Some(72.0));
        assert_eq!(current.hrv, Some(40.0));
        assert!(state.final_value.is_none());

        let first = fixture.events.try_recv().unwrap();
        assert!(matches!(first, SessionEvent::Prediction(_)));
    }

    #[tokio::test]
    async fn empty_record_repeats_previous_prediction() {
        let fixture = fixture().await;
        fixture.messenger.dispatch(text(json!({
            "hr": 65.0, "fatigue": 0.3, "pimpleCount": 1, "person_id": "x"
        })));
        let before = fixture.messenger.predictions().intermediate.unwrap();
        fixture.messenger.dispatch(text(json!({})));
        assert_eq!(fixture.messenger.predictions().intermediate.unwrap(), before);
    }

    #[tokio::test]
    async fn session_end_fires_once_on_first_final() {
        let fixture = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fixture.peer.channel().set_state(DataChannelState::Open);
        fixture
            .messenger
            .end_session(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        assert_eq!(fixture.peer.channel().sent_text(), vec![END_SESSION_MESSAGE]);

        fixture.messenger.dispatch(text(json!({
            "final": true, "hr": 68.0, "participant_id": "P-2", "person_id": "person-1"
        })));
        fixture
            .messenger
            .dispatch(text(json!({"final": true, "fatigue": 0.1})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let final_value = fixture.messenger.predictions().final_value.unwrap();
        assert_eq!(final_value.hr, Some(68.0));
        assert_eq!(final_value.fatigue, Some(0.1));
        assert_eq!(final_value.participant_id.as_deref(), Some("P-2"));
    }

    #[tokio::test]
    async fn final_with_dark_circle_flags_ends_the_session() {
        let mut fixture = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fixture.messenger.set_session_end_handler(Box::new(move |record| {
            assert_eq!(record.dark_circle_left, Some(true));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        fixture.messenger.dispatch(text(json!({
            "final": true, "hr": 66.0, "darkCircleLeft": true, "darkCircleRight": false
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            fixture.events.try_recv().unwrap(),
            SessionEvent::FinalPrediction(_)
        ));
    }

    #[tokio::test]
    async fn late_session_end_handler_sees_recorded_final() {
        let fixture = fixture().await;
        fixture
            .messenger
            .dispatch(text(json!({"final": true, "hr": 64.0, "person_id": "person-2"})));

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        fixture.messenger.on_session_end(Box::new(move |record| {
            *slot.lock() = record.hr;
        }));
        assert_eq!(*seen.lock(), Some(64.0));

        // Nothing stays registered for the next final.
        assert!(fixture.messenger.on_session_end.lock().is_none());
        fixture
            .messenger
            .dispatch(text(json!({"final": true, "hr": 65.0})));
        assert_eq!(*seen.lock(), Some(64.0));
    }

    #[tokio::test]
    async fn session_end_handler_waits_when_no_final_yet() {
        let fixture = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fixture.messenger.on_session_end(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        fixture.messenger.dispatch(text(json!({"final": true})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn participant_payloads_need_a_final_record() {
        let fixture = fixture().await;
        fixture.peer.channel().set_state(DataChannelState::Open);
        assert!(matches!(
            fixture.messenger.send_weight_data(Some(70.0)).await,
            Err(RtcError::MissingParticipantId)
        ));
        assert!(fixture.peer.channel().sent().is_empty());

        fixture.messenger.dispatch(text(json!({
            "final": true, "participant_id": "P-3", "person_id": "person-9"
        })));
        fixture.messenger.send_weight_data(Some(70.0)).await.unwrap();
        fixture
            .messenger
            .send_body_data(&BodyPrediction {
                weight: Some(70.0),
                body_fat: Some(17.5),
            })
            .await
            .unwrap();
        let survey = BTreeMap::from([("sleep".to_string(), 4), ("stress".to_string(), 2)]);
        fixture.messenger.send_survey_data(&survey).await.unwrap();

        let sent: Vec<Value> = fixture
            .peer
            .channel()
            .sent_text()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect();
        assert_eq!(
            sent[0],
            json!({"ParticipantID": "P-3", "PersonID": "person-9", "weightDataDict": {"Weight": 70.0}})
        );
        assert_eq!(
            sent[1]["bodyDataDict"],
            json!({"Weight": 70.0, "Body Fat": 17.5})
        );
        assert_eq!(sent[2]["surveyResult"], json!({"sleep": 4, "stress": 2}));
    }

    #[tokio::test]
    async fn malformed_text_and_binary_frames() {
        let mut fixture = fixture().await;
        fixture
            .messenger
            .dispatch(DataMessage::Text("not json".into()));
        fixture
            .messenger
            .dispatch(DataMessage::Binary(Bytes::from_static(b"raw")));
        assert!(fixture.messenger.predictions().intermediate.is_none());
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            SessionEvent::BinaryMessage(Bytes::from_static(b"raw"))
        );
    }
}
