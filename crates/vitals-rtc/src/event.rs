use bytes::Bytes;
use tokio::sync::mpsc;

use crate::prediction::FramePrediction;
use crate::types::ConnectionState;

/// Notifications delivered to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// Emitted once per established connection, however it ends.
    Disconnected,
    ConnectionStateChanged(ConnectionState),
    DataChannelOpen,
    /// Intermediate prediction, already merged with the previous one.
    Prediction(FramePrediction),
    FinalPrediction(FramePrediction),
    BinaryMessage(Bytes),
}

pub type SessionObserver = mpsc::UnboundedSender<SessionEvent>;

#[derive(Clone, Default)]
pub(crate) struct EventSink(Option<SessionObserver>);

impl EventSink {
    pub(crate) fn new(observer: Option<SessionObserver>) -> Self {
        Self(observer)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(observer) = &self.0 {
            let _ = observer.send(event);
        }
    }
}
