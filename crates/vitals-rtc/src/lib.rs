//! WebRTC session client for the vitals kiosk.
//!
//! The kiosk offers, a signaling server answers over a WebSocket, and once the
//! peer connection is up the backend streams prediction records back over a
//! reliable data channel. [`RtcSession`] is the entry point; the peer stack
//! sits behind [`PeerSessionFactory`] so it can be swapped for
//! [`mock::MockPeerFactory`] in tests.

pub mod config;
pub mod error;
pub mod event;
mod lifecycle;
pub mod messaging;
pub mod mock;
pub mod negotiation;
pub mod peer;
pub mod prediction;
pub mod sdp;
mod session;
pub mod signaling;
pub mod types;

pub use config::RtcConfig;
pub use error::{ErrorKind, RtcError, SignalingError};
pub use event::{SessionEvent, SessionObserver};
pub use messaging::{END_SESSION_MESSAGE, PredictionState};
pub use negotiation::NegotiationPhase;
pub use peer::{
    DataChannel, MediaSink, PeerEvent, PeerSession, PeerSessionConfig, PeerSessionFactory,
    WebRtcPeerFactory,
};
pub use prediction::{BodyPrediction, FillForward, FramePrediction, HistoricalData};
pub use session::RtcSession;
pub use signaling::{SignalingClient, SignalingConnector, SignalingTransport, WebSocketConnector};
pub use types::{
    ConnectionState, DataChannelState, DataMessage, IceCandidate, IceServer, MediaKind, SdpKind,
    SessionDescription,
};
