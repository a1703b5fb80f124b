//! Signaling: the WebSocket transport, the request/response correlator, and
//! the client that serializes requests over them.

mod client;
mod correlator;
pub mod message;
mod transport;

pub use client::{SignalingClient, SignalingOptions};
pub use correlator::{Correlator, TrickleSink};
pub use transport::{
    InboundFrame, SignalingConnector, SignalingTransport, WebSocketConnector, WebSocketTransport,
    normalize_signaling_url,
};
