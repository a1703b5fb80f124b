use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, trace};
use url::Url;

use crate::error::SignalingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// A full-duplex text channel to the signaling server.
#[async_trait]
pub trait SignalingTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SignalingError>;

    /// Wait for the next data frame. Control frames are handled internally;
    /// a closed connection surfaces as [`SignalingError::Connection`].
    async fn receive_one(&mut self) -> Result<InboundFrame, SignalingError>;

    /// Close the channel. Calling this more than once is harmless.
    async fn disconnect(&mut self);
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(&self, endpoint: &Url) -> Result<Box<dyn SignalingTransport>, SignalingError>;
}

/// Rewrite `http`/`https` endpoints to `ws`/`wss`. Other schemes pass through.
pub fn normalize_signaling_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|err| SignalingError::InvalidUrl(format!("{raw}: {err}")))?;
    if url.cannot_be_a_base() || !url.has_host() {
        return Err(SignalingError::InvalidUrl(format!("{raw}: missing host")));
    }
    let target = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = target {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(format!("{raw}: cannot switch to {scheme}")))?;
    }
    Ok(url)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    endpoint: Url,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub async fn connect(endpoint: &Url) -> Result<Self, SignalingError> {
        let (stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| SignalingError::Connection(format!("websocket connect failed: {err}")))?;
        debug!(
            target = "vitals_rtc::signaling",
            url = %endpoint,
            "signaling websocket connected"
        );
        Ok(Self {
            endpoint: endpoint.clone(),
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut WsStream, SignalingError> {
        self.stream
            .as_mut()
            .ok_or_else(|| SignalingError::Connection("signaling channel is closed".into()))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SignalingError> {
        trace!(target = "vitals_rtc::signaling", event = "ws_out", len = text.len());
        self.stream()?
            .send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Connection(format!("websocket send failed: {err}")))
    }

    async fn receive_one(&mut self) -> Result<InboundFrame, SignalingError> {
        loop {
            let next = self.stream()?.next().await;
            match next {
                Some(Ok(Message::Text(text))) => {
                    trace!(
                        target = "vitals_rtc::signaling",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    return Ok(InboundFrame::Text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(
                        target = "vitals_rtc::signaling",
                        event = "ws_in",
                        kind = "binary",
                        len = data.len()
                    );
                    return Ok(InboundFrame::Binary(data));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        target = "vitals_rtc::signaling",
                        url = %self.endpoint,
                        ?frame,
                        "signaling server closed the websocket"
                    );
                    self.stream = None;
                    return Err(SignalingError::Connection("signaling channel closed".into()));
                }
                Some(Err(err)) => {
                    if matches!(
                        err,
                        WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
                    ) {
                        debug!(
                            target = "vitals_rtc::signaling",
                            error = %err,
                            "signaling websocket closed"
                        );
                        self.stream = None;
                    }
                    return Err(SignalingError::Connection(format!(
                        "websocket receive failed: {err}"
                    )));
                }
                None => {
                    self.stream = None;
                    return Err(SignalingError::Connection("signaling channel ended".into()));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close(None).await {
                debug!(
                    target = "vitals_rtc::signaling",
                    error = %err,
                    "error while closing signaling websocket"
                );
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn open(&self, endpoint: &Url) -> Result<Box<dyn SignalingTransport>, SignalingError> {
        let transport = WebSocketTransport::connect(endpoint).await?;
        Ok(Box::new(transport))
    }
}
