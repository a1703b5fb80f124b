use std::time::Duration;

use thiserror::Error;

/// Failures raised by the signaling transport and the request/response correlator.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("signaling connection error: {0}")]
    Connection(String),
    #[error("unsupported signaling message: {0}")]
    UnsupportedMessage(String),
    #[error("too many ice candidates received before the expected response")]
    TooManyIceCandidates,
    #[error("signaling server returned an error (code {code:?}): {message}")]
    ErrorResponse { code: Option<i64>, message: String },
    #[error("signaling internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("no signaling server configured")]
    MissingSignalingServer,
    #[error("malformed signaling server url `{url}`: {reason}")]
    MalformedUrl { url: String, reason: String },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("peer session error: {0}")]
    Peer(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("no participant id available from a final prediction")]
    MissingParticipantId,
}

/// Coarse classification used by callers deciding whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Remote,
    Timeout,
    Application,
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::InvalidUrl(_) => ErrorKind::Configuration,
            SignalingError::Connection(_) => ErrorKind::Transport,
            SignalingError::UnsupportedMessage(_)
            | SignalingError::TooManyIceCandidates
            | SignalingError::Internal(_) => ErrorKind::Protocol,
            SignalingError::ErrorResponse { .. } => ErrorKind::Remote,
        }
    }
}

impl RtcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RtcError::MissingSignalingServer | RtcError::MalformedUrl { .. } => {
                ErrorKind::Configuration
            }
            RtcError::Signaling(err) => err.kind(),
            RtcError::Connection(_) | RtcError::Peer(_) => ErrorKind::Transport,
            RtcError::ConnectionTimeout(_) => ErrorKind::Timeout,
            RtcError::Internal(_) | RtcError::NotImplemented(_) => ErrorKind::Protocol,
            RtcError::ConnectInProgress | RtcError::MissingParticipantId => {
                ErrorKind::Application
            }
        }
    }
}

pub(crate) fn peer_error(err: impl std::fmt::Display) -> RtcError {
    RtcError::Peer(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_errors_keep_their_class_through_rtc_error() {
        let err: RtcError = SignalingError::ErrorResponse {
            code: Some(42),
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert!(err.to_string().contains("boom"));

        let err: RtcError = SignalingError::TooManyIceCandidates.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn timeout_is_its_own_class() {
        let err = RtcError::ConnectionTimeout(Duration::from_secs(30));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            RtcError::MissingSignalingServer.kind(),
            ErrorKind::Configuration
        );
    }
}
