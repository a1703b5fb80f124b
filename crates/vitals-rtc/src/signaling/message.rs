//! Wire envelopes exchanged with the signaling server. Every frame is a JSON
//! object `{"type": …, "data": …}`.

use serde::{Deserialize, Serialize};

use crate::types::{IceCandidate, IceServer, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpMessage {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub data: SdpPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SdpMessage {
    pub fn new(description: &SessionDescription) -> Self {
        Self {
            kind: description.kind,
            data: SdpPayload {
                sdp: description.sdp.clone(),
                kind: description.kind,
            },
        }
    }

    /// The inner payload type is authoritative.
    pub fn into_description(self) -> SessionDescription {
        SessionDescription {
            kind: self.data.kind,
            sdp: self.data.sdp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceCandidateTag {
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateMessage {
    #[serde(rename = "type")]
    pub kind: IceCandidateTag,
    pub data: IceCandidatePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub sdp: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: i32,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

impl From<&IceCandidate> for IceCandidateMessage {
    fn from(candidate: &IceCandidate) -> Self {
        Self {
            kind: IceCandidateTag::IceCandidate,
            data: IceCandidatePayload {
                sdp: candidate.candidate.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                sdp_mid: candidate.sdp_mid.clone(),
            },
        }
    }
}

impl From<IceCandidateMessage> for IceCandidate {
    fn from(message: IceCandidateMessage) -> Self {
        IceCandidate {
            candidate: message.data.sdp,
            sdp_mline_index: message.data.sdp_mline_index,
            sdp_mid: message.data.sdp_mid,
        }
    }
}

/// `type` of a reply to a client request. Servers may echo request-specific
/// types; those land in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Success,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponsePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

impl ResponseMessage {
    pub fn success() -> Self {
        Self {
            kind: ResponseKind::Success,
            data: None,
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            data: Some(ResponsePayload {
                message: Some(message.into()),
                code: Some(code),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceServerTag {
    #[serde(rename = "ice-server")]
    IceServer,
}

/// ICE server list pushed by the server. Decoded for completeness; the session
/// takes its ICE servers from [`crate::RtcConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerMessage {
    #[serde(rename = "type")]
    pub kind: IceServerTag,
    pub data: Vec<IceServer>,
}

/// Loose view of any frame, used to spot error envelopes and trickled
/// candidates before committing to a concrete type.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub(crate) const ERROR_TYPE: &str = "error";
pub(crate) const ICE_CANDIDATE_TYPE: &str = "ice-candidate";
