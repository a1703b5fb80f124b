use std::fmt;

use tracing::debug;

use crate::error::RtcError;
use crate::peer::PeerSession;
use crate::sdp::{CandidateCache, augment_offer_sdp};
use crate::signaling::SignalingClient;
use crate::types::{SdpKind, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Offering,
    AwaitingAnswer,
    NegotiatingRemote,
    Connected,
    Failed,
    TimedOut,
}

impl NegotiationPhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            NegotiationPhase::Offering
                | NegotiationPhase::AwaitingAnswer
                | NegotiationPhase::NegotiatingRemote
        )
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::Offering => "offering",
            NegotiationPhase::AwaitingAnswer => "awaiting-answer",
            NegotiationPhase::NegotiatingRemote => "negotiating-remote",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Failed => "failed",
            NegotiationPhase::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Offer/answer exchange for the offering side: create and apply the local
/// offer, send it with the candidates gathered so far, apply the answer.
pub(crate) async fn exchange_offer(
    peer: &dyn PeerSession,
    signaling: &SignalingClient,
    candidates: &CandidateCache,
    mut enter: impl FnMut(NegotiationPhase),
) -> Result<(), RtcError> {
    enter(NegotiationPhase::Offering);
    let offer = peer.create_offer().await?;
    if offer.kind != SdpKind::Offer {
        return Err(RtcError::Internal(format!(
            "peer produced {} while creating an offer",
            offer.kind
        )));
    }
    peer.set_local_description(offer.clone()).await?;

    let embedded = candidates.seal();
    let sdp = augment_offer_sdp(&offer.sdp, &embedded);
    debug!(
        target = "vitals_rtc::negotiation",
        embedded = embedded.len(),
        "sending offer"
    );

    enter(NegotiationPhase::AwaitingAnswer);
    let reply = signaling
        .send_sdp(&SessionDescription::offer(sdp))
        .await?
        .into_description();
    match reply.kind {
        SdpKind::Answer => {}
        SdpKind::Offer => return Err(RtcError::NotImplemented("remote-initiated offers")),
        other => {
            return Err(RtcError::Internal(format!(
                "expected an answer, server sent {other}"
            )));
        }
    }

    enter(NegotiationPhase::NegotiatingRemote);
    peer.set_remote_description(reply).await?;
    debug!(target = "vitals_rtc::negotiation", "remote answer applied");
    Ok(())
}
