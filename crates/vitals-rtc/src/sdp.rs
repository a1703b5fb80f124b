//! Embedding locally gathered candidates into the offer SDP.
//!
//! Candidates gathered before the offer goes out ride inside it as
//! `a=candidate:` lines; anything gathered afterwards is trickled.

use parking_lot::Mutex;

use crate::types::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateRoute {
    /// Will be part of the offer snapshot.
    Embed,
    /// The offer is already out; send the candidate on its own.
    Forward,
}

#[derive(Default)]
struct CacheState {
    candidates: Vec<IceCandidate>,
    sealed: bool,
}

/// Every local candidate seen during one connection attempt.
#[derive(Default)]
pub struct CandidateCache {
    state: Mutex<CacheState>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, candidate: IceCandidate) -> CandidateRoute {
        let mut state = self.state.lock();
        state.candidates.push(candidate);
        if state.sealed {
            CandidateRoute::Forward
        } else {
            CandidateRoute::Embed
        }
    }

    /// Snapshot the candidates for the offer. Later candidates are forwarded.
    pub fn seal(&self) -> Vec<IceCandidate> {
        let mut state = self.state.lock();
        state.sealed = true;
        state.candidates.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn candidate_line(candidate: &IceCandidate) -> String {
    let value = candidate.candidate.trim();
    let value = value.strip_prefix("a=").unwrap_or(value);
    format!("a={value}")
}

/// Append `a=candidate` lines to the media sections they belong to.
///
/// A candidate goes to the section whose `a=mid:` matches its mid, otherwise to
/// the section at its m-line index, otherwise to the last section. Lines
/// already present are not repeated. Output uses CRLF line endings.
pub fn augment_offer_sdp(sdp: &str, candidates: &[IceCandidate]) -> String {
    if candidates.is_empty() {
        return sdp.to_string();
    }

    let mut session: Vec<String> = Vec::new();
    let mut sections: Vec<Vec<String>> = Vec::new();
    for line in sdp.lines().filter(|line| !line.is_empty()) {
        if line.starts_with("m=") {
            sections.push(vec![line.to_string()]);
        } else if let Some(section) = sections.last_mut() {
            section.push(line.to_string());
        } else {
            session.push(line.to_string());
        }
    }

    for candidate in candidates {
        let line = candidate_line(candidate);
        let target = section_for(&sections, candidate);
        let lines = match target {
            Some(index) => &mut sections[index],
            None => &mut session,
        };
        if !lines.iter().any(|existing| existing == &line) {
            lines.push(line);
        }
    }

    let mut out = String::with_capacity(sdp.len() + candidates.len() * 96);
    for line in session.iter().chain(sections.iter().flatten()) {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

fn section_for(sections: &[Vec<String>], candidate: &IceCandidate) -> Option<usize> {
    if sections.is_empty() {
        return None;
    }
    if let Some(mid) = candidate.sdp_mid.as_deref() {
        let wanted = format!("a=mid:{mid}");
        if let Some(index) = sections
            .iter()
            .position(|section| section.iter().any(|line| line == &wanted))
        {
            return Some(index);
        }
    }
    usize::try_from(candidate.sdp_mline_index)
        .ok()
        .filter(|index| *index < sections.len())
        .or(Some(sections.len() - 1))
}
