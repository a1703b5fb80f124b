use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::RtcError;
use crate::signaling::normalize_signaling_url;
use crate::types::IceServer;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CORRELATED_FRAMES: usize = 10;
pub const DATA_CHANNEL_LABEL: &str = "dataChannel";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Session configuration supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// Raw signaling endpoint as the user entered it; normalized on connect.
    pub signaling_url: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub data_channel_label: String,
    pub connect_timeout: Duration,
    /// Frames the correlator will read while waiting for one response.
    pub max_correlated_frames: usize,
    pub ice_servers: Vec<IceServer>,
    pub relay_only: bool,
    /// Sent as `{"ParticipantID": …}` once the data channel opens.
    pub participant_id: Option<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            signaling_url: None,
            audio_enabled: false,
            video_enabled: true,
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_correlated_frames: DEFAULT_MAX_CORRELATED_FRAMES,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            relay_only: true,
            participant_id: None,
        }
    }
}

impl RtcConfig {
    /// Load configuration from `VITALS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.signaling_url = lookup("VITALS_SIGNALING_URL").filter(|v| !v.trim().is_empty());
        if let Some(value) = lookup("VITALS_RTC_AUDIO") {
            config.audio_enabled = truthy(&value);
        }
        if let Some(value) = lookup("VITALS_RTC_VIDEO") {
            config.video_enabled = truthy(&value);
        }
        if let Some(secs) = lookup("VITALS_RTC_CONNECT_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("VITALS_RTC_RELAY_ONLY") {
            config.relay_only = truthy(&value);
        }
        if let Some(raw) = lookup("VITALS_RTC_ICE_SERVERS") {
            match serde_json::from_str::<Vec<IceServer>>(&raw) {
                Ok(servers) if !servers.is_empty() => config.ice_servers = servers,
                Ok(_) => {}
                Err(err) => warn!(
                    target = "vitals_rtc::config",
                    error = %err,
                    "ignoring unparsable VITALS_RTC_ICE_SERVERS"
                ),
            }
        }
        config.participant_id = lookup("VITALS_PARTICIPANT_ID").filter(|v| !v.trim().is_empty());
        config
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.audio_enabled = enabled;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_relay_only(mut self, relay_only: bool) -> Self {
        self.relay_only = relay_only;
        self
    }

    pub fn with_participant_id(mut self, id: impl Into<String>) -> Self {
        self.participant_id = Some(id.into());
        self
    }

    /// `relay_only` with no TURN server gathers no candidates at all.
    pub fn relay_without_turn(&self) -> bool {
        self.relay_only && !has_turn_server(&self.ice_servers)
    }

    /// Validate and normalize the signaling endpoint. Runs before any network
    /// activity so configuration mistakes never reach the transport.
    pub fn signaling_endpoint(&self) -> Result<Url, RtcError> {
        let raw = self
            .signaling_url
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or(RtcError::MissingSignalingServer)?;
        normalize_signaling_url(raw).map_err(|err| RtcError::MalformedUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })
    }
}

pub(crate) fn has_turn_server(servers: &[IceServer]) -> bool {
    servers.iter().flat_map(|server| &server.urls).any(|url| {
        let url = url.trim().to_ascii_lowercase();
        url.starts_with("turn:") || url.starts_with("turns:")
    })
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
