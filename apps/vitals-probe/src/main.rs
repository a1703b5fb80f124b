use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vitals_rtc::{RtcConfig, RtcSession, SessionEvent, WebRtcPeerFactory};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "vitals-probe",
    version,
    about = "Connect to a vitals signaling server and print what comes back"
)]
struct Cli {
    /// Signaling server URL; http(s) schemes are rewritten to ws(s).
    #[arg(long, env = "VITALS_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Also send an audio track.
    #[arg(long)]
    audio: bool,

    /// Allow host and server-reflexive candidates instead of relay only.
    #[arg(long)]
    allow_direct: bool,

    /// Seconds to wait for the peer connection to come up.
    #[arg(long, env = "VITALS_RTC_CONNECT_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Participant id announced once the data channel opens.
    #[arg(long, env = "VITALS_PARTICIPANT_ID")]
    participant_id: Option<String>,

    /// Stay connected this long before ending the session. Ctrl-C ends earlier.
    #[arg(long, default_value_t = 60)]
    hold_secs: u64,

    /// Ask the backend for a final prediction before disconnecting.
    #[arg(long)]
    end_session: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info,vitals_rtc=debug")]
    log: String,
}

impl Cli {
    fn rtc_config(&self) -> RtcConfig {
        let mut config = RtcConfig::from_env();
        if let Some(url) = &self.signaling_url {
            config = config.with_signaling_url(url.clone());
        }
        if self.audio {
            config = config.with_audio(true);
        }
        if self.allow_direct {
            config = config.with_relay_only(false);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(id) = &self.participant_id {
            config = config.with_participant_id(id.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log);

    let (observer, mut events) = mpsc::unbounded_channel();
    let session = RtcSession::new(cli.rtc_config(), Arc::new(WebRtcPeerFactory), Some(observer));

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    session
        .connect()
        .await
        .context("failed to establish the vitals session")?;
    info!(hold_secs = cli.hold_secs, "session connected");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.hold_secs)) => {}
        _ = signal::ctrl_c() => info!("interrupted"),
    }

    if cli.end_session && session.is_connected() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        session
            .end_session(move |record| {
                let _ = done_tx.send(record);
            })
            .await;
        match tokio::time::timeout(Duration::from_secs(15), done_rx).await {
            Ok(Ok(record)) => println!(
                "final: {}",
                serde_json::to_string(&record).context("failed to encode final prediction")?
            ),
            Ok(Err(_)) => warn!("session closed before a final prediction arrived"),
            Err(_) => warn!("no final prediction within 15s"),
        }
    }

    session.disconnect().await;
    drop(session);
    printer.abort();
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Prediction(record) | SessionEvent::FinalPrediction(record) => {
            let label = if record.is_final { "final" } else { "prediction" };
            match serde_json::to_string(record) {
                Ok(json) => println!("{label}: {json}"),
                Err(err) => warn!(error = %err, "failed to encode prediction"),
            }
        }
        SessionEvent::BinaryMessage(bytes) => println!("binary message: {} bytes", bytes.len()),
        other => println!("{other:?}"),
    }
}
