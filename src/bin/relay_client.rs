//! Relay Voice Client
//!
//! Connects to the relay through the reconnect supervisor, joins the
//! configured frequencies and logs everything the relay reports.
//!
//! Usage: `relay-client [config.toml]`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_voice::{
    config::ClientConfig,
    network::{
        ConnectParams, FrequencyRoster, ReconnectSupervisor, SessionEvent, SupervisorEvent,
        TransportSession,
    },
};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn load_config() -> Result<ClientConfig> {
    if let Some(path) = std::env::args().nth(1) {
        return ClientConfig::load(&path).with_context(|| format!("loading {}", path));
    }
    match ClientConfig::default_path() {
        Some(path) if path.exists() => {
            tracing::info!("Using config {}", path.display());
            Ok(ClientConfig::load(&path)?)
        }
        _ => {
            tracing::info!("No config file found, using defaults");
            Ok(ClientConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Relay Voice client");

    let config = load_config()?;
    config.validate()?;

    #[cfg(feature = "device-playback")]
    if config.audio.device_playback {
        println!("\n=== Available Output Devices ===");
        for device in relay_voice::audio::list_output_devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}  channels {:?}", device.name, default_marker, device.channels);
        }
        println!();
    }

    let session = TransportSession::from_config(&config);
    let supervisor = ReconnectSupervisor::new(session.clone(), &config.reconnect);
    supervisor.set_connection_params(ConnectParams::from(&config.relay));

    let roster = Arc::new(FrequencyRoster::new());

    // Session events
    let mut session_events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = session_events.recv().await {
            match event {
                SessionEvent::Status(_) => {}
                SessionEvent::Error(message) => tracing::error!("Relay error: {}", message),
                SessionEvent::RxStateChanged {
                    display_name,
                    freq_id,
                    action,
                    ..
                } => tracing::info!("RX {:?} on {}: {}", action, freq_id, display_name),
                SessionEvent::FrequencyJoined {
                    freq_id,
                    listener_count,
                } => tracing::info!("Joined {} ({} listening)", freq_id, listener_count),
                SessionEvent::ListenerCount {
                    freq_id,
                    listener_count,
                } => tracing::info!("{} listening on {}", listener_count, freq_id),
                SessionEvent::MuteConfirmed { freq_id, muted } => {
                    tracing::info!("Frequency {} muted: {}", freq_id, muted)
                }
            }
        }
    });

    // Re-join after recovery
    let mut supervisor_events = supervisor.subscribe();
    {
        let session = session.clone();
        let roster = roster.clone();
        tokio::spawn(async move {
            while let Ok(event) = supervisor_events.recv().await {
                match event {
                    SupervisorEvent::Reconnected => {
                        roster.restore(&session).await;
                    }
                    SupervisorEvent::RetryScheduled { attempt, delay } => {
                        tracing::info!("Retry {} scheduled in {:?}", attempt + 1, delay);
                    }
                    SupervisorEvent::GaveUp => {
                        tracing::error!("Relay unreachable, giving up");
                    }
                    SupervisorEvent::StateChanged(_) => {}
                }
            }
        });
    }

    if !supervisor.connect().await? {
        anyhow::bail!("Could not connect to {}:{}", config.relay.host, config.relay.port);
    }

    for freq in config.frequencies.iter().filter(|f| f.enabled) {
        roster.join(&session, freq.id).await;
    }

    tracing::info!("Listening - press Ctrl+C to stop");

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_tick.tick() => {
                let stats = session.stats();
                tracing::info!(
                    "Stats: {} frames received, {} played, {} muted, {} decode errors, state {}",
                    stats.frames_received,
                    stats.frames_played,
                    stats.frames_muted,
                    stats.decode_errors,
                    supervisor.state()
                );
            }
        }
    }

    supervisor.shutdown().await;
    tracing::info!("Bye");
    Ok(())
}
