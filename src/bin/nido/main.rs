//! nido demo binary
//!
//! Runs the full hub against the in-memory test devices, attaches one
//! local session and logs what it receives. Useful for poking at the
//! system without hardware or a client.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=nido=debug nido
//!
//! # Start in night mode with a fast motion cycle
//! NIDO_NIGHT_MODE=1 NIDO_MOTION_IDLE_SECS=5 nido
//! ```

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use nido::{Devices, Event, Hub, HubConfig, LightSwitch, SystemControl};

/// Demo configuration from environment, `NIDO_*` overrides on defaults.
fn config_from_env() -> HubConfig {
    let mut config = HubConfig::default();

    if let Some(secs) = env_parse::<u64>("NIDO_MOTION_IDLE_SECS") {
        config.motion.idle_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_parse::<u64>("NIDO_MOTION_ALERT_SECS") {
        config.motion.alert_interval = Duration::from_secs(secs);
    }
    if let Some(gain) = env_parse::<f32>("NIDO_AUDIO_GAIN") {
        config.audio.gain = gain;
    }
    config.initial_config.night_mode = env_parse::<u8>("NIDO_NIGHT_MODE").unwrap_or(0) != 0;

    config
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Lights end up in the log instead of a GPIO pin.
struct LoggingLights;

impl LightSwitch for LoggingLights {
    fn set_lights(&self, on: bool) {
        info!(on, "lights");
    }
}

/// OS actions are only announced here.
struct LoggingSystem;

impl SystemControl for LoggingSystem {
    fn shutdown(&self) {
        warn!("shutdown requested (not executed by the demo)");
    }

    fn restart(&self) {
        warn!("restart requested (not executed by the demo)");
    }
}

#[cfg(feature = "test-source")]
fn build_devices() -> Result<Devices> {
    use nido::device::testkit::{FakeCamera, ToneAudio};
    use std::sync::Arc;

    let camera = FakeCamera::new();
    camera.set_default_luma(128);

    Ok(Devices {
        camera: Arc::new(camera),
        audio: Arc::new(ToneAudio::default()),
        lights: Arc::new(LoggingLights),
        system: Arc::new(LoggingSystem),
    })
}

#[cfg(not(feature = "test-source"))]
fn build_devices() -> Result<Devices> {
    anyhow::bail!("built without a device backend; enable the test-source feature")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nido=info".parse().unwrap()),
        )
        .init();

    let devices = build_devices()?;

    // The devices must be reachable before anything else runs
    devices
        .audio
        .open()
        .map(drop)
        .context("audio device unavailable")?;

    let hub = Hub::spawn(devices, config_from_env());

    // Attach a local session and narrate what a client would see
    let (session, mut events) = hub.connect().await?;
    info!(%session, "local session attached");
    hub.handle_raw(session, r#"{"action":"startaudio"}"#)
        .await
        .ok();

    let watcher = tokio::spawn(async move {
        let mut audio_packets: u64 = 0;
        while let Some(event) = events.recv().await {
            match event {
                Event::Volume { volume } => info!(volume, "volume"),
                Event::Movement { movement } => info!(
                    value = movement.value,
                    moved = movement.moved,
                    next_ms = movement.interval_millis,
                    "movement"
                ),
                Event::Configuration { configuration } => {
                    info!(?configuration, "configuration")
                }
                Event::SystemStatus { status } => info!(?status, "system status"),
                Event::Audio { .. } => {
                    audio_packets += 1;
                    if audio_packets % 500 == 0 {
                        info!(audio_packets, "audio packets received");
                    }
                }
                Event::Video { .. } | Event::Heartbeat => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hub.shutdown();
    watcher.abort();
    Ok(())
}
