//! Runtime configuration for the monitoring hub
//!
//! `DeviceConfig` is the client-visible configuration snapshot that is
//! broadcast on every change. The remaining structs collect the tuning
//! parameters of the individual components; the defaults match the values
//! the hardware was tuned with, but everything is overridable at
//! construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-visible device configuration.
///
/// Mutated by `configuration_update` messages or by the motion engine's
/// brightness-triggered mode flips. Every mutation broadcasts the full
/// snapshot to all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Low-light exposure mode; also turns lights on during captures
    pub night_mode: bool,
    /// Whether the motion detection engine is active
    pub motion_detection: bool,
}

/// Partial configuration carried by a `configuration_update` message.
/// Absent fields leave the current value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_detection: Option<bool>,
}

impl DeviceConfig {
    /// Apply a partial update, returning true if anything changed.
    pub fn apply(&mut self, patch: &ConfigPatch) -> bool {
        let before = *self;
        if let Some(night) = patch.night_mode {
            self.night_mode = night;
        }
        if let Some(motion) = patch.motion_detection {
            self.motion_detection = motion;
        }
        *self != before
    }
}

/// Motion engine tuning.
///
/// The brightness thresholds and the statistics window size are empirically
/// tuned values carried over from the deployed device; they are exposed here
/// rather than hard-coded.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Poll tick; the loop wakes this often and checks whether a capture is due
    pub tick: Duration,
    /// Capture interval while no motion was recently detected
    pub idle_interval: Duration,
    /// Capture interval right after motion was detected
    pub alert_interval: Duration,
    /// Capacity of the rolling score window used for mean/stddev
    pub window_capacity: usize,
    /// Fraction of pixels in the darkest histogram bin that flags "too dark"
    pub dark_fraction: f64,
    /// Fraction of pixels in the brightest histogram bin that flags "too bright"
    pub bright_fraction: f64,
    /// A score is "moved" when it deviates from the window mean by more
    /// than this many standard deviations
    pub outlier_sigma: f64,
    /// Settle time with lights on before a night-mode capture
    pub light_settle: Duration,
    /// Snapshot resolution used for motion analysis
    pub analysis_size: (u32, u32),
    /// Resolution used when a fresh picture is explicitly requested
    pub retrieval_size: (u32, u32),
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            idle_interval: Duration::from_secs(20),
            alert_interval: Duration::from_secs(4),
            window_capacity: 20,
            dark_fraction: 0.99,
            bright_fraction: 0.70,
            outlier_sigma: 2.0,
            light_settle: Duration::from_millis(100),
            analysis_size: (640, 480),
            retrieval_size: (1280, 960),
        }
    }
}

/// Audio pipeline tuning.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Target sample rate the device chunks are resampled to
    pub target_rate: u32,
    /// Amplitude gain applied before level computation and encoding
    pub gain: f32,
    /// How much history of per-second levels is retained
    pub level_window: usize,
    /// Which percentile of the per-second level batch is broadcast
    pub level_percentile: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_rate: 8_000,
            gain: 3.0,
            level_window: 120,
            level_percentile: 0.75,
        }
    }
}

/// Hub and session plumbing.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Heartbeat interval per session
    pub heartbeat_interval: Duration,
    /// Capacity of each session's outbound event channel
    pub session_channel_capacity: usize,
    /// Capacity of the hub's ingress queue (control + media handoff)
    pub ingress_capacity: usize,
    /// Pause between the system-status broadcast and the OS action
    pub shutdown_grace: Duration,
    /// Device configuration at startup; clients mutate it from there
    pub initial_config: DeviceConfig,
    pub motion: MotionConfig,
    pub audio: AudioConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            session_channel_capacity: 64,
            ingress_capacity: 256,
            shutdown_grace: Duration::from_secs(2),
            // Monitoring is the device's job; clients may turn it off
            initial_config: DeviceConfig {
                night_mode: false,
                motion_detection: true,
            },
            motion: MotionConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}
