//! Device capability seams
//!
//! The physical driver layer (how a picture is captured, how PCM samples
//! are read, how the light GPIO is toggled) lives outside this crate.
//! These traits are the contract the core calls into; the `testkit`
//! module provides scripted in-memory implementations for development and
//! tests.

use bytes::Bytes;
use thiserror::Error;
use std::sync::Arc;

use crate::frame::RecordedChunk;

#[cfg(feature = "test-source")]
pub mod testkit;

/// The crate-wide device error taxonomy.
///
/// `Unavailable` is fatal at startup only. `Busy` is the expected
/// arbitration signal and not an error condition; callers retry on their
/// next natural cycle. `CaptureFailed` is transient and swallowed at the
/// component that sees it.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("camera is busy")]
    Busy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Exposure and resolution settings for a single still capture.
///
/// Settings are per-call; the driver must not keep them once the capture
/// returns, so a resolution override never outlives its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub night_mode: bool,
}

/// Exposure settings for continuous recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingParams {
    pub night_mode: bool,
}

/// A single still capture.
///
/// Drivers deliver both the decoded grayscale plane (for motion analysis)
/// and the original encoded image (for retrieval endpoints).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    /// 8-bit grayscale pixels, row-major, `width * height` bytes
    pub luma: Bytes,
    /// The encoded (e.g. JPEG) image as captured
    pub encoded: Bytes,
}

/// Callback the camera invokes with raw data while recording.
///
/// Called from the camera's own context; implementations must hand the
/// chunk off and return quickly.
pub type FrameSink = Box<dyn FnMut(RecordedChunk) + Send + 'static>;

/// An exclusive camera device.
///
/// `capture` blocks for the duration of the exposure and is always called
/// off the async runtime. Recording is push-based: chunks arrive on the
/// sink until `stop_recording`.
pub trait Camera: Send + Sync + 'static {
    fn capture(&self, settings: CaptureSettings) -> Result<Snapshot, DeviceError>;
    fn start_recording(&self, params: RecordingParams, sink: FrameSink)
        -> Result<(), DeviceError>;
    fn stop_recording(&self);
}

/// One chunk of interleaved samples from the audio device.
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    /// Interleaved samples in -1.0..1.0
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

/// A microphone-like device; `open` is called each time the audio pipeline
/// starts so a stopped pipeline leaves no stream behind.
pub trait AudioInput: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn AudioStream>, DeviceError>;
}

/// An open capture stream. `read_chunk` blocks until samples are available
/// and therefore runs on a dedicated thread, never on the event loop.
pub trait AudioStream: Send {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError>;
}

/// The light actuator. Not exclusive; last write wins.
pub trait LightSwitch: Send + Sync + 'static {
    fn set_lights(&self, on: bool);
}

/// OS-level actions requested by clients.
pub trait SystemControl: Send + Sync + 'static {
    fn shutdown(&self);
    fn restart(&self);
}

/// The bundle of collaborators the hub is constructed with.
#[derive(Clone)]
pub struct Devices {
    pub camera: Arc<dyn Camera>,
    pub audio: Arc<dyn AudioInput>,
    pub lights: Arc<dyn LightSwitch>,
    pub system: Arc<dyn SystemControl>,
}
