//! nido: single-device monitoring hub
//!
//! A long-running process that owns a camera and a microphone, evaluates
//! their state continuously, and fans derived events out to a dynamic set
//! of subscribing clients over whatever transport hosts them.
//!
//! # Architecture
//!
//! - **Hub**: the single-writer event loop owning the session registry,
//!   capability-filtered broadcast routing, configuration and the audio
//!   pipeline lifecycle. Everything else posts messages to it.
//! - **Camera arbiter**: exclusive camera ownership, mediating between
//!   live streaming (subscriber demand) and the motion engine's periodic
//!   snapshots.
//! - **Motion engine**: adaptive snapshot loop with brightness-driven
//!   night-mode control and outlier-based movement classification.
//! - **Audio pipeline**: dedicated thread turning blocking device reads
//!   into A-law packets and per-second volume levels.
//! - **Devices**: trait seams for the hardware layer; `testkit` provides
//!   scripted fakes so the whole system runs without hardware.
//!
//! # Example
//!
//! ```ignore
//! use nido::{Devices, Hub, HubConfig};
//!
//! let hub = Hub::spawn(devices, HubConfig::default());
//! let (session, mut events) = hub.connect().await?;
//! hub.handle_raw(session, r#"{"action":"_startstream"}"#).await?;
//! while let Some(event) = events.recv().await {
//!     // forward to the client transport
//! }
//! ```

pub mod arbiter;
pub mod audio;
pub mod config;
pub mod device;
pub mod frame;
pub mod hub;
pub mod message;
pub mod motion;

// Core entry points
pub use hub::{Capabilities, Hub, HubHandle, HubStats, SessionId};

// Components
pub use arbiter::{ArbiterState, CameraArbiter};
pub use audio::{AudioPipeline, LevelWindow};
pub use motion::{Brightness, MotionEngine, PictureStore, ScoreWindow};

// Configuration
pub use config::{AudioConfig, ConfigPatch, DeviceConfig, HubConfig, MotionConfig};

// Device seams
pub use device::{
    AudioChunk, AudioInput, AudioStream, Camera, CaptureSettings, DeviceError, Devices,
    LightSwitch, RecordingParams, Snapshot, SystemControl,
};

// Protocol types
pub use frame::{FrameAssembler, FrameKind, RecordedChunk, VideoFrame};
pub use message::{AudioPacket, ControlMessage, Event, MessageError, Movement, SystemStatus};
