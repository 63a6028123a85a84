//! Control and event message types
//!
//! Inbound control messages and outbound events are JSON objects tagged by
//! an `action` field. The shapes here are the protocol contract with
//! clients; the transport that carries them (websocket, bot bridge, test
//! harness) is not this crate's concern.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigPatch, DeviceConfig};
use crate::frame::VideoFrame;

/// Why an inbound message could not be dispatched.
///
/// These are logged per connection and never tear the connection down.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("action missing from message")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("malformed {action:?} message: {source}")]
    Malformed {
        action: String,
        source: serde_json::Error,
    },
}

/// Inbound control message kinds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum ControlMessage {
    /// Shut the machine down (after a status broadcast and a grace pause)
    #[serde(rename = "shutdown")]
    Shutdown,
    /// Reboot the machine (same choreography as shutdown)
    #[serde(rename = "restart")]
    Restart,
    /// Legacy stream toggle, kept for old clients; has no effect
    #[serde(rename = "startstream")]
    LegacyStartStream,
    #[serde(rename = "stopstream")]
    LegacyStopStream,
    /// Subscribe this session to live video frames
    #[serde(rename = "_startstream")]
    StartStream,
    #[serde(rename = "_stopstream")]
    StopStream,
    /// Subscribe this session to raw audio packets
    #[serde(rename = "startaudio")]
    StartAudio,
    #[serde(rename = "stopaudio")]
    StopAudio,
    /// Enable or disable the motion detection engine
    #[serde(rename = "motiondetect")]
    MotionDetect {
        #[serde(default)]
        value: bool,
    },
    /// Request lights to be on while anyone is streaming
    #[serde(rename = "lights")]
    Lights {
        #[serde(default)]
        lights: u8,
    },
    /// Apply the present fields and broadcast the new configuration
    #[serde(rename = "configuration_update")]
    ConfigurationUpdate {
        #[serde(default)]
        configuration: ConfigPatch,
    },
    /// Ask for a configuration broadcast
    #[serde(rename = "configuration_request")]
    ConfigurationRequest,
}

impl ControlMessage {
    /// Parse a raw JSON control message.
    ///
    /// Distinguishes a missing `action`, an unknown `action`, and a known
    /// action with a bad payload, so callers can log something useful.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let action = value
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or(MessageError::MissingAction)?
            .to_string();

        serde_json::from_value(value).map_err(|source| {
            // serde reports an unknown tag as a variant error on the action
            if source.to_string().contains("unknown variant") {
                MessageError::UnknownAction(action)
            } else {
                MessageError::Malformed { action, source }
            }
        })
    }
}

/// One encoded audio packet plus its presentation timestamp (millis,
/// relative to pipeline start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub data: Bytes,
    pub pts: u64,
}

/// One motion detection result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    /// Dissimilarity score in [0, 1]; 0 = identical to previous picture
    pub value: f64,
    /// Whether the score was classified as movement
    pub moved: bool,
    /// The interval until the next capture, chosen adaptively
    pub interval_millis: u64,
}

/// Outbound event kinds pushed to sessions.
///
/// `Video` and `Audio` are filtered by each session's capability flags;
/// everything else is delivered to every session. `Heartbeat` is produced
/// per session on its own interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum Event {
    #[serde(rename = "volume")]
    Volume { volume: f64 },
    #[serde(rename = "audio")]
    Audio { audio: AudioPacket },
    #[serde(rename = "vframe")]
    Video {
        #[serde(flatten)]
        frame: VideoFrame,
    },
    #[serde(rename = "movement")]
    Movement { movement: Movement },
    #[serde(rename = "configuration")]
    Configuration { configuration: DeviceConfig },
    #[serde(rename = "systemstatus")]
    SystemStatus { status: SystemStatus },
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// System lifecycle states broadcast before OS actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemStatus {
    ShuttingDown,
    Restarting,
}
