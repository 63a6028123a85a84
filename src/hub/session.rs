//! Per-subscriber session state

use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Event;

/// Opaque handle identifying one connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A session's interest in each event category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub wants_video: bool,
    pub wants_audio: bool,
    pub wants_lights: bool,
}

/// One connected subscriber, owned exclusively by the hub task.
pub(crate) struct Session {
    pub id: SessionId,
    pub caps: Capabilities,
    /// Bounded outbound channel; the transport drains the other end
    pub tx: mpsc::Sender<Event>,
    pub connected_at: Instant,
    /// Updated on every successfully delivered heartbeat
    pub last_alive: Instant,
    /// Cancels this session's heartbeat task
    pub heartbeat: CancellationToken,
}

impl Session {
    pub fn new(id: SessionId, tx: mpsc::Sender<Event>, heartbeat: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            caps: Capabilities::default(),
            tx,
            connected_at: now,
            last_alive: now,
            heartbeat,
        }
    }
}
