//! Video frame types and chunk assembly
//!
//! While recording, the camera delivers raw byte chunks from its own
//! callback context, flagged with hardware-reported frame boundaries.
//! `FrameAssembler` accumulates those chunks and emits exactly one
//! `VideoFrame` per boundary; a partial buffer is never visible outside
//! this module.

use bytes::{Bytes, BytesMut};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// What a video frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Regular picture data
    Delta = 0,
    /// Codec configuration (parameter sets); clients need this before
    /// they can decode anything else
    CodecHeader = 1,
}

impl Serialize for FrameKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for FrameKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(FrameKind::Delta),
            1 => Ok(FrameKind::CodecHeader),
            n => Err(de::Error::custom(format!("invalid frame kind {}", n))),
        }
    }
}

/// One complete encoded video frame, as broadcast to subscribed sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrame {
    /// Monotonic presentation timestamp in milliseconds since recording start
    pub pts: u64,
    /// Byte offset of this frame within the recording's stream
    pub offset: u64,
    /// Wall-clock time of emission, unix milliseconds
    pub timestamp: u64,
    pub data: Bytes,
    #[serde(rename = "type")]
    pub kind: FrameKind,
}

/// A raw chunk handed over by the camera while recording.
#[derive(Debug, Clone)]
pub struct RecordedChunk {
    pub data: Bytes,
    /// Hardware-reported frame boundary: this chunk ends a frame
    pub complete: bool,
    /// Kind of the frame this chunk belongs to
    pub kind: FrameKind,
    /// Hardware presentation timestamp in microseconds, when available
    pub pts_us: Option<u64>,
}

/// Accumulates recorded chunks into whole frames.
pub struct FrameAssembler {
    buf: BytesMut,
    offset: u64,
    started: Instant,
    last_pts: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            offset: 0,
            started: Instant::now(),
            last_pts: 0,
        }
    }

    /// Feed one chunk. Returns a frame when the chunk closes a hardware
    /// frame boundary, `None` while the frame is still partial.
    pub fn push(&mut self, chunk: RecordedChunk) -> Option<VideoFrame> {
        self.buf.extend_from_slice(&chunk.data);
        if !chunk.complete {
            return None;
        }

        let data = self.buf.split().freeze();
        if data.is_empty() {
            return None;
        }

        let pts = self.next_pts(chunk.pts_us);
        let offset = self.offset;
        self.offset += data.len() as u64;

        Some(VideoFrame {
            pts,
            offset,
            timestamp: unix_millis(),
            data,
            kind: chunk.kind,
        })
    }

    /// Prefer the hardware timestamp, fall back to elapsed wall time;
    /// either way pts never goes backwards.
    fn next_pts(&mut self, hardware_us: Option<u64>) -> u64 {
        let candidate = match hardware_us {
            Some(us) => us / 1_000,
            None => self.started.elapsed().as_millis() as u64,
        };
        self.last_pts = candidate.max(self.last_pts);
        self.last_pts
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &'static [u8], complete: bool, pts_us: Option<u64>) -> RecordedChunk {
        RecordedChunk {
            data: Bytes::from_static(data),
            complete,
            kind: FrameKind::Delta,
            pts_us,
        }
    }

    #[test]
    fn partial_chunks_emit_nothing() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(chunk(b"aa", false, None)).is_none());
        assert!(assembler.push(chunk(b"bb", false, None)).is_none());
    }

    #[test]
    fn boundary_emits_accumulated_frame() {
        let mut assembler = FrameAssembler::new();
        assembler.push(chunk(b"aa", false, Some(0)));
        assembler.push(chunk(b"bb", false, Some(0)));
        let frame = assembler.push(chunk(b"cc", true, Some(33_000))).unwrap();
        assert_eq!(&frame.data[..], b"aabbcc");
        assert_eq!(frame.pts, 33);
        assert_eq!(frame.offset, 0);
    }

    #[test]
    fn offset_advances_per_frame() {
        let mut assembler = FrameAssembler::new();
        let first = assembler.push(chunk(b"abcd", true, Some(0))).unwrap();
        let second = assembler.push(chunk(b"ef", true, Some(66_000))).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 4);
    }

    #[test]
    fn pts_never_regresses() {
        let mut assembler = FrameAssembler::new();
        let first = assembler.push(chunk(b"a", true, Some(100_000))).unwrap();
        let second = assembler.push(chunk(b"b", true, Some(50_000))).unwrap();
        assert_eq!(first.pts, 100);
        assert_eq!(second.pts, 100);
    }

    #[test]
    fn empty_boundary_is_dropped() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(chunk(b"", true, None)).is_none());
    }

    #[test]
    fn header_kind_is_preserved() {
        let mut assembler = FrameAssembler::new();
        let frame = assembler
            .push(RecordedChunk {
                data: Bytes::from_static(b"sps"),
                complete: true,
                kind: FrameKind::CodecHeader,
                pts_us: Some(0),
            })
            .unwrap();
        assert_eq!(frame.kind, FrameKind::CodecHeader);
    }

    #[test]
    fn frame_kind_serializes_as_integer() {
        let json = serde_json::to_value(FrameKind::CodecHeader).unwrap();
        assert_eq!(json, serde_json::json!(1));
        let back: FrameKind = serde_json::from_value(serde_json::json!(0)).unwrap();
        assert_eq!(back, FrameKind::Delta);
    }
}
