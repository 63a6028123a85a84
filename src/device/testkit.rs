//! Scripted in-memory devices
//!
//! Used by the integration tests and the demo binary so the whole hub can
//! run without camera or microphone hardware. Fakes record every call so
//! tests can assert on device interaction order.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{
    AudioChunk, AudioInput, AudioStream, Camera, CaptureSettings, DeviceError, FrameSink,
    LightSwitch, RecordingParams, Snapshot, SystemControl,
};
use crate::frame::RecordedChunk;

/// Build a snapshot with every pixel at the same brightness.
pub fn snapshot_uniform(width: u32, height: u32, luma: u8) -> Snapshot {
    snapshot_from_luma(width, height, vec![luma; (width * height) as usize])
}

/// Build a snapshot from explicit grayscale pixels.
pub fn snapshot_from_luma(width: u32, height: u32, luma: Vec<u8>) -> Snapshot {
    assert_eq!(luma.len(), (width * height) as usize);
    Snapshot {
        width,
        height,
        encoded: Bytes::from(luma.clone()),
        luma: Bytes::from(luma),
    }
}

#[derive(Default)]
struct FakeCameraInner {
    scripted: VecDeque<Result<Snapshot, DeviceError>>,
    captures: Vec<CaptureSettings>,
    recordings: Vec<RecordingParams>,
    sink: Option<FrameSink>,
    default_luma: u8,
}

/// A camera whose captures can be scripted per call.
///
/// Unscripted captures synthesize a uniform frame at `default_luma` so
/// long-running tests don't need an endless script.
#[derive(Clone)]
pub struct FakeCamera {
    inner: Arc<Mutex<FakeCameraInner>>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeCameraInner {
                default_luma: 128,
                ..Default::default()
            })),
        }
    }

    /// Queue the result of the next capture.
    pub fn script(&self, result: Result<Snapshot, DeviceError>) {
        self.inner.lock().unwrap().scripted.push_back(result);
    }

    /// Brightness used for synthesized captures when the script is empty.
    pub fn set_default_luma(&self, luma: u8) {
        self.inner.lock().unwrap().default_luma = luma;
    }

    /// All capture settings seen so far.
    pub fn captures(&self) -> Vec<CaptureSettings> {
        self.inner.lock().unwrap().captures.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().sink.is_some()
    }

    /// Recording parameters of every `start_recording` call.
    pub fn recordings(&self) -> Vec<RecordingParams> {
        self.inner.lock().unwrap().recordings.clone()
    }

    /// Push a chunk into the active recording sink, as the hardware
    /// callback would. Returns false when no recording is active.
    pub fn emit(&self, chunk: RecordedChunk) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.sink.as_mut() {
            Some(sink) => {
                sink(chunk);
                true
            }
            None => false,
        }
    }
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera for FakeCamera {
    fn capture(&self, settings: CaptureSettings) -> Result<Snapshot, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.captures.push(settings);
        match inner.scripted.pop_front() {
            Some(result) => result,
            None => Ok(snapshot_uniform(
                settings.width,
                settings.height,
                inner.default_luma,
            )),
        }
    }

    fn start_recording(
        &self,
        params: RecordingParams,
        sink: FrameSink,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sink.is_some() {
            return Err(DeviceError::CaptureFailed("already recording".into()));
        }
        inner.recordings.push(params);
        inner.sink = Some(sink);
        Ok(())
    }

    fn stop_recording(&self) {
        self.inner.lock().unwrap().sink = None;
    }
}

struct ScriptedAudioInner {
    queue: Mutex<VecDeque<AudioChunk>>,
    available: Condvar,
    active: AtomicUsize,
    opened: AtomicUsize,
}

/// An audio device fed by the test.
///
/// `read_chunk` returns queued chunks in order and yields empty "short
/// reads" while the queue is dry, so the pipeline loop keeps observing its
/// stop signal instead of blocking forever.
#[derive(Clone)]
pub struct ScriptedAudio {
    inner: Arc<ScriptedAudioInner>,
}

impl ScriptedAudio {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScriptedAudioInner {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                active: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Feed one chunk of interleaved samples.
    pub fn push(&self, chunk: AudioChunk) {
        self.inner.queue.lock().unwrap().push_back(chunk);
        self.inner.available.notify_one();
    }

    /// Streams currently open (pipeline instances alive).
    pub fn active_streams(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Streams opened since construction.
    pub fn opened_streams(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInput for ScriptedAudio {
    fn open(&self) -> Result<Box<dyn AudioStream>, DeviceError> {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedAudioStream {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct ScriptedAudioStream {
    inner: Arc<ScriptedAudioInner>,
}

impl AudioStream for ScriptedAudioStream {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError> {
        let mut queue = self.inner.queue.lock().unwrap();
        if let Some(chunk) = queue.pop_front() {
            return Ok(chunk);
        }
        let (mut queue, _) = self
            .inner
            .available
            .wait_timeout(queue, Duration::from_millis(20))
            .unwrap();
        Ok(queue.pop_front().unwrap_or_default())
    }
}

impl Drop for ScriptedAudioStream {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A free-running 440 Hz tone source for the demo binary.
pub struct ToneAudio {
    pub sample_rate: u32,
    pub chunk_millis: u64,
}

impl Default for ToneAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            chunk_millis: 20,
        }
    }
}

impl AudioInput for ToneAudio {
    fn open(&self) -> Result<Box<dyn AudioStream>, DeviceError> {
        Ok(Box::new(ToneStream {
            sample_rate: self.sample_rate,
            chunk_samples: (self.sample_rate as u64 * self.chunk_millis / 1_000) as usize,
            chunk_millis: self.chunk_millis,
            position: 0,
        }))
    }
}

struct ToneStream {
    sample_rate: u32,
    chunk_samples: usize,
    chunk_millis: u64,
    position: u64,
}

impl AudioStream for ToneStream {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError> {
        use std::f32::consts::PI;

        // Pace like real hardware would
        std::thread::sleep(Duration::from_millis(self.chunk_millis));

        let mut samples = Vec::with_capacity(self.chunk_samples);
        for _ in 0..self.chunk_samples {
            let t = self.position as f32 / self.sample_rate as f32;
            samples.push((2.0 * PI * 440.0 * t).sin() * 0.25);
            self.position += 1;
        }

        Ok(AudioChunk {
            samples,
            channels: 1,
            sample_rate: self.sample_rate,
        })
    }
}

/// Light actuator that records every write.
#[derive(Clone, Default)]
pub struct FakeLights {
    on: Arc<AtomicBool>,
    history: Arc<Mutex<Vec<bool>>>,
}

impl FakeLights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Every state written, in order.
    pub fn history(&self) -> Vec<bool> {
        self.history.lock().unwrap().clone()
    }
}

impl LightSwitch for FakeLights {
    fn set_lights(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
        self.history.lock().unwrap().push(on);
    }
}

/// Records requested OS actions instead of executing them.
#[derive(Clone, Default)]
pub struct FakeSystem {
    actions: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.actions.lock().unwrap().clone()
    }
}

impl SystemControl for FakeSystem {
    fn shutdown(&self) {
        self.actions.lock().unwrap().push("shutdown");
    }

    fn restart(&self) {
        self.actions.lock().unwrap().push("restart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[test]
    fn fake_camera_scripts_then_synthesizes() {
        let camera = FakeCamera::new();
        camera.script(Err(DeviceError::CaptureFailed("lens cap".into())));

        let settings = CaptureSettings {
            width: 4,
            height: 4,
            night_mode: false,
        };
        assert!(camera.capture(settings).is_err());

        let snapshot = camera.capture(settings).unwrap();
        assert_eq!(snapshot.luma.len(), 16);
        assert_eq!(camera.captures().len(), 2);
    }

    #[test]
    fn fake_camera_emits_only_while_recording() {
        let camera = FakeCamera::new();
        let chunk = RecordedChunk {
            data: Bytes::from_static(b"x"),
            complete: true,
            kind: FrameKind::Delta,
            pts_us: None,
        };
        assert!(!camera.emit(chunk.clone()));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&received);
        camera
            .start_recording(
                RecordingParams { night_mode: false },
                Box::new(move |c| sink_store.lock().unwrap().push(c)),
            )
            .unwrap();
        assert!(camera.is_recording());
        assert!(camera.emit(chunk));
        assert_eq!(received.lock().unwrap().len(), 1);

        camera.stop_recording();
        assert!(!camera.is_recording());
    }

    #[test]
    fn scripted_audio_counts_streams() {
        let audio = ScriptedAudio::new();
        assert_eq!(audio.active_streams(), 0);

        let stream = audio.open().unwrap();
        assert_eq!(audio.active_streams(), 1);
        assert_eq!(audio.opened_streams(), 1);

        drop(stream);
        assert_eq!(audio.active_streams(), 0);
        assert_eq!(audio.opened_streams(), 1);
    }

    #[test]
    fn scripted_audio_short_reads_when_dry() {
        let audio = ScriptedAudio::new();
        let mut stream = audio.open().unwrap();
        let chunk = stream.read_chunk().unwrap();
        assert!(chunk.samples.is_empty());

        audio.push(AudioChunk {
            samples: vec![0.5; 8],
            channels: 1,
            sample_rate: 8_000,
        });
        let chunk = stream.read_chunk().unwrap();
        assert_eq!(chunk.samples.len(), 8);
    }

    #[test]
    fn fake_lights_keep_history() {
        let lights = FakeLights::new();
        lights.set_lights(true);
        lights.set_lights(false);
        assert!(!lights.is_on());
        assert_eq!(lights.history(), vec![true, false]);
    }
}
