//! Camera arbitration
//!
//! The camera is an exclusive resource with two competing consumers: live
//! streaming (driven by aggregate subscriber demand) and the motion
//! engine's periodic snapshots. The arbiter owns the state machine that
//! keeps them mutually exclusive:
//!
//! Idle → Streaming   when demand becomes ≥ 1 (deferred while a snapshot
//!                    is in flight; streaming wins once it completes)
//! Streaming → Idle   when demand returns to 0
//! Idle → Snapshotting → Idle   per snapshot request; requests during
//!                    Streaming are refused immediately with `Busy`
//!
//! Device calls block, so they run on the blocking pool; the streaming
//! task itself waits on a cancellation token and always releases the
//! camera and the lights, whichever way it ends.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Camera, CaptureSettings, DeviceError, FrameSink, LightSwitch, RecordingParams, Snapshot};
use crate::frame::{FrameAssembler, VideoFrame};

/// Who currently owns the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    Streaming,
    Snapshotting,
}

/// Receives assembled frames from the recording callback context.
pub type FrameHandler = Arc<dyn Fn(VideoFrame) + Send + Sync>;

struct Shared {
    state: ArbiterState,
    /// Number of sessions currently wanting video
    demand: usize,
    /// A stream start arrived while a snapshot was in flight
    pending_stream: bool,
    /// Lights state to apply while streaming (night mode or explicit wish)
    stream_lights: bool,
    /// Exposure mode for the next recording start
    night_mode: bool,
    cancel: Option<CancellationToken>,
}

struct Inner {
    camera: Arc<dyn Camera>,
    lights: Arc<dyn LightSwitch>,
    on_frame: FrameHandler,
    shared: Mutex<Shared>,
}

/// The arbiter handle; cheap to clone.
#[derive(Clone)]
pub struct CameraArbiter {
    inner: Arc<Inner>,
}

impl CameraArbiter {
    pub fn new(
        camera: Arc<dyn Camera>,
        lights: Arc<dyn LightSwitch>,
        on_frame: FrameHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                camera,
                lights,
                on_frame,
                shared: Mutex::new(Shared {
                    state: ArbiterState::Idle,
                    demand: 0,
                    pending_stream: false,
                    stream_lights: false,
                    night_mode: false,
                    cancel: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ArbiterState {
        self.inner.shared.lock().unwrap().state
    }

    /// Aggregate video-subscriber demand.
    pub fn streaming_demand(&self) -> usize {
        self.inner.shared.lock().unwrap().demand
    }

    /// Exposure mode used when the next recording starts.
    pub fn set_night_mode(&self, night: bool) {
        self.inner.shared.lock().unwrap().night_mode = night;
    }

    /// Desired lights state while streaming. Applied immediately when a
    /// stream is live; remembered for the next stream start otherwise.
    pub fn set_stream_lights(&self, on: bool) {
        let apply = {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.stream_lights = on;
            shared.state == ArbiterState::Streaming
        };
        if apply {
            self.inner.lights.set_lights(on);
        }
    }

    /// Adjust streaming demand by one subscriber.
    ///
    /// Called synchronously from the control-message handler so a stop
    /// followed by an immediate disconnect cannot leave a dangling stream.
    pub fn request_streaming(&self, on: bool) {
        let mut shared = self.inner.shared.lock().unwrap();
        if on {
            shared.demand += 1;
            if shared.demand > 1 {
                return;
            }
            match shared.state {
                ArbiterState::Snapshotting => {
                    debug!("stream start deferred until snapshot completes");
                    shared.pending_stream = true;
                }
                ArbiterState::Idle => self.start_stream_locked(&mut shared),
                ArbiterState::Streaming => {}
            }
        } else {
            if shared.demand == 0 {
                return;
            }
            shared.demand -= 1;
            if shared.demand > 0 {
                return;
            }
            shared.pending_stream = false;
            if let Some(cancel) = shared.cancel.take() {
                cancel.cancel();
            }
        }
    }

    fn start_stream_locked(&self, shared: &mut Shared) {
        let token = CancellationToken::new();
        shared.state = ArbiterState::Streaming;
        shared.cancel = Some(token.clone());

        let arbiter = self.clone();
        let lights_on = shared.stream_lights;
        let params = RecordingParams {
            night_mode: shared.night_mode,
        };
        tokio::spawn(async move {
            arbiter.run_stream(token, lights_on, params).await;
        });
    }

    /// The streaming task: acquire lights and recording, hold until
    /// cancelled, then release everything. Cleanup runs on every exit
    /// path, including a cancellation racing the natural end.
    async fn run_stream(&self, token: CancellationToken, lights_on: bool, params: RecordingParams) {
        info!(night_mode = params.night_mode, "video stream starting");
        self.inner.lights.set_lights(lights_on);

        let camera = Arc::clone(&self.inner.camera);
        let sink = self.make_sink();
        let started =
            tokio::task::spawn_blocking(move || camera.start_recording(params, sink)).await;

        let failed = match started {
            Ok(Ok(())) => {
                token.cancelled().await;
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to start recording");
                true
            }
            Err(e) => {
                warn!(error = %e, "recording start task failed");
                true
            }
        };

        // Release the camera and the lights no matter how we got here
        let camera = Arc::clone(&self.inner.camera);
        if tokio::task::spawn_blocking(move || camera.stop_recording())
            .await
            .is_err()
        {
            warn!("recording stop task failed");
        }
        self.inner.lights.set_lights(false);
        info!("video stream stopped");

        let mut shared = self.inner.shared.lock().unwrap();
        shared.cancel = None;
        if !failed && shared.demand > 0 {
            // Demand came back while we were shutting down; restart
            self.start_stream_locked(&mut shared);
        } else {
            shared.state = ArbiterState::Idle;
        }
    }

    fn make_sink(&self) -> FrameSink {
        let mut assembler = FrameAssembler::new();
        let on_frame = Arc::clone(&self.inner.on_frame);
        Box::new(move |chunk| {
            if let Some(frame) = assembler.push(chunk) {
                on_frame(frame);
            }
        })
    }

    /// Take a single still picture.
    ///
    /// Refused with `Busy` unless the arbiter is idle. With night mode the
    /// lights are lit for a short settle period and always turned off
    /// again, also when the capture fails.
    pub async fn request_snapshot(
        &self,
        settings: CaptureSettings,
        settle: Duration,
    ) -> Result<Snapshot, DeviceError> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.state != ArbiterState::Idle {
                return Err(DeviceError::Busy);
            }
            shared.state = ArbiterState::Snapshotting;
        }

        let result = self.capture_with_lights(settings, settle).await;

        let mut shared = self.inner.shared.lock().unwrap();
        shared.state = ArbiterState::Idle;
        if shared.pending_stream {
            shared.pending_stream = false;
            if shared.demand > 0 {
                self.start_stream_locked(&mut shared);
            }
        }
        result
    }

    async fn capture_with_lights(
        &self,
        settings: CaptureSettings,
        settle: Duration,
    ) -> Result<Snapshot, DeviceError> {
        if settings.night_mode {
            self.inner.lights.set_lights(true);
            tokio::time::sleep(settle).await;
        }

        let camera = Arc::clone(&self.inner.camera);
        let captured = tokio::task::spawn_blocking(move || camera.capture(settings)).await;

        if settings.night_mode {
            self.inner.lights.set_lights(false);
        }

        match captured {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(DeviceError::CaptureFailed(e.to_string())),
            Err(e) => Err(DeviceError::CaptureFailed(format!("capture task: {}", e))),
        }
    }
}
