//! Adaptive motion detection
//!
//! A single loop polls on a short tick but only captures once an adaptive
//! interval has elapsed: short right after motion was seen, long
//! otherwise. Every usable capture is scored against the previous picture
//! with a structural-similarity based dissimilarity (0 = identical) and
//! classified as movement when it is a statistical outlier within the
//! rolling score window. Frames that are too dark or too bright instead
//! flip night mode and are discarded for comparison purposes.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbiter::CameraArbiter;
use crate::config::{DeviceConfig, MotionConfig};
use crate::device::{CaptureSettings, DeviceError, Snapshot};
use crate::message::Movement;

/// Where the engine reports its results.
///
/// Night-mode flips go through the hub's configuration setter rather than
/// a direct broadcast so there is a single source of configuration truth.
pub trait MotionSink: Send + Sync + 'static {
    fn movement(&self, movement: Movement);
    fn set_night_mode(&self, on: bool);
}

/// Fixed-capacity ring of recent dissimilarity scores.
#[derive(Debug, Clone)]
pub struct ScoreWindow {
    scores: Vec<f64>,
    capacity: usize,
    next: usize,
}

impl ScoreWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            scores: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Insert a score, overwriting the oldest entry at capacity.
    pub fn push(&mut self, score: f64) {
        if self.scores.len() < self.capacity {
            self.scores.push(score);
        } else {
            self.scores[self.next] = score;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Mean over the currently-held entries.
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64
    }

    /// Population standard deviation over the currently-held entries.
    pub fn stddev(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .scores
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f64>()
            / self.scores.len() as f64;
        variance.sqrt()
    }
}

/// Brightness classification of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brightness {
    TooDark,
    TooBright,
    Usable,
}

/// 10-bin intensity histogram of a grayscale plane.
pub fn histogram(luma: &[u8]) -> [u64; 10] {
    let mut bins = [0u64; 10];
    for &pixel in luma {
        bins[(pixel as usize * 10) / 256] += 1;
    }
    bins
}

/// Classify a histogram. Pure: the same histogram always classifies the
/// same way.
pub fn classify_brightness(bins: &[u64; 10], dark_fraction: f64, bright_fraction: f64) -> Brightness {
    let total: u64 = bins.iter().sum();
    if total == 0 {
        return Brightness::Usable;
    }
    let total = total as f64;
    if bins[0] as f64 / total >= dark_fraction {
        Brightness::TooDark
    } else if bins[9] as f64 / total >= bright_fraction {
        Brightness::TooBright
    } else {
        Brightness::Usable
    }
}

/// Dissimilarity between two equally-sized grayscale captures:
/// 1 − SSIM, clamped to [0, 1]. `None` when the sizes differ.
pub fn dissimilarity(previous: &Snapshot, current: &Snapshot) -> Option<f64> {
    if previous.width != current.width || previous.height != current.height {
        return None;
    }
    let similarity = ssim(
        &previous.luma,
        &current.luma,
        previous.width as usize,
        previous.height as usize,
    );
    Some((1.0 - similarity).clamp(0.0, 1.0))
}

/// Mean structural similarity over non-overlapping 8x8 windows,
/// with the standard constants for 8-bit dynamic range.
fn ssim(x: &[u8], y: &[u8], width: usize, height: usize) -> f64 {
    const WINDOW: usize = 8;
    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

    if width == 0 || height == 0 {
        return 1.0;
    }

    let mut total = 0.0;
    let mut windows = 0usize;

    let mut wy = 0;
    while wy < height {
        let wh = WINDOW.min(height - wy);
        let mut wx = 0;
        while wx < width {
            let ww = WINDOW.min(width - wx);
            let n = (ww * wh) as f64;

            let mut sum_x = 0.0;
            let mut sum_y = 0.0;
            let mut sum_xx = 0.0;
            let mut sum_yy = 0.0;
            let mut sum_xy = 0.0;
            for row in wy..wy + wh {
                for col in wx..wx + ww {
                    let a = x[row * width + col] as f64;
                    let b = y[row * width + col] as f64;
                    sum_x += a;
                    sum_y += b;
                    sum_xx += a * a;
                    sum_yy += b * b;
                    sum_xy += a * b;
                }
            }

            let mean_x = sum_x / n;
            let mean_y = sum_y / n;
            let var_x = sum_xx / n - mean_x * mean_x;
            let var_y = sum_yy / n - mean_y * mean_y;
            let cov = sum_xy / n - mean_x * mean_y;

            let numerator = (2.0 * mean_x * mean_y + C1) * (2.0 * cov + C2);
            let denominator = (mean_x * mean_x + mean_y * mean_y + C1) * (var_x + var_y + C2);
            total += numerator / denominator;
            windows += 1;

            wx += WINDOW;
        }
        wy += WINDOW;
    }

    total / windows as f64
}

/// Last captured picture, kept for out-of-band retrieval.
#[derive(Clone, Default)]
pub struct PictureStore {
    inner: Arc<Mutex<Option<(Bytes, u64)>>>,
}

impl PictureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, encoded: Bytes, timestamp_millis: u64) {
        *self.inner.lock().unwrap() = Some((encoded, timestamp_millis));
    }

    /// The stored picture and its timestamp; `(None, 0)` before the first
    /// capture.
    pub fn get(&self) -> (Option<Bytes>, u64) {
        match self.inner.lock().unwrap().as_ref() {
            Some((bytes, ts)) => (Some(bytes.clone()), *ts),
            None => (None, 0),
        }
    }
}

/// The engine's loop state; kept in one place so the adaptive algorithm
/// is auditable.
struct EngineState {
    window: ScoreWindow,
    interval: Duration,
    /// Stamp of the last successful capture; `None` means due now
    last_capture: Option<Instant>,
    last_picture: Option<Snapshot>,
}

/// The motion detection engine task.
pub struct MotionEngine {
    arbiter: CameraArbiter,
    sink: Arc<dyn MotionSink>,
    config_rx: watch::Receiver<DeviceConfig>,
    store: PictureStore,
    cfg: MotionConfig,
}

impl MotionEngine {
    pub fn spawn(
        arbiter: CameraArbiter,
        sink: Arc<dyn MotionSink>,
        config_rx: watch::Receiver<DeviceConfig>,
        store: PictureStore,
        cfg: MotionConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Self {
            arbiter,
            sink,
            config_rx,
            store,
            cfg,
        };
        tokio::spawn(engine.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            idle = ?self.cfg.idle_interval,
            alert = ?self.cfg.alert_interval,
            "motion engine started"
        );

        let mut state = EngineState {
            window: ScoreWindow::new(self.cfg.window_capacity),
            interval: self.cfg.idle_interval,
            last_capture: None,
            last_picture: None,
        };

        let mut tick = tokio::time::interval(self.cfg.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.cycle(&mut state).await;
        }

        info!("motion engine stopped");
    }

    async fn cycle(&self, state: &mut EngineState) {
        let config = *self.config_rx.borrow();
        if !config.motion_detection {
            return;
        }
        if let Some(last) = state.last_capture {
            if last.elapsed() < state.interval {
                return;
            }
        }
        // Never contend with a live view for the camera
        if self.arbiter.streaming_demand() > 0 {
            return;
        }

        let (width, height) = self.cfg.analysis_size;
        let settings = CaptureSettings {
            width,
            height,
            night_mode: config.night_mode,
        };
        let snapshot = match self
            .arbiter
            .request_snapshot(settings, self.cfg.light_settle)
            .await
        {
            Ok(snapshot) => snapshot,
            // Busy and transient capture failures are retried on the next
            // tick; the last-capture stamp is deliberately left untouched
            Err(DeviceError::Busy) => {
                debug!("camera busy, skipping motion cycle");
                return;
            }
            Err(e) => {
                warn!(error = %e, "snapshot failed, retrying next tick");
                return;
            }
        };
        state.last_capture = Some(Instant::now());

        match classify_brightness(
            &histogram(&snapshot.luma),
            self.cfg.dark_fraction,
            self.cfg.bright_fraction,
        ) {
            Brightness::TooDark => {
                info!("image too dark, enabling night mode");
                self.sink.set_night_mode(true);
                return;
            }
            Brightness::TooBright => {
                info!("image too bright, disabling night mode");
                self.sink.set_night_mode(false);
                return;
            }
            Brightness::Usable => {}
        }

        if let Some(score) = state
            .last_picture
            .as_ref()
            .and_then(|previous| dissimilarity(previous, &snapshot))
        {
            state.window.push(score);
            let mean = state.window.mean();
            let stddev = state.window.stddev();
            let moved = (score - mean).abs() > self.cfg.outlier_sigma * stddev;

            state.interval = if moved {
                self.cfg.alert_interval
            } else {
                self.cfg.idle_interval
            };

            debug!(score, mean, stddev, moved, "motion score");
            self.sink.movement(Movement {
                value: score,
                moved,
                interval_millis: state.interval.as_millis() as u64,
            });
        }

        self.store
            .set(snapshot.encoded.clone(), crate::frame::unix_millis());
        state.last_picture = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Score window statistics ==========

    #[test]
    fn window_never_exceeds_capacity() {
        let mut window = ScoreWindow::new(20);
        for i in 0..50 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 20);
    }

    #[test]
    fn window_statistics_cover_held_entries_only() {
        let mut window = ScoreWindow::new(4);
        window.push(1.0);
        window.push(3.0);
        assert!((window.mean() - 2.0).abs() < 1e-9);
        assert!((window.stddev() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn window_overwrites_oldest() {
        let mut window = ScoreWindow::new(3);
        for score in [1.0, 2.0, 3.0, 10.0] {
            window.push(score);
        }
        // 1.0 evicted: mean of [10, 2, 3]
        assert!((window.mean() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn outlier_vector_from_tuning_session() {
        // 19 calm scores and one spike: the spike must classify as moved
        let mut window = ScoreWindow::new(20);
        for _ in 0..19 {
            window.push(0.1);
        }
        window.push(0.9);

        let mean = window.mean();
        assert!((mean - 0.14).abs() < 1e-9);
        assert!((0.9 - mean).abs() > 2.0 * window.stddev());
        // ...while a calm score does not
        assert!((0.1 - mean).abs() <= 2.0 * window.stddev());
    }

    #[test]
    fn empty_window_is_calm() {
        let window = ScoreWindow::new(5);
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.stddev(), 0.0);
    }

    // ========== Brightness classification ==========

    #[test]
    fn almost_all_dark_pixels_flag_too_dark() {
        let mut luma = vec![0u8; 995];
        luma.extend_from_slice(&[200; 5]);
        let bins = histogram(&luma);
        assert_eq!(classify_brightness(&bins, 0.99, 0.70), Brightness::TooDark);
    }

    #[test]
    fn bright_majority_flags_too_bright() {
        let mut luma = vec![255u8; 70];
        luma.extend_from_slice(&[100; 30]);
        let bins = histogram(&luma);
        assert_eq!(classify_brightness(&bins, 0.99, 0.70), Brightness::TooBright);
    }

    #[test]
    fn midtones_are_usable() {
        let luma: Vec<u8> = (0..=255).collect();
        let bins = histogram(&luma);
        assert_eq!(classify_brightness(&bins, 0.99, 0.70), Brightness::Usable);
    }

    #[test]
    fn classification_is_idempotent() {
        let luma = vec![0u8; 1_000];
        let bins = histogram(&luma);
        let first = classify_brightness(&bins, 0.99, 0.70);
        let second = classify_brightness(&bins, 0.99, 0.70);
        assert_eq!(first, second);
        assert_eq!(first, Brightness::TooDark);
    }

    #[test]
    fn histogram_bins_cover_intensity_range() {
        let bins = histogram(&[0, 25, 26, 128, 255]);
        assert_eq!(bins[0], 2); // 0 and 25
        assert_eq!(bins[1], 1); // 26
        assert_eq!(bins[5], 1); // 128
        assert_eq!(bins[9], 1); // 255
        assert_eq!(bins.iter().sum::<u64>(), 5);
    }

    // ========== Dissimilarity ==========

    #[cfg(feature = "test-source")]
    mod scores {
        use super::super::*;
        use crate::device::testkit::{snapshot_from_luma, snapshot_uniform};

        #[test]
        fn identical_pictures_score_zero() {
            let a = snapshot_uniform(32, 32, 120);
            let b = snapshot_uniform(32, 32, 120);
            let score = dissimilarity(&a, &b).unwrap();
            assert!(score < 1e-6, "score {}", score);
        }

        #[test]
        fn inverted_picture_scores_high() {
            let luma: Vec<u8> = (0..32 * 32).map(|i| ((i * 7) % 256) as u8).collect();
            let inverted: Vec<u8> = luma.iter().map(|&p| 255 - p).collect();
            let a = snapshot_from_luma(32, 32, luma);
            let b = snapshot_from_luma(32, 32, inverted);
            let score = dissimilarity(&a, &b).unwrap();
            assert!(score > 0.5, "score {}", score);
        }

        #[test]
        fn small_change_scores_between() {
            let mut luma = vec![100u8; 32 * 32];
            let a = snapshot_from_luma(32, 32, luma.clone());
            // Brighten one corner block
            for row in 0..8 {
                for col in 0..8 {
                    luma[row * 32 + col] = 220;
                }
            }
            let b = snapshot_from_luma(32, 32, luma);
            let score = dissimilarity(&a, &b).unwrap();
            assert!(score > 0.0 && score < 0.5, "score {}", score);
        }

        #[test]
        fn size_mismatch_is_not_comparable() {
            let a = snapshot_uniform(32, 32, 120);
            let b = snapshot_uniform(16, 16, 120);
            assert!(dissimilarity(&a, &b).is_none());
        }
    }

    // ========== Engine loop ==========

    #[cfg(feature = "test-source")]
    mod engine {
        use super::super::*;
        use crate::device::testkit::{snapshot_uniform, FakeCamera, FakeLights};
        use std::time::Duration;

        #[derive(Clone, Default)]
        struct RecordingSink {
            movements: Arc<Mutex<Vec<Movement>>>,
            night_flips: Arc<Mutex<Vec<bool>>>,
        }

        impl MotionSink for RecordingSink {
            fn movement(&self, movement: Movement) {
                self.movements.lock().unwrap().push(movement);
            }
            fn set_night_mode(&self, on: bool) {
                self.night_flips.lock().unwrap().push(on);
            }
        }

        fn fast_config() -> MotionConfig {
            MotionConfig {
                tick: Duration::from_millis(5),
                idle_interval: Duration::from_millis(20),
                alert_interval: Duration::from_millis(10),
                light_settle: Duration::from_millis(1),
                analysis_size: (16, 16),
                ..MotionConfig::default()
            }
        }

        struct Fixture {
            camera: FakeCamera,
            arbiter: CameraArbiter,
            sink: RecordingSink,
            store: PictureStore,
            config_tx: watch::Sender<DeviceConfig>,
            cancel: CancellationToken,
        }

        fn fixture(enabled: bool) -> Fixture {
            fixture_with(enabled, |_| {})
        }

        fn fixture_with(enabled: bool, setup: impl FnOnce(&FakeCamera)) -> Fixture {
            let camera = FakeCamera::new();
            setup(&camera);
            let arbiter = CameraArbiter::new(
                Arc::new(camera.clone()),
                Arc::new(FakeLights::new()),
                Arc::new(|_| {}),
            );
            let (config_tx, config_rx) = watch::channel(DeviceConfig {
                night_mode: false,
                motion_detection: enabled,
            });
            let sink = RecordingSink::default();
            let store = PictureStore::new();
            let cancel = CancellationToken::new();
            MotionEngine::spawn(
                arbiter.clone(),
                Arc::new(sink.clone()),
                config_rx,
                store.clone(),
                fast_config(),
                cancel.clone(),
            );
            Fixture {
                camera,
                arbiter,
                sink,
                store,
                config_tx,
                cancel,
            }
        }

        async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
            let start = std::time::Instant::now();
            while start.elapsed() < Duration::from_secs(2) {
                if done() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        }

        #[tokio::test]
        async fn steady_scene_broadcasts_unmoved_scores() {
            let f = fixture(true);
            f.camera.set_default_luma(128);

            assert!(
                wait_until(|| f.sink.movements.lock().unwrap().len() >= 2).await,
                "no movement events"
            );
            let movements = f.sink.movements.lock().unwrap().clone();
            assert!(movements.iter().all(|m| !m.moved));
            assert!(movements.iter().all(|m| m.value < 0.01));

            // Last picture retained for retrieval
            let (picture, timestamp) = f.store.get();
            assert!(picture.is_some());
            assert!(timestamp > 0);

            f.cancel.cancel();
        }

        #[tokio::test]
        async fn dark_capture_flips_night_mode_and_is_not_stored() {
            // Every capture comes back fully dark
            let f = fixture_with(true, |camera| {
                camera.set_default_luma(0);
                camera.script(Ok(snapshot_uniform(16, 16, 0)));
            });

            assert!(
                wait_until(|| f.sink.night_flips.lock().unwrap().len() >= 2).await,
                "night mode was not flipped"
            );
            assert!(f.sink.night_flips.lock().unwrap().iter().all(|&on| on));

            // Dark frames are unusable: never compared, never stored
            assert!(f.sink.movements.lock().unwrap().is_empty());
            assert_eq!(f.store.get(), (None, 0));

            f.cancel.cancel();
        }

        #[tokio::test]
        async fn disabled_engine_never_touches_the_camera() {
            let f = fixture(false);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(f.camera.captures().is_empty());
            f.cancel.cancel();
        }

        #[tokio::test]
        async fn streaming_demand_suppresses_capture() {
            let f = fixture(true);
            f.arbiter.request_streaming(true);
            // Give the stream a moment to take the camera
            tokio::time::sleep(Duration::from_millis(50)).await;

            let before = f.camera.captures().len();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(f.camera.captures().len(), before);

            f.arbiter.request_streaming(false);
            f.cancel.cancel();
            let _ = f.config_tx.send(DeviceConfig::default());
        }

        #[tokio::test]
        async fn capture_failure_is_retried_next_tick() {
            let f = fixture_with(true, |camera| {
                camera.script(Err(DeviceError::CaptureFailed("flaky sensor".into())));
            });

            // The failure is absorbed and the next tick succeeds
            assert!(
                wait_until(|| f.camera.captures().len() >= 2).await,
                "no retry happened"
            );
            assert!(wait_until(|| f.store.get().0.is_some()).await);

            f.cancel.cancel();
        }
    }
}
