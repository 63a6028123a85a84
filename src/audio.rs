//! Continuous audio pipeline
//!
//! Device reads are blocking, so the pipeline runs on its own thread and
//! never on the event loop. Each chunk is downmixed to mono, resampled to
//! the target rate, gain-adjusted and A-law encoded; the encoded packet is
//! handed off to the hub without blocking. RMS-derived levels accumulate
//! per second and reduce to a single robust percentile before being
//! broadcast as the `volume` event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::device::{AudioInput, DeviceError};
use crate::message::AudioPacket;

/// Where the pipeline hands its output. Implementations must not block;
/// dropping a packet under overload is preferable to stalling the reader.
pub trait AudioSink: Send + 'static {
    fn packet(&self, packet: AudioPacket);
    fn level(&self, level: f64);
}

/// Handle to the running pipeline thread.
pub struct AudioPipeline {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl AudioPipeline {
    /// Open a fresh device stream and start the read loop.
    pub fn start(
        input: Arc<dyn AudioInput>,
        sink: impl AudioSink,
        config: AudioConfig,
    ) -> Result<Self, DeviceError> {
        let stream = input.open()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("audio-pipeline".into())
            .spawn(move || run_pipeline(stream, stop_flag, sink, config))
            .map_err(|e| DeviceError::Unavailable(format!("audio thread: {}", e)))?;

        Ok(Self { stop, thread })
    }

    /// Ask the loop to finish. The thread exits after its next read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pipeline(
    mut stream: Box<dyn crate::device::AudioStream>,
    stop: Arc<AtomicBool>,
    sink: impl AudioSink,
    config: AudioConfig,
) {
    info!(
        target_rate = config.target_rate,
        "audio pipeline started"
    );

    // Count of emitted target-rate samples; drives pts and the per-second
    // level batching so timing follows the audio clock, not wall time.
    let mut samples_out: u64 = 0;
    let mut batch_start: u64 = 0;
    let mut levels: Vec<f64> = Vec::new();
    let mut packets: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            info!(packets, "audio pipeline stopped");
            return;
        }

        let chunk = match stream.read_chunk() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "audio read failed, pipeline ends");
                return;
            }
        };

        // Short read: nothing to do this round
        if chunk.samples.is_empty() || chunk.sample_rate == 0 {
            continue;
        }

        let mono = downmix_to_mono(&chunk.samples, chunk.channels);
        let mut resampled = resample(&mono, chunk.sample_rate, config.target_rate);
        if resampled.is_empty() {
            continue;
        }

        for sample in &mut resampled {
            *sample = (*sample * config.gain).clamp(-1.0, 1.0);
        }

        let level = rms_level(&resampled);
        levels.push(level);

        let pcm: Vec<i16> = resampled
            .iter()
            .map(|&s| (s * i16::MAX as f32) as i16)
            .collect();
        let pts = samples_out * 1_000 / config.target_rate as u64;
        sink.packet(AudioPacket {
            data: a_law_encode(&pcm).into(),
            pts,
        });
        packets += 1;

        samples_out += resampled.len() as u64;
        if samples_out - batch_start >= config.target_rate as u64 {
            let volume = percentile(&levels, config.level_percentile);
            debug!(volume, batch = levels.len(), "volume level");
            sink.level(volume);
            levels.clear();
            batch_start = samples_out;
        }
    }
}

/// Average interleaved channels down to one.
fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear interpolation resampler.
fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = ((samples.len() as f64) / ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let idx1 = (idx0 + 1).min(samples.len().saturating_sub(1));
        let frac = (src_idx - idx0 as f64) as f32;

        if idx0 < samples.len() {
            output.push(samples[idx0] * (1.0 - frac) + samples[idx1] * frac);
        }
    }

    output
}

/// RMS of normalized samples, clamped to 0..1.
fn rms_level(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt().clamp(0.0, 1.0)
}

/// Nearest-rank percentile over an unsorted batch.
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

const SEG_END: [i16; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// G.711 A-law compression of one 16-bit sample.
fn encode_alaw(sample: i16) -> u8 {
    let mut pcm = sample >> 3;
    let mask: u8 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    match SEG_END.iter().position(|&end| pcm <= end) {
        None => 0x7F ^ mask,
        Some(seg) => {
            let shift = if seg < 2 { 1 } else { seg };
            let aval = ((seg as u8) << 4) | (((pcm >> shift) & 0xF) as u8);
            aval ^ mask
        }
    }
}

/// A-law encode a whole buffer.
pub fn a_law_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_alaw(s)).collect()
}

/// Retained history of per-second levels for downstream consumers.
/// Appends evict the oldest entry once the capacity is reached.
#[derive(Debug, Clone)]
pub struct LevelWindow {
    entries: VecDeque<(u64, f64)>,
    capacity: usize,
}

impl LevelWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, timestamp_millis: u64, level: f64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp_millis, level));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(u64, f64)> {
        self.entries.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_passthrough_for_mono() {
        let samples = vec![0.5, -0.3, 0.8];
        assert_eq!(downmix_to_mono(&samples, 1), samples);
    }

    #[test]
    fn downmix_averages_stereo() {
        let result = downmix_to_mono(&[0.4, 0.6, -0.2, 0.8], 2);
        assert_eq!(result.len(), 2);
        assert!((result[0] - 0.5).abs() < 1e-6);
        assert!((result[1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn resample_halves_at_double_rate() {
        let samples: Vec<f32> = (0..960).map(|i| (i as f32) / 960.0).collect();
        let result = resample(&samples, 16_000, 8_000);
        assert!((result.len() as f64 - 480.0).abs() <= 1.0);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_level(&[0.0; 64]), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        let samples: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((rms_level(&samples) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_nearest_rank() {
        let values = vec![0.4, 0.1, 0.3, 0.2];
        assert!((percentile(&values, 0.75) - 0.3).abs() < 1e-9);
        assert!((percentile(&values, 1.0) - 0.4).abs() < 1e-9);
        assert_eq!(percentile(&[], 0.75), 0.0);
    }

    #[test]
    fn percentile_resists_single_outlier() {
        // 1s batch with one loud click should not report the click
        let mut values = vec![0.1; 49];
        values.push(0.9);
        assert!((percentile(&values, 0.75) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn alaw_known_values() {
        // A-law idle pattern for digital silence
        assert_eq!(encode_alaw(0), 0xD5);
        assert_eq!(encode_alaw(i16::MAX), 0xAA);
        assert_eq!(encode_alaw(i16::MIN), 0x2A);
    }

    #[test]
    fn alaw_sign_bit_symmetry() {
        let plus = encode_alaw(1_000);
        let minus = encode_alaw(-1_000);
        assert_eq!(plus ^ minus, 0x80);
    }

    #[test]
    fn level_window_evicts_oldest() {
        let mut window = LevelWindow::new(3);
        for i in 0..5u64 {
            window.push(i, i as f64 / 10.0);
        }
        assert_eq!(window.len(), 3);
        let entries = window.snapshot();
        assert_eq!(entries[0].0, 2);
        assert_eq!(entries[2].0, 4);
    }

    #[cfg(feature = "test-source")]
    mod pipeline {
        use super::super::*;
        use crate::device::testkit::ScriptedAudio;
        use crate::device::AudioChunk;
        use std::sync::Mutex;
        use std::time::{Duration, Instant};

        #[derive(Clone, Default)]
        struct Collector {
            packets: Arc<Mutex<Vec<AudioPacket>>>,
            levels: Arc<Mutex<Vec<f64>>>,
        }

        impl AudioSink for Collector {
            fn packet(&self, packet: AudioPacket) {
                self.packets.lock().unwrap().push(packet);
            }
            fn level(&self, level: f64) {
                self.levels.lock().unwrap().push(level);
            }
        }

        fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
            let start = Instant::now();
            while start.elapsed() < deadline {
                if done() {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            false
        }

        #[test]
        fn pipeline_emits_packets_and_per_second_levels() {
            let audio = ScriptedAudio::new();
            let sink = Collector::default();
            let pipeline = AudioPipeline::start(
                Arc::new(audio.clone()),
                sink.clone(),
                AudioConfig::default(),
            )
            .unwrap();

            // Slightly over one second of 8kHz audio in 100ms chunks
            for _ in 0..11 {
                audio.push(AudioChunk {
                    samples: vec![0.1; 800],
                    channels: 1,
                    sample_rate: 8_000,
                });
            }

            assert!(wait_until(Duration::from_secs(5), || {
                !sink.levels.lock().unwrap().is_empty()
            }));

            let packets = sink.packets.lock().unwrap();
            assert!(packets.len() >= 10);
            // A-law output, one byte per 8kHz sample
            assert_eq!(packets[0].data.len(), 800);
            // pts advances by 100ms of samples per packet
            assert_eq!(packets[0].pts, 0);
            assert_eq!(packets[1].pts, 100);

            pipeline.stop();
            assert!(wait_until(Duration::from_secs(2), || !pipeline.is_running()));
            assert_eq!(audio.active_streams(), 0);
        }

        #[test]
        fn pipeline_stops_on_request() {
            let audio = ScriptedAudio::new();
            let pipeline = AudioPipeline::start(
                Arc::new(audio.clone()),
                Collector::default(),
                AudioConfig::default(),
            )
            .unwrap();

            assert!(pipeline.is_running());
            pipeline.stop();
            assert!(wait_until(Duration::from_secs(2), || !pipeline.is_running()));
        }
    }
}
