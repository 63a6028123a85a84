//! The hub: session registry, broadcast router and device lifecycle
//!
//! Every piece of shared state (the session set, capability flags, the
//! device configuration, the audio-level history) is owned by one actor
//! task and mutated nowhere else. Other execution contexts (the audio
//! thread, the camera's frame callback, per-session heartbeat tasks)
//! reach it exclusively by posting messages through the bounded ingress
//! queue, so the state needs no locks and every handler runs to
//! completion without suspension.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod session;

pub use session::{Capabilities, SessionId};
use session::Session;

use crate::arbiter::{ArbiterState, CameraArbiter};
use crate::audio::{AudioPipeline, AudioSink, LevelWindow};
use crate::config::{ConfigPatch, DeviceConfig, HubConfig};
use crate::device::{CaptureSettings, Devices};
use crate::frame::{unix_millis, VideoFrame};
use crate::message::{AudioPacket, ControlMessage, Event, MessageError, Movement, SystemStatus};
use crate::motion::{MotionEngine, MotionSink, PictureStore};

/// Everything that can be posted to the hub task.
enum HubMsg {
    Connect(oneshot::Sender<(SessionId, mpsc::Receiver<Event>)>),
    Disconnect(SessionId),
    Control(SessionId, ControlMessage),
    Heartbeat(SessionId),
    Frame(VideoFrame),
    Audio(AudioPacket),
    Level(f64),
    Movement(Movement),
    NightMode(bool),
    Stats(oneshot::Sender<HubStats>),
    History(oneshot::Sender<Vec<(u64, f64)>>),
}

/// Snapshot of hub state for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct HubStats {
    pub sessions: usize,
    pub audio_running: bool,
    pub arbiter: ArbiterState,
    pub streaming_demand: usize,
}

/// Cloneable handle; the only way into the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMsg>,
    arbiter: CameraArbiter,
    store: PictureStore,
    config_rx: watch::Receiver<DeviceConfig>,
    cfg: Arc<HubConfig>,
    cancel: CancellationToken,
}

impl HubHandle {
    /// Register a new subscriber with empty capability flags.
    ///
    /// Returns the session handle and the outbound event stream the
    /// transport is expected to drain.
    pub async fn connect(&self) -> Result<(SessionId, mpsc::Receiver<Event>)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::Connect(reply))
            .await
            .map_err(|_| anyhow!("hub is closed"))?;
        rx.await.map_err(|_| anyhow!("hub is closed"))
    }

    /// Remove a subscriber. Safe to call repeatedly and from any trigger
    /// (explicit message, transport close, heartbeat failure).
    pub async fn disconnect(&self, id: SessionId) {
        let _ = self.tx.send(HubMsg::Disconnect(id)).await;
    }

    /// Dispatch an already-parsed control message for a session.
    pub async fn control(&self, id: SessionId, message: ControlMessage) {
        let _ = self.tx.send(HubMsg::Control(id, message)).await;
    }

    /// Parse and dispatch a raw JSON control message. Parse failures are
    /// logged and reported to the caller; the session keeps running.
    pub async fn handle_raw(&self, id: SessionId, raw: &str) -> Result<(), MessageError> {
        match ControlMessage::parse(raw) {
            Ok(message) => {
                self.control(id, message).await;
                Ok(())
            }
            Err(e) => {
                warn!(session = %id, error = %e, "ignoring bad control message");
                Err(e)
            }
        }
    }

    /// Current device configuration.
    pub fn config(&self) -> DeviceConfig {
        *self.config_rx.borrow()
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::Stats(reply))
            .await
            .map_err(|_| anyhow!("hub is closed"))?;
        rx.await.map_err(|_| anyhow!("hub is closed"))
    }

    /// Retained per-second volume levels, oldest first.
    pub async fn volume_history(&self) -> Result<Vec<(u64, f64)>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::History(reply))
            .await
            .map_err(|_| anyhow!("hub is closed"))?;
        rx.await.map_err(|_| anyhow!("hub is closed"))
    }

    /// The last picture the motion engine stored, for out-of-band polling.
    ///
    /// With `refresh` a fresh high-resolution capture is attempted through
    /// the arbiter first; when the camera is busy the stored picture is
    /// served instead.
    pub async fn last_picture(&self, refresh: bool) -> (Option<Bytes>, u64) {
        if refresh {
            let config = *self.config_rx.borrow();
            let (width, height) = self.cfg.motion.retrieval_size;
            let settings = CaptureSettings {
                width,
                height,
                night_mode: config.night_mode,
            };
            match self
                .arbiter
                .request_snapshot(settings, self.cfg.motion.light_settle)
                .await
            {
                Ok(snapshot) => self.store.set(snapshot.encoded, unix_millis()),
                Err(e) => {
                    debug!(error = %e, "fresh capture unavailable, serving stored picture")
                }
            }
        }
        self.store.get()
    }

    /// Stop the hub, the motion engine and the audio pipeline.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Constructor for the hub task tree.
pub struct Hub;

impl Hub {
    /// Wire the components together and start the hub task. The camera
    /// and audio devices must already be open; failure to acquire them is
    /// a startup error handled by the caller, not here.
    pub fn spawn(devices: Devices, config: HubConfig) -> HubHandle {
        let cfg = Arc::new(config);
        let (ingress, rx) = mpsc::channel(cfg.ingress_capacity);
        let (config_tx, config_rx) = watch::channel(cfg.initial_config);
        let store = PictureStore::new();
        let cancel = CancellationToken::new();

        let frame_tx = ingress.clone();
        let arbiter = CameraArbiter::new(
            Arc::clone(&devices.camera),
            Arc::clone(&devices.lights),
            Arc::new(move |frame| {
                if frame_tx.try_send(HubMsg::Frame(frame)).is_err() {
                    debug!("frame handoff full, frame dropped");
                }
            }),
        );
        arbiter.set_night_mode(cfg.initial_config.night_mode);

        MotionEngine::spawn(
            arbiter.clone(),
            Arc::new(HubMotionSink {
                tx: ingress.clone(),
            }),
            config_rx.clone(),
            store.clone(),
            cfg.motion.clone(),
            cancel.child_token(),
        );

        let state = HubState {
            cfg: Arc::clone(&cfg),
            devices,
            arbiter: arbiter.clone(),
            sessions: HashMap::new(),
            next_id: 0,
            config_tx,
            audio: None,
            levels: LevelWindow::new(cfg.audio.level_window),
            ingress: ingress.clone(),
        };
        tokio::spawn(state.run(rx, cancel.clone()));

        HubHandle {
            tx: ingress,
            arbiter,
            store,
            config_rx,
            cfg,
            cancel,
        }
    }
}

/// Posts audio pipeline output into the hub without ever blocking the
/// capture thread; a full queue loses the packet, not the pipeline.
struct HubAudioSink {
    tx: mpsc::Sender<HubMsg>,
}

impl AudioSink for HubAudioSink {
    fn packet(&self, packet: AudioPacket) {
        if self.tx.try_send(HubMsg::Audio(packet)).is_err() {
            debug!("audio handoff full, packet dropped");
        }
    }

    fn level(&self, level: f64) {
        if self.tx.try_send(HubMsg::Level(level)).is_err() {
            debug!("level handoff full, level dropped");
        }
    }
}

struct HubMotionSink {
    tx: mpsc::Sender<HubMsg>,
}

impl MotionSink for HubMotionSink {
    fn movement(&self, movement: Movement) {
        if self.tx.try_send(HubMsg::Movement(movement)).is_err() {
            debug!("movement handoff full, event dropped");
        }
    }

    fn set_night_mode(&self, on: bool) {
        let _ = self.tx.try_send(HubMsg::NightMode(on));
    }
}

/// The single-writer state; lives inside the hub task only.
struct HubState {
    cfg: Arc<HubConfig>,
    devices: Devices,
    arbiter: CameraArbiter,
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
    config_tx: watch::Sender<DeviceConfig>,
    audio: Option<AudioPipeline>,
    levels: LevelWindow,
    /// Handed to heartbeat tasks so their events go through the queue too
    ingress: mpsc::Sender<HubMsg>,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::Receiver<HubMsg>, cancel: CancellationToken) {
        info!("hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                }
            }
        }
        self.teardown();
    }

    /// Handlers never await: each message is processed to completion
    /// before the next one is looked at.
    fn handle(&mut self, msg: HubMsg) {
        match msg {
            HubMsg::Connect(reply) => self.handle_connect(reply),
            HubMsg::Disconnect(id) => self.remove_session(id),
            HubMsg::Control(id, message) => self.handle_control(id, message),
            HubMsg::Heartbeat(id) => self.handle_heartbeat(id),
            HubMsg::Frame(frame) => {
                self.broadcast(Event::Video { frame }, |caps| caps.wants_video)
            }
            HubMsg::Audio(audio) => {
                self.broadcast(Event::Audio { audio }, |caps| caps.wants_audio)
            }
            HubMsg::Level(level) => {
                self.levels.push(unix_millis(), level);
                self.broadcast_all(Event::Volume { volume: level });
            }
            HubMsg::Movement(movement) => {
                self.broadcast_all(Event::Movement { movement });
            }
            HubMsg::NightMode(on) => self.apply_config(
                ConfigPatch {
                    night_mode: Some(on),
                    motion_detection: None,
                },
                false,
            ),
            HubMsg::Stats(reply) => {
                let _ = reply.send(HubStats {
                    sessions: self.sessions.len(),
                    audio_running: self.audio.as_ref().is_some_and(|p| p.is_running()),
                    arbiter: self.arbiter.state(),
                    streaming_demand: self.arbiter.streaming_demand(),
                });
            }
            HubMsg::History(reply) => {
                let _ = reply.send(self.levels.snapshot());
            }
        }
    }

    fn handle_connect(&mut self, reply: oneshot::Sender<(SessionId, mpsc::Receiver<Event>)>) {
        self.next_id += 1;
        let id = SessionId::new(self.next_id);
        let (tx, rx) = mpsc::channel(self.cfg.session_channel_capacity);
        let heartbeat = CancellationToken::new();
        self.spawn_heartbeat(id, heartbeat.clone());
        self.sessions.insert(id, Session::new(id, tx, heartbeat));
        info!(session = %id, total = self.sessions.len(), "client connected");

        if self.sessions.len() == 1 {
            self.start_audio();
        }

        if reply.send((id, rx)).is_err() {
            // Caller vanished before receiving its handle
            self.remove_session(id);
        }
    }

    fn spawn_heartbeat(&self, id: SessionId, cancel: CancellationToken) {
        let ingress = self.ingress.clone();
        let interval = self.cfg.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if ingress.send(HubMsg::Heartbeat(id)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle_heartbeat(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        match session.tx.try_send(Event::Heartbeat) {
            Ok(()) => session.last_alive = Instant::now(),
            Err(TrySendError::Full(_)) => {
                debug!(session = %id, "heartbeat dropped, client lagging")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(session = %id, "heartbeat failed, dropping session");
                self.remove_session(id);
            }
        }
    }

    fn handle_control(&mut self, id: SessionId, message: ControlMessage) {
        if !self.sessions.contains_key(&id) {
            warn!(session = %id, "control message for unknown session");
            return;
        }
        debug!(session = %id, ?message, "control message");

        match message {
            ControlMessage::Shutdown => self.system_action(SystemStatus::ShuttingDown),
            ControlMessage::Restart => self.system_action(SystemStatus::Restarting),
            ControlMessage::LegacyStartStream | ControlMessage::LegacyStopStream => {
                debug!(session = %id, "legacy stream toggle ignored");
            }
            ControlMessage::StartStream => self.set_wants_video(id, true),
            ControlMessage::StopStream => self.set_wants_video(id, false),
            ControlMessage::StartAudio => self.set_wants_audio(id, true),
            ControlMessage::StopAudio => self.set_wants_audio(id, false),
            ControlMessage::MotionDetect { value } => self.apply_config(
                ConfigPatch {
                    night_mode: None,
                    motion_detection: Some(value),
                },
                false,
            ),
            ControlMessage::Lights { lights } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.caps.wants_lights = lights != 0;
                }
                self.update_stream_lights();
            }
            ControlMessage::ConfigurationUpdate { configuration } => {
                self.apply_config(configuration, true)
            }
            ControlMessage::ConfigurationRequest => {
                let configuration = *self.config_tx.borrow();
                self.send_to(id, Event::Configuration { configuration });
            }
        }
    }

    /// Flip a session's video flag and feed the arbiter's demand count in
    /// the same handler, before any other message can interleave.
    fn set_wants_video(&mut self, id: SessionId, on: bool) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.caps.wants_video == on {
            return;
        }
        session.caps.wants_video = on;
        self.update_stream_lights();
        self.arbiter.request_streaming(on);
    }

    fn set_wants_audio(&mut self, id: SessionId, on: bool) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.caps.wants_audio = on;
        }
    }

    fn system_action(&mut self, status: SystemStatus) {
        info!(?status, "system action requested");
        self.broadcast_all(Event::SystemStatus { status });

        let system = Arc::clone(&self.devices.system);
        let grace = self.cfg.shutdown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match status {
                SystemStatus::ShuttingDown => system.shutdown(),
                SystemStatus::Restarting => system.restart(),
            }
        });
    }

    /// Apply a configuration patch. A real change propagates to the
    /// arbiter and the watch channel; `force_broadcast` additionally
    /// answers explicit client updates even when nothing changed.
    fn apply_config(&mut self, patch: ConfigPatch, force_broadcast: bool) {
        let mut config = *self.config_tx.borrow();
        let changed = config.apply(&patch);
        if changed {
            self.config_tx.send_replace(config);
            self.arbiter.set_night_mode(config.night_mode);
            self.update_stream_lights();
            info!(?config, "configuration updated");
        }
        if changed || force_broadcast {
            self.broadcast_all(Event::Configuration {
                configuration: config,
            });
        }
    }

    /// Lights while streaming: night mode, or any session asking for them.
    fn update_stream_lights(&self) {
        let config = *self.config_tx.borrow();
        let wanted = config.night_mode || self.sessions.values().any(|s| s.caps.wants_lights);
        self.arbiter.set_stream_lights(wanted);
    }

    fn start_audio(&mut self) {
        let sink = HubAudioSink {
            tx: self.ingress.clone(),
        };
        match AudioPipeline::start(Arc::clone(&self.devices.audio), sink, self.cfg.audio.clone()) {
            Ok(pipeline) => {
                self.audio = Some(pipeline);
            }
            Err(e) => error!(error = %e, "failed to start audio pipeline"),
        }
    }

    fn stop_audio(&mut self) {
        if let Some(pipeline) = self.audio.take() {
            pipeline.stop();
        }
    }

    fn remove_session(&mut self, id: SessionId) {
        // Idempotent: a session can be torn down by its transport, a
        // heartbeat failure and an explicit message without double effect
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        session.heartbeat.cancel();
        if session.caps.wants_video {
            self.arbiter.request_streaming(false);
        }
        self.update_stream_lights();
        info!(
            session = %id,
            connected_secs = session.connected_at.elapsed().as_secs(),
            silent_ms = session.last_alive.elapsed().as_millis(),
            remaining = self.sessions.len(),
            "client disconnected"
        );

        if self.sessions.is_empty() {
            self.stop_audio();
        }
    }

    fn send_to(&mut self, id: SessionId, event: Event) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        match session.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(session = %id, "outbound queue full, event dropped")
            }
            Err(TrySendError::Closed(_)) => self.remove_session(id),
        }
    }

    /// Push an event to every session the filter admits. One broken
    /// subscriber never stops delivery to the others; closed channels
    /// schedule that session's removal.
    fn broadcast(&mut self, event: Event, filter: fn(&Capabilities) -> bool) {
        let mut dead = Vec::new();
        for session in self.sessions.values() {
            if !filter(&session.caps) {
                continue;
            }
            match session.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(session = %session.id, "outbound queue full, event dropped")
                }
                Err(TrySendError::Closed(_)) => dead.push(session.id),
            }
        }
        for id in dead {
            self.remove_session(id);
        }
    }

    fn broadcast_all(&mut self, event: Event) {
        self.broadcast(event, |_| true);
    }

    fn teardown(&mut self) {
        info!("hub stopping");
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.remove_session(id);
        }
        self.stop_audio();
    }
}
