//! # Session Controller
//!
//! Owns the single active call session and drives its lifecycle:
//!
//! ```text
//! Idle --new_connection--> Active --release--> Idle
//!                          Active --new_connection--> Active   (preemption)
//! ```
//!
//! Every transition out of `Active` goes through [`Session::stop`]: clear the
//! running flag, join both workers, then drop the last link reference, which
//! closes the socket. Workers never close the link themselves, so the close
//! happens exactly once and never while a worker might still use it.
//!
//! The controller is driven synchronously by the dispatcher thread; it is not
//! shared and needs no locking.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::device::AudioDevices;
use crate::audio::transform::TransformProvider;
use crate::audio::{CodecId, SampleRate};
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::link::handshake::{self, HandshakeSettings};
use crate::link::Link;
use crate::state::BridgeMetrics;
use crate::stream::{self, SessionMode, StreamCounters, StreamTiming, WorkerContext, WorkerExit};

/// Per-session parameters taken from the configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub kickstart_attempts: u32,
    pub settle_delay: std::time::Duration,
    pub timing: StreamTiming,
    pub jitter_buffer_ms: u32,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            kickstart_attempts: config.link.kickstart_attempts,
            settle_delay: config.link.settle_delay(),
            timing: StreamTiming::from(&config.stream),
            jitter_buffer_ms: config.audio.jitter_buffer_ms,
        }
    }
}

/// One direction of a session.
///
/// ## Variants:
/// - **Running**: a spawned worker thread; joined exactly once in [`Session::stop`]
/// - **Exited**: the worker never started (its device failed to open) and
///   this is the exit reported for it
///
/// ## Rust Concepts:
/// - `join(self)` consumes the worker, so a handle cannot be joined twice
enum Worker {
    Running(JoinHandle<WorkerExit>),
    Exited(WorkerExit),
}

impl Worker {
    fn is_finished(&self) -> bool {
        match self {
            Worker::Running(handle) => handle.is_finished(),
            Worker::Exited(_) => true,
        }
    }

    fn join(self, name: &str) -> WorkerExit {
        match self {
            Worker::Running(handle) => handle.join().unwrap_or_else(|_| {
                error!(worker = name, "Worker thread panicked");
                WorkerExit::Panicked
            }),
            Worker::Exited(exit) => exit,
        }
    }
}

/// One active call.
///
/// ## Fields:
/// - **id**: unique per session, used in every log line about it
/// - **card**: object path of the hands-free card the call belongs to
/// - **codec** / **sample_rate**: negotiated codec and the PCM rate it implies
/// - **started_at**: wall-clock start, for durations
/// - **running**: cleared to stop both workers
/// - **link**: shared with the workers; this is the reference dropped last
/// - **counters**: traffic counted by the workers
pub struct Session {
    pub id: Uuid,
    pub card: String,
    pub codec: CodecId,
    pub sample_rate: SampleRate,
    pub started_at: DateTime<Utc>,
    running: Arc<AtomicBool>,
    link: Arc<dyn Link>,
    counters: Arc<StreamCounters>,
    receive: Worker,
    transmit: Worker,
}

/// What a stopped session leaves behind for the logs.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub card: String,
    pub codec: CodecId,
    pub duration_seconds: f64,
    pub receive_exit: WorkerExit,
    pub transmit_exit: WorkerExit,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub silence_chunks: u64,
}

impl Session {
    /// Handshake the link, open the devices and spawn both workers.
    fn start(
        card: &str,
        codec: CodecId,
        link: Arc<dyn Link>,
        mode: SessionMode,
        devices: &dyn AudioDevices,
        settings: &SessionSettings,
    ) -> Self {
        let id = Uuid::new_v4();
        let sample_rate = mode.sample_rate();

        let report = handshake::perform(
            link.as_ref(),
            &HandshakeSettings {
                kickstart_attempts: settings.kickstart_attempts,
                kickstart_len: mode.link_packet_len(),
                settle_delay: settings.settle_delay,
            },
        );

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(StreamCounters::default());
        let ctx = WorkerContext {
            link: link.clone(),
            running: running.clone(),
            counters: counters.clone(),
            timing: settings.timing.clone(),
        };
        let (receive_path, transmit_path) = mode.split();

        let receive = match devices.open_playback(sample_rate) {
            Ok(playback) => {
                let ctx = ctx.clone();
                Worker::Running(thread::spawn(move || stream::receive::run(ctx, receive_path, playback)))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Could not open playback device");
                Worker::Exited(WorkerExit::PlaybackClosed)
            }
        };

        let capture = devices
            .open_capture(sample_rate)
            .map_err(|e| warn!(session_id = %id, error = %e, "Could not open capture device"))
            .ok();
        let transmit = Worker::Running(thread::spawn(move || {
            stream::transmit::run(ctx, transmit_path, capture, sample_rate)
        }));

        info!(
            session_id = %id,
            card,
            %codec,
            rate = sample_rate.hz(),
            accept = ?report.accept,
            kickstart_writes = report.kickstart_writes,
            kickstart_delivered = report.kickstart_delivered,
            pending_error = report.pending_error.as_deref().unwrap_or("none"),
            "Session started"
        );

        Self {
            id,
            card: card.to_string(),
            codec,
            sample_rate,
            started_at: Utc::now(),
            running,
            link,
            counters,
            receive,
            transmit,
        }
    }

    /// Both workers have returned on their own.
    pub fn workers_finished(&self) -> bool {
        self.receive.is_finished() && self.transmit.is_finished()
    }

    pub fn duration_seconds(&self) -> f64 {
        Utc::now().signed_duration_since(self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Signal, join, then close the link.
    fn stop(self) -> SessionSummary {
        let duration_seconds = self.duration_seconds();
        self.running.store(false, Ordering::SeqCst);

        let receive_exit = self.receive.join("receive");
        let transmit_exit = self.transmit.join("transmit");

        let refs = Arc::strong_count(&self.link);
        if refs != 1 {
            warn!(session_id = %self.id, refs, "Link still referenced at close");
        }
        drop(self.link);

        let (rx_frames, tx_frames, silence_chunks) = self.counters.snapshot();
        let summary = SessionSummary {
            id: self.id,
            card: self.card,
            codec: self.codec,
            duration_seconds,
            receive_exit,
            transmit_exit,
            rx_frames,
            tx_frames,
            silence_chunks,
        };
        info!(
            session_id = %summary.id,
            card = summary.card.as_str(),
            codec = %summary.codec,
            duration_seconds = summary.duration_seconds,
            receive_exit = ?summary.receive_exit,
            transmit_exit = ?summary.transmit_exit,
            rx_frames = summary.rx_frames,
            tx_frames = summary.tx_frames,
            silence_chunks = summary.silence_chunks,
            "Session stopped"
        );
        summary
    }
}

/// Single-session state machine.
pub struct SessionController {
    devices: Arc<dyn AudioDevices>,
    transforms: Option<Arc<dyn TransformProvider>>,
    settings: SessionSettings,
    metrics: BridgeMetrics,
    active: Option<Session>,
}

impl SessionController {
    pub fn new(
        devices: Arc<dyn AudioDevices>,
        transforms: Option<Arc<dyn TransformProvider>>,
        settings: SessionSettings,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            devices,
            transforms,
            settings,
            metrics,
            active: None,
        }
    }

    /// Codecs to register for on the bus.
    pub fn supported_codecs(&self) -> Vec<CodecId> {
        let mut codecs = vec![CodecId::Cvsd];
        if self.transforms.is_some() {
            codecs.push(CodecId::Msbc);
        }
        codecs
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    /// Take over a new call's link, preempting any current session.
    ///
    /// On error the link has been closed and the controller is idle.
    pub fn new_connection<L: Link + 'static>(
        &mut self,
        card: &str,
        link: L,
        codec: CodecId,
    ) -> BridgeResult<Uuid> {
        if let Some(previous) = self.active.take() {
            info!(session_id = %previous.id, "Preempting active session for new connection");
            self.finish(previous);
            self.metrics.record_preempted();
        }

        let transforms = self.transforms.as_deref();
        let mode = match SessionMode::select(codec, transforms, self.settings.jitter_buffer_ms) {
            Ok(mode) => mode,
            Err(e) => {
                warn!(card, %codec, error = %e, "Refusing connection");
                self.metrics.record_refused();
                return Err(e);
            }
        };

        let session = Session::start(
            card,
            codec,
            Arc::new(link),
            mode,
            self.devices.as_ref(),
            &self.settings,
        );
        let id = session.id;
        self.active = Some(session);
        self.metrics.record_session_started();
        Ok(id)
    }

    /// Stop the active session, if any.
    pub fn release(&mut self) -> Option<SessionSummary> {
        let session = self.active.take()?;
        Some(self.finish(session))
    }

    /// Clean up a session whose workers have both exited on their own.
    pub fn reap_finished(&mut self) -> Option<SessionSummary> {
        if !self.active.as_ref()?.workers_finished() {
            return None;
        }
        let session = self.active.take()?;
        info!(session_id = %session.id, "Both workers exited, cleaning up session");
        self.metrics.record_reaped();
        Some(self.finish(session))
    }

    fn finish(&self, session: Session) -> SessionSummary {
        let summary = session.stop();
        self.metrics
            .record_traffic(summary.rx_frames, summary.tx_frames, summary.silence_chunks);
        debug!(totals = ?self.metrics.snapshot(), "Bridge totals");
        summary
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.release();
    }
}
