//! # Stream Engine
//!
//! Two blocking workers per call:
//! - **receive**: link → (deframe/decode | jitter) → playback
//! - **transmit**: capture (or silence) → (encode/frame) → link
//!
//! They share the link and a running flag and nothing else. Each decides on
//! its own when the link is beyond saving and reports why it stopped through
//! [`WorkerExit`].

pub mod receive;
pub mod transmit;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::jitter::JitterBuffer;
use crate::audio::msbc::{MsbcDecoder, MsbcEncoder, MSBC_FRAME_LEN};
use crate::audio::transform::TransformProvider;
use crate::audio::{CodecId, SampleRate};
use crate::config::StreamConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::link::Link;

/// Transmit chunk for calls without a transform.
pub const PASSTHROUGH_CHUNK: usize = 48;

/// Why a worker returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The running flag was cleared
    Stopped,
    /// Too many consecutive connection timeouts on receive
    LinkTimedOut,
    /// A receive failed with a non-retryable error
    LinkError(io::ErrorKind),
    /// The playback device went away
    PlaybackClosed,
    /// Persistent write errors on transmit
    TooManyWriteFailures,
    /// The worker thread panicked
    Panicked,
}

/// Retry policy shared by both workers.
///
/// ## Fields:
/// - **poll_timeout**: longest wait for the link to become readable; also the
///   pause after an empty read
/// - **max_link_timeouts**: consecutive `TimedOut` reads that end the receive worker
/// - **timeout_backoff**: pause after each of those
/// - **write_backoff**: pause before retrying a write the link was not ready for
/// - **max_write_failures**: consecutive hard write errors that end the transmit worker
#[derive(Debug, Clone)]
pub struct StreamTiming {
    pub poll_timeout: Duration,
    pub max_link_timeouts: u32,
    pub timeout_backoff: Duration,
    pub write_backoff: Duration,
    pub max_write_failures: u32,
    /// Hard write errors logged before going quiet
    pub logged_write_failures: u32,
}

impl From<&StreamConfig> for StreamTiming {
    fn from(config: &StreamConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            max_link_timeouts: config.max_link_timeouts,
            timeout_backoff: Duration::from_millis(config.timeout_backoff_ms),
            write_backoff: Duration::from_millis(config.write_backoff_ms),
            max_write_failures: config.max_write_failures,
            logged_write_failures: 3,
        }
    }
}

/// Counters updated by the workers, read by the controller.
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Link packets forwarded to playback; decoded frames on wideband
    pub rx_frames: AtomicU64,
    /// Packets written to the link
    pub tx_frames: AtomicU64,
    /// Transmitted chunks synthesised because capture was gone
    pub silence_chunks: AtomicU64,
}

impl StreamCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.rx_frames.load(Ordering::Relaxed),
            self.tx_frames.load(Ordering::Relaxed),
            self.silence_chunks.load(Ordering::Relaxed),
        )
    }
}

/// What each worker gets to work with.
///
/// ## Fields:
/// - **link**: shared with the other worker and the session; never closed here
/// - **running**: cleared by the controller to stop both workers
/// - **counters**: traffic totals read back when the session stops
/// - **timing**: retry policy
///
/// ## Rust Concepts:
/// - `Clone` copies the `Arc`s, so both workers observe the same flag and
///   link while each owns its own context
#[derive(Clone)]
pub struct WorkerContext {
    pub link: Arc<dyn Link>,
    pub running: Arc<AtomicBool>,
    pub counters: Arc<StreamCounters>,
    pub timing: StreamTiming,
}

impl WorkerContext {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Per-call operating mode, chosen once when the session starts.
///
/// ## Rust Concepts:
/// - Each variant owns what its direction halves need; [`SessionMode::split`]
///   moves them into the two workers, so no codec state is shared between threads
pub enum SessionMode {
    /// CVSD handled by the controller; PCM forwarded as-is
    Narrowband,
    /// mSBC framed and transcoded on the host
    Wideband {
        decoder: MsbcDecoder,
        encoder: MsbcEncoder,
    },
    /// Narrowband behind a prefill jitter buffer
    Passthrough { fill_target_bytes: usize },
}

impl SessionMode {
    /// Pick the mode for a negotiated codec.
    ///
    /// Wideband needs a transform provider; without one the call is refused.
    pub fn select(
        codec: CodecId,
        transforms: Option<&dyn TransformProvider>,
        jitter_buffer_ms: u32,
    ) -> BridgeResult<Self> {
        match codec {
            CodecId::Msbc => {
                let provider = transforms.ok_or_else(|| {
                    BridgeError::Transform("wideband requested but no transform available".into())
                })?;
                Ok(SessionMode::Wideband {
                    decoder: MsbcDecoder::new(provider.init_wideband()?),
                    encoder: MsbcEncoder::new(provider.init_wideband()?),
                })
            }
            CodecId::Cvsd if jitter_buffer_ms > 0 => Ok(SessionMode::Passthrough {
                fill_target_bytes: SampleRate::Narrow.bytes_for_ms(jitter_buffer_ms),
            }),
            CodecId::Cvsd => Ok(SessionMode::Narrowband),
        }
    }

    pub fn sample_rate(&self) -> SampleRate {
        match self {
            SessionMode::Wideband { .. } => SampleRate::Wide,
            SessionMode::Narrowband | SessionMode::Passthrough { .. } => SampleRate::Narrow,
        }
    }

    /// Size of one packet on the link, used for the handshake kickstart.
    pub fn link_packet_len(&self) -> usize {
        match self {
            SessionMode::Wideband { .. } => MSBC_FRAME_LEN,
            SessionMode::Narrowband | SessionMode::Passthrough { .. } => PASSTHROUGH_CHUNK,
        }
    }

    /// Hand each direction its half.
    pub fn split(self) -> (receive::ReceivePath, transmit::TransmitPath) {
        match self {
            SessionMode::Narrowband => (
                receive::ReceivePath::Direct,
                transmit::TransmitPath::Direct {
                    chunk: PASSTHROUGH_CHUNK,
                },
            ),
            SessionMode::Passthrough { fill_target_bytes } => (
                receive::ReceivePath::Jitter(JitterBuffer::new(fill_target_bytes)),
                transmit::TransmitPath::Direct {
                    chunk: PASSTHROUGH_CHUNK,
                },
            ),
            SessionMode::Wideband { decoder, encoder } => (
                receive::ReceivePath::Wideband(decoder),
                transmit::TransmitPath::Wideband(encoder),
            ),
        }
    }
}
