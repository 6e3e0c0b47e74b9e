//! Transmit worker: capture → link.
//!
//! A dead capture device must not kill the call: the remote side hangs up on
//! a silent link, so the worker keeps sending silence at the codec's pace.

use std::borrow::Cow;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{StreamCounters, WorkerContext, WorkerExit};
use crate::audio::device::CaptureStream;
use crate::audio::msbc::MsbcEncoder;
use crate::audio::SampleRate;
use crate::link::is_transient;

/// Transmit-side half of a [`super::SessionMode`].
///
/// `Direct` writes capture bytes as they are, `chunk` at a time; `Wideband`
/// owns the encoder and its sequence counter for the life of the session.
pub enum TransmitPath {
    Direct { chunk: usize },
    Wideband(MsbcEncoder),
}

impl TransmitPath {
    pub fn chunk_size(&self) -> usize {
        match self {
            TransmitPath::Direct { chunk } => *chunk,
            TransmitPath::Wideband(encoder) => encoder.chunk_size(),
        }
    }

    /// The link packet for one PCM chunk, if any.
    fn prepare<'a>(&mut self, pcm: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        match self {
            TransmitPath::Direct { .. } => Some(Cow::Borrowed(pcm)),
            TransmitPath::Wideband(encoder) => encoder.encode(pcm).map(|frame| Cow::Owned(frame.to_vec())),
        }
    }
}

/// Errors that mean "the link is not ready right now".
fn is_retryable_write(err: &io::Error) -> bool {
    is_transient(err) || matches!(err.kind(), io::ErrorKind::NotConnected | io::ErrorKind::TimedOut)
}

/// Outcome of pushing one packet to the link.
///
/// ## Variants:
/// - **Sent**: the link took the packet; resets the failure counter
/// - **Dropped**: a hard write error; the packet is lost and the failure
///   counter has been bumped
/// - **Stopped**: the running flag was cleared while retrying
/// - **GaveUp**: the failure counter passed its bound
enum Delivery {
    Sent,
    Dropped,
    Stopped,
    GaveUp,
}

/// Run until stopped or until writes keep failing.
///
/// `capture` of `None` means the device could not be opened; the worker
/// starts in silence mode.
pub fn run(
    ctx: WorkerContext,
    mut path: TransmitPath,
    mut capture: Option<CaptureStream>,
    rate: SampleRate,
) -> WorkerExit {
    let chunk_size = path.chunk_size();
    let cadence = rate.duration_of(chunk_size);
    let silence = vec![0u8; chunk_size];
    let mut pcm = vec![0u8; chunk_size];
    let mut failures = 0u32;

    info!(chunk_size, "Transmit worker started");
    if capture.is_none() {
        warn!("No capture device, transmitting silence");
    }

    let exit = loop {
        if !ctx.is_running() {
            break WorkerExit::Stopped;
        }

        let chunk: &[u8] = match capture.as_mut().map(|device| device.read_exact(&mut pcm)) {
            Some(Ok(())) => &pcm,
            Some(Err(e)) => {
                warn!(error = %e, "Capture device exited, switching to silence");
                capture = None;
                &silence
            }
            None => {
                thread::sleep(cadence);
                &silence
            }
        };
        let from_silence = capture.is_none();

        let Some(packet) = path.prepare(chunk) else {
            continue;
        };

        match deliver(&ctx, &packet, &mut failures) {
            Delivery::Sent => {
                StreamCounters::bump(&ctx.counters.tx_frames);
                if from_silence {
                    StreamCounters::bump(&ctx.counters.silence_chunks);
                }
            }
            Delivery::Dropped => {}
            Delivery::Stopped => break WorkerExit::Stopped,
            Delivery::GaveUp => break WorkerExit::TooManyWriteFailures,
        }
    };

    info!(?exit, "Transmit worker finished");
    exit
}

/// Write one packet, retrying while the link is merely not ready.
fn deliver(ctx: &WorkerContext, packet: &[u8], failures: &mut u32) -> Delivery {
    loop {
        if !ctx.is_running() {
            return Delivery::Stopped;
        }

        match ctx.link.send(packet) {
            Ok(_) => {
                *failures = 0;
                return Delivery::Sent;
            }
            Err(e) if is_retryable_write(&e) => {
                debug!(error = %e, "Link not ready for write, retrying");
                backoff(ctx.timing.write_backoff);
            }
            Err(e) => {
                *failures += 1;
                if *failures <= ctx.timing.logged_write_failures {
                    warn!(failures = *failures, error = %e, "Link write failed");
                }
                if *failures > ctx.timing.max_write_failures {
                    warn!(failures = *failures, "Too many link write failures, giving up");
                    return Delivery::GaveUp;
                }
                return Delivery::Dropped;
            }
        }
    }
}

fn backoff(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::msbc::{H2_SEQUENCE, MSBC_FRAME_LEN};
    use crate::testing::{context, FakeTransform, MockLink, ScriptedCapture};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    fn wait_for_sends(link: &MockLink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while link.sent().len() < count {
            assert!(Instant::now() < deadline, "only {} sends", link.sent().len());
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_capture_is_forwarded_in_chunks() {
        let link = Arc::new(MockLink::new());
        let ctx = context(link.clone());
        let input: Vec<u8> = (0..96u8).collect();
        let capture = ScriptedCapture::then_quiet(input.clone());

        let worker_ctx = ctx.clone();
        let handle = thread::spawn(move || {
            run(worker_ctx, TransmitPath::Direct { chunk: 48 }, Some(Box::new(capture)), SampleRate::Narrow)
        });

        wait_for_sends(&link, 2);
        ctx.running.store(false, Ordering::SeqCst);
        let sent = link.sent();
        assert_eq!(sent[0], &input[..48]);
        assert_eq!(sent[1], &input[48..]);
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
    }

    #[test]
    fn test_exited_capture_switches_to_silence_indefinitely() {
        let link = Arc::new(MockLink::new());
        let ctx = context(link.clone());
        let capture = ScriptedCapture::then_eof(vec![5; 48]);

        let worker_ctx = ctx.clone();
        let handle = thread::spawn(move || {
            run(worker_ctx, TransmitPath::Direct { chunk: 48 }, Some(Box::new(capture)), SampleRate::Narrow)
        });

        wait_for_sends(&link, 20);
        assert!(!handle.is_finished());
        let sent = link.sent();
        assert_eq!(sent[0], vec![5; 48]);
        assert!(sent[1..].iter().all(|packet| packet.len() == 48 && packet.iter().all(|&b| b == 0)));
        assert!(ctx.counters.silence_chunks.load(Ordering::Relaxed) >= 18);

        ctx.running.store(false, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
    }

    #[test]
    fn test_missing_capture_sends_silent_wideband_frames() {
        let link = Arc::new(MockLink::new());
        let ctx = context(link.clone());
        let path = TransmitPath::Wideband(MsbcEncoder::new(FakeTransform::boxed()));

        let worker_ctx = ctx.clone();
        let handle = thread::spawn(move || run(worker_ctx, path, None, SampleRate::Wide));

        wait_for_sends(&link, 5);
        ctx.running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        let sent = link.sent();
        for (i, frame) in sent.iter().take(5).enumerate() {
            assert_eq!(frame.len(), MSBC_FRAME_LEN);
            assert_eq!(frame[1], H2_SEQUENCE[i % 4]);
        }
    }

    #[test]
    fn test_not_connected_writes_retry_same_chunk() {
        let link = Arc::new(MockLink::new());
        link.fail_sends(io::ErrorKind::NotConnected, 3);
        link.fail_sends(io::ErrorKind::TimedOut, 2);
        let ctx = context(link.clone());
        let capture = ScriptedCapture::then_quiet(vec![8; 48]);

        let worker_ctx = ctx.clone();
        let handle = thread::spawn(move || {
            run(worker_ctx, TransmitPath::Direct { chunk: 48 }, Some(Box::new(capture)), SampleRate::Narrow)
        });

        wait_for_sends(&link, 1);
        ctx.running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(link.sent()[0], vec![8; 48]);
    }

    #[test]
    fn test_persistent_write_errors_end_worker() {
        let link = Arc::new(MockLink::new());
        link.fail_sends(io::ErrorKind::BrokenPipe, 1000);
        let ctx = context(link.clone());

        let worker_ctx = ctx.clone();
        let handle = thread::spawn(move || {
            run(worker_ctx, TransmitPath::Direct { chunk: 48 }, None, SampleRate::Narrow)
        });

        assert_eq!(handle.join().unwrap(), WorkerExit::TooManyWriteFailures);
        // Bound of 10 is exceeded on the 11th consecutive failure
        assert_eq!(link.send_attempts(), 11);
    }
}
