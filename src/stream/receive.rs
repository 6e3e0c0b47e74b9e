//! Receive worker: link → playback.

use std::io::{self, Write};
use std::thread;
use tracing::{debug, info, warn};

use super::{StreamCounters, WorkerContext, WorkerExit};
use crate::audio::device::PlaybackStream;
use crate::audio::jitter::{JitterBuffer, Release};
use crate::audio::msbc::MsbcDecoder;
use crate::link::is_transient;

/// Largest packet we expect from an SCO socket in one read.
const RECV_BUFFER_LEN: usize = 1024;

/// Receive-side half of a [`super::SessionMode`].
pub enum ReceivePath {
    Direct,
    Jitter(JitterBuffer),
    Wideband(MsbcDecoder),
}

impl ReceivePath {
    /// Turn one link read into playback writes, in order.
    ///
    /// Returns how many frames the read counts for: one per packet, or the
    /// number of mSBC frames decoded from it.
    fn forward(&mut self, data: &[u8], playback: &mut dyn Write) -> io::Result<u64> {
        let frames = match self {
            ReceivePath::Direct => {
                playback.write_all(data)?;
                1
            }
            ReceivePath::Jitter(buffer) => {
                match buffer.push(data) {
                    Release::Filling => {}
                    Release::Flush { prefill, overflow } => {
                        playback.write_all(prefill)?;
                        playback.write_all(overflow)?;
                    }
                    Release::Forward(chunk) => playback.write_all(chunk)?,
                }
                1
            }
            ReceivePath::Wideband(decoder) => {
                let before = decoder.frames();
                let pcm = decoder.decode(data);
                if pcm.is_empty() {
                    return Ok(decoder.frames() - before);
                }
                playback.write_all(&pcm)?;
                decoder.frames() - before
            }
        };
        playback.flush()?;
        Ok(frames)
    }
}

/// Run until stopped or until the link or playback fails.
///
/// Empty reads are treated as "not flowing yet" rather than end of stream,
/// and the worker waits one poll interval before reading again: a link that
/// hung up keeps reporting itself readable.
pub fn run(ctx: WorkerContext, mut path: ReceivePath, mut playback: PlaybackStream) -> WorkerExit {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let mut timeouts = 0u32;
    let mut empty_reads = 0u64;
    let mut logged_first = false;

    info!("Receive worker started");
    let exit = loop {
        if !ctx.is_running() {
            break WorkerExit::Stopped;
        }

        match ctx.link.wait_readable(ctx.timing.poll_timeout) {
            Ok(true) => {}
            // Also covers the window where the baseband connection is still coming up
            Ok(false) => continue,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!(error = %e, "Waiting for link failed");
                break WorkerExit::LinkError(e.kind());
            }
        }

        let n = match ctx.link.recv(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads == 1 {
                    debug!("Empty read from link, waiting for audio");
                }
                thread::sleep(ctx.timing.poll_timeout);
                continue;
            }
            Ok(n) => n,
            Err(e) if is_transient(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                timeouts += 1;
                if timeouts >= ctx.timing.max_link_timeouts {
                    warn!(timeouts, "Link keeps timing out, giving up");
                    break WorkerExit::LinkTimedOut;
                }
                debug!(timeouts, "Link timed out, backing off");
                thread::sleep(ctx.timing.timeout_backoff);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Link receive failed");
                break WorkerExit::LinkError(e.kind());
            }
        };

        timeouts = 0;
        if !logged_first {
            info!(bytes = n, empty_reads, "Audio flowing from link");
            logged_first = true;
        }

        match path.forward(&buf[..n], playback.as_mut()) {
            Ok(frames) => StreamCounters::add(&ctx.counters.rx_frames, frames),
            Err(e) => {
                warn!(error = %e, "Playback device closed");
                break WorkerExit::PlaybackClosed;
            }
        }
    };

    info!(?exit, "Receive worker finished");
    exit
}
