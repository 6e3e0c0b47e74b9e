//! # Jitter Buffer
//!
//! Prefill buffer for passthrough calls. SCO delivers audio in irregular
//! bursts; holding back a fixed amount before the first write keeps the
//! playback device from underrunning on every gap.
//!
//! The buffer only ever delays: once the prefill has been released,
//! everything else is forwarded as it arrives, byte for byte.

use tracing::{debug, info};

/// Default prefill duration.
pub const DEFAULT_JITTER_MS: u32 = 300;

/// What the caller should forward after a [`JitterBuffer::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum Release<'a> {
    /// Still filling; nothing to forward yet
    Filling,
    /// Target reached: forward `prefill` (exactly the target size) then `overflow`
    Flush { prefill: &'a [u8], overflow: &'a [u8] },
    /// Already primed: forward the chunk unchanged
    Forward(&'a [u8]),
}

/// Prefill-then-forward byte accumulator.
///
/// ## Fields:
/// - **target**: bytes to hold back before the first release
/// - **pending**: bytes held so far; only grows until the target is reached
/// - **primed**: set once the prefill has gone out, never cleared
///
/// ## Rust Concepts:
/// - [`Release`] borrows from the buffer and the input, so a release is
///   forwarded without copying and must be consumed before the next push
#[derive(Debug)]
pub struct JitterBuffer {
    target: usize,
    pending: Vec<u8>,
    primed: bool,
}

impl JitterBuffer {
    pub fn new(fill_target_bytes: usize) -> Self {
        Self {
            target: fill_target_bytes,
            pending: Vec::with_capacity(fill_target_bytes),
            primed: fill_target_bytes == 0,
        }
    }

    /// Buffer `data` until the target is reached, then pass it through.
    pub fn push<'a>(&'a mut self, data: &'a [u8]) -> Release<'a> {
        if self.primed {
            return Release::Forward(data);
        }

        self.pending.extend_from_slice(data);
        if self.pending.len() < self.target {
            debug!(buffered = self.pending.len(), target = self.target, "Filling jitter buffer");
            return Release::Filling;
        }

        self.primed = true;
        info!(bytes = self.target, "Jitter buffer filled, switching to passthrough");
        let (prefill, overflow) = self.pending.split_at(self.target);
        Release::Flush { prefill, overflow }
    }
}
