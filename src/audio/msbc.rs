//! # mSBC Frame Codec
//!
//! Wideband SCO packets carry one mSBC frame each, wrapped in an H2 header:
//!
//! ```text
//! [0x01][seq][57-byte SBC payload][0xFF]    60 bytes
//! ```
//!
//! `seq` cycles through `0x08, 0x38, 0xC8, 0xF8`. The decoder does not trust
//! packet boundaries: it scans for the header at every offset, so a stream
//! that lost bytes resynchronises on the next intact frame.

use tracing::{debug, warn};

use super::transform::SbcTransform;

/// First byte of every H2 header.
pub const H2_SYNC: u8 = 0x01;

/// Allowed second header bytes, in transmit order.
pub const H2_SEQUENCE: [u8; 4] = [0x08, 0x38, 0xC8, 0xF8];

pub const H2_HEADER_LEN: usize = 2;
pub const MSBC_PAYLOAD_LEN: usize = 57;
pub const MSBC_PADDING: u8 = 0xFF;

/// Header, payload and trailing padding byte.
pub const MSBC_FRAME_LEN: usize = H2_HEADER_LEN + MSBC_PAYLOAD_LEN + 1;

fn is_header(first: u8, second: u8) -> bool {
    first == H2_SYNC && H2_SEQUENCE.contains(&second)
}

/// Receive half: H2 deframing plus the decode transform instance.
///
/// ## Fields:
/// - **transform**: decode instance, finished when the decoder drops
/// - **pending**: tail of the previous read that may still start a frame
/// - **frames**: frames handed to the transform successfully
/// - **decode_errors**: frames the transform rejected
pub struct MsbcDecoder {
    transform: Box<dyn SbcTransform>,
    pending: Vec<u8>,
    frames: u64,
    decode_errors: u64,
}

impl MsbcDecoder {
    pub fn new(transform: Box<dyn SbcTransform>) -> Self {
        Self {
            transform,
            pending: Vec::with_capacity(2 * MSBC_FRAME_LEN),
            frames: 0,
            decode_errors: 0,
        }
    }

    /// Decode every frame found in `input`, concatenating the PCM in order.
    ///
    /// Bytes that do not start a complete frame are skipped one at a time. A
    /// frame cut off at the end of `input` is kept and completed by the next
    /// call, so frames split across reads still decode.
    pub fn decode(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);

        let mut pcm = Vec::new();
        let mut pos = 0;

        while pos + H2_HEADER_LEN + MSBC_PAYLOAD_LEN <= self.pending.len() {
            if !is_header(self.pending[pos], self.pending[pos + 1]) {
                pos += 1;
                continue;
            }

            let start = pos + H2_HEADER_LEN;
            let payload = &self.pending[start..start + MSBC_PAYLOAD_LEN];
            match self.transform.decode(payload) {
                Ok(out) => {
                    self.frames += 1;
                    pcm.extend_from_slice(&out);
                }
                Err(e) => {
                    self.decode_errors += 1;
                    if self.decode_errors <= 3 {
                        warn!(error = %e, "mSBC frame failed to decode");
                    }
                }
            }
            pos = start + MSBC_PAYLOAD_LEN + 1;
        }

        // Whatever is left is shorter than a frame; drop the bytes that
        // cannot start one.
        let pos = pos.min(self.pending.len());
        let keep_from = (pos..self.pending.len())
            .find(|&i| {
                self.pending[i] == H2_SYNC
                    && self.pending.get(i + 1).map_or(true, |&seq| H2_SEQUENCE.contains(&seq))
            })
            .unwrap_or(self.pending.len());
        self.pending.drain(..keep_from);

        pcm
    }

    /// Frames decoded so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for MsbcDecoder {
    fn drop(&mut self) {
        debug!(
            frames = self.frames,
            errors = self.decode_errors,
            pending = self.pending(),
            "Finishing mSBC decoder"
        );
        self.transform.finish();
    }
}

/// Transmit half: encode transform instance plus the H2 sequence counter.
pub struct MsbcEncoder {
    transform: Box<dyn SbcTransform>,
    sequence: usize,
}

impl MsbcEncoder {
    pub fn new(transform: Box<dyn SbcTransform>) -> Self {
        Self {
            transform,
            sequence: 0,
        }
    }

    /// PCM bytes needed per frame.
    pub fn chunk_size(&self) -> usize {
        self.transform.codesize()
    }

    /// Encode one chunk into a complete frame.
    ///
    /// `None` when the transform fails or produces nothing; the sequence number
    /// only advances for frames actually built.
    pub fn encode(&mut self, pcm: &[u8]) -> Option<[u8; MSBC_FRAME_LEN]> {
        let payload = match self.transform.encode(pcm) {
            Ok(payload) if !payload.is_empty() => payload,
            Ok(_) => return None,
            Err(e) => {
                debug!(error = %e, "mSBC encode failed");
                return None;
            }
        };

        let mut frame = [0u8; MSBC_FRAME_LEN];
        frame[0] = H2_SYNC;
        frame[1] = H2_SEQUENCE[self.sequence];
        let len = payload.len().min(MSBC_PAYLOAD_LEN);
        frame[H2_HEADER_LEN..H2_HEADER_LEN + len].copy_from_slice(&payload[..len]);
        frame[MSBC_FRAME_LEN - 1] = MSBC_PADDING;

        self.sequence = (self.sequence + 1) % H2_SEQUENCE.len();
        Some(frame)
    }
}

impl Drop for MsbcEncoder {
    fn drop(&mut self) {
        self.transform.finish();
    }
}
