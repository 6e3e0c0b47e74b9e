//! # Audio Processing Module
//!
//! Everything between the SCO link and the host's sound devices.
//!
//! ## Key Components:
//! - **Transform**: the external SBC library behind an owned, finalised handle
//! - **mSBC framing**: H2 synchronisation header, sequence numbers, resync
//! - **Jitter buffer**: prefill-then-forward for passthrough calls
//! - **Devices**: playback/capture byte streams (spawned ALSA tools by default)
//!
//! ## Audio Format:
//! - **Sample Rate**: 8 kHz (CVSD) or 16 kHz (mSBC)
//! - **Bit Depth**: 16-bit signed, little-endian
//! - **Channels**: Mono

pub mod device;
pub mod jitter;
pub mod msbc;
pub mod transform;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bytes per S16LE mono sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Codec negotiated for a call, as numbered on the call-control bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CodecId {
    /// Narrowband; transcoding happens in the controller
    Cvsd = 1,
    /// Wideband; frames reach the host and are transcoded here
    Msbc = 2,
}

impl CodecId {
    pub fn sample_rate(self) -> SampleRate {
        match self {
            CodecId::Cvsd => SampleRate::Narrow,
            CodecId::Msbc => SampleRate::Wide,
        }
    }
}

impl TryFrom<u8> for CodecId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CodecId::Cvsd),
            2 => Ok(CodecId::Msbc),
            other => Err(format!("Unknown codec id: {}", other)),
        }
    }
}

impl From<CodecId> for u8 {
    fn from(codec: CodecId) -> u8 {
        codec as u8
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::Cvsd => write!(f, "CVSD"),
            CodecId::Msbc => write!(f, "mSBC"),
        }
    }
}

/// PCM rate of the host-side streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    Narrow,
    Wide,
}

impl SampleRate {
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Narrow => 8000,
            SampleRate::Wide => 16000,
        }
    }

    /// Bytes of S16LE mono audio covering `ms` milliseconds.
    pub fn bytes_for_ms(self, ms: u32) -> usize {
        self.hz() as usize * ms as usize / 1000 * BYTES_PER_SAMPLE
    }

    /// Playback time of `bytes` of audio.
    pub fn duration_of(self, bytes: usize) -> Duration {
        let samples = (bytes / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / self.hz() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_ids_match_bus_numbering() {
        assert_eq!(CodecId::try_from(1).unwrap(), CodecId::Cvsd);
        assert_eq!(CodecId::try_from(2).unwrap(), CodecId::Msbc);
        assert!(CodecId::try_from(3).is_err());
        assert_eq!(u8::from(CodecId::Msbc), 2);
    }

    #[test]
    fn test_rate_arithmetic() {
        assert_eq!(CodecId::Msbc.sample_rate().hz(), 16000);
        assert_eq!(SampleRate::Narrow.bytes_for_ms(300), 4800);
        // 240 bytes of mSBC input is 7.5ms of audio
        assert_eq!(SampleRate::Wide.duration_of(240), Duration::from_micros(7500));
        assert_eq!(SampleRate::Narrow.duration_of(48), Duration::from_millis(3));
    }
}
