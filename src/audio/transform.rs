//! # Codec Transform
//!
//! The SBC library is an external collaborator with opaque per-instance
//! state. [`SbcTransform`] is the owned handle the frame codec drives;
//! [`TransformProvider`] creates handles and is absent when the library is.
//!
//! With the `libsbc` feature the system library is linked directly. Without
//! it [`detect`] returns `None` and the bridge offers narrowband calls only.

use std::sync::Arc;

use crate::error::BridgeResult;

/// One initialised mSBC codec instance.
///
/// Implementations finalise their state in `finish` and must make `finish`
/// idempotent so it can also be called from `Drop`.
pub trait SbcTransform: Send {
    /// PCM bytes consumed by one `encode` call.
    fn codesize(&self) -> usize;

    /// Decode one encoded payload into PCM. An empty result is not an error.
    fn decode(&mut self, payload: &[u8]) -> BridgeResult<Vec<u8>>;

    /// Encode exactly `codesize()` bytes of PCM.
    fn encode(&mut self, pcm: &[u8]) -> BridgeResult<Vec<u8>>;

    /// Release the library state.
    fn finish(&mut self);
}

/// Factory for transform instances (`init_wideband`).
pub trait TransformProvider: Send + Sync {
    fn init_wideband(&self) -> BridgeResult<Box<dyn SbcTransform>>;
}

/// Find a usable transform, trying to initialise one instance.
pub fn detect() -> Option<Arc<dyn TransformProvider>> {
    #[cfg(feature = "libsbc")]
    {
        let provider = libsbc::LibSbc;
        match provider.init_wideband() {
            Ok(mut instance) => {
                instance.finish();
                tracing::info!("libsbc available, wideband calls enabled");
                Some(Arc::new(provider) as Arc<dyn TransformProvider>)
            }
            Err(e) => {
                tracing::warn!(error = %e, "libsbc failed to initialise mSBC");
                None
            }
        }
    }

    #[cfg(not(feature = "libsbc"))]
    {
        tracing::info!("Built without libsbc, wideband calls disabled");
        None
    }
}

#[cfg(feature = "libsbc")]
mod libsbc {
    use super::{SbcTransform, TransformProvider};
    use crate::error::{BridgeError, BridgeResult};
    use std::os::raw::{c_int, c_ulong, c_void};

    /// Mirror of `sbc_t` from `<sbc/sbc.h>`.
    #[repr(C)]
    struct SbcT {
        flags: c_ulong,
        frequency: u8,
        blocks: u8,
        subbands: u8,
        mode: u8,
        allocation: u8,
        bitpool: u8,
        endian: u8,
        private: *mut c_void,
        priv_alloc_base: *mut c_void,
    }

    #[link(name = "sbc")]
    extern "C" {
        fn sbc_init_msbc(sbc: *mut SbcT, flags: c_ulong) -> c_int;
        fn sbc_get_codesize(sbc: *mut SbcT) -> usize;
        fn sbc_decode(
            sbc: *mut SbcT,
            input: *const c_void,
            input_len: usize,
            output: *mut c_void,
            output_len: usize,
            written: *mut usize,
        ) -> isize;
        fn sbc_encode(
            sbc: *mut SbcT,
            input: *const c_void,
            input_len: usize,
            output: *mut c_void,
            output_len: usize,
            written: *mut isize,
        ) -> isize;
        fn sbc_finish(sbc: *mut SbcT);
    }

    /// Upper bound for one decoded mSBC frame (120 samples).
    const PCM_OUT_LEN: usize = 512;
    /// Upper bound for one encoded mSBC frame.
    const ENCODED_OUT_LEN: usize = 128;

    pub struct LibSbc;

    impl TransformProvider for LibSbc {
        fn init_wideband(&self) -> BridgeResult<Box<dyn SbcTransform>> {
            let mut state = Box::new(SbcT {
                flags: 0,
                frequency: 0,
                blocks: 0,
                subbands: 0,
                mode: 0,
                allocation: 0,
                bitpool: 0,
                endian: 0,
                private: std::ptr::null_mut(),
                priv_alloc_base: std::ptr::null_mut(),
            });
            // SAFETY: state is a valid, zeroed sbc_t.
            let ret = unsafe { sbc_init_msbc(&mut *state, 0) };
            if ret < 0 {
                return Err(BridgeError::Transform(format!("sbc_init_msbc returned {}", ret)));
            }
            // SAFETY: state was initialised above.
            let codesize = unsafe { sbc_get_codesize(&mut *state) };
            Ok(Box::new(MsbcState {
                state,
                codesize,
                live: true,
            }))
        }
    }

    struct MsbcState {
        state: Box<SbcT>,
        codesize: usize,
        live: bool,
    }

    // The raw pointers inside sbc_t are only touched through &mut self.
    unsafe impl Send for MsbcState {}

    impl SbcTransform for MsbcState {
        fn codesize(&self) -> usize {
            self.codesize
        }

        fn decode(&mut self, payload: &[u8]) -> BridgeResult<Vec<u8>> {
            let mut out = vec![0u8; PCM_OUT_LEN];
            let mut written: usize = 0;
            // SAFETY: buffers are valid for the given lengths.
            let ret = unsafe {
                sbc_decode(
                    &mut *self.state,
                    payload.as_ptr().cast(),
                    payload.len(),
                    out.as_mut_ptr().cast(),
                    out.len(),
                    &mut written,
                )
            };
            if ret < 0 {
                return Err(BridgeError::Transform(format!("sbc_decode returned {}", ret)));
            }
            out.truncate(written);
            Ok(out)
        }

        fn encode(&mut self, pcm: &[u8]) -> BridgeResult<Vec<u8>> {
            let mut out = vec![0u8; ENCODED_OUT_LEN];
            let mut written: isize = 0;
            // SAFETY: buffers are valid for the given lengths.
            let ret = unsafe {
                sbc_encode(
                    &mut *self.state,
                    pcm.as_ptr().cast(),
                    pcm.len(),
                    out.as_mut_ptr().cast(),
                    out.len(),
                    &mut written,
                )
            };
            if ret < 0 || written < 0 {
                return Err(BridgeError::Transform(format!("sbc_encode returned {}", ret)));
            }
            out.truncate(written as usize);
            Ok(out)
        }

        fn finish(&mut self) {
            if self.live {
                // SAFETY: state was initialised and is finished once.
                unsafe { sbc_finish(&mut *self.state) };
                self.live = false;
            }
        }
    }

    impl Drop for MsbcState {
        fn drop(&mut self) {
            self.finish();
        }
    }
}

#[cfg(all(test, not(feature = "libsbc")))]
mod tests {
    use super::*;

    #[test]
    fn test_no_library_disables_wideband() {
        assert!(detect().is_none());
    }
}
