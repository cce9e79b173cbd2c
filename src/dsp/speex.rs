//! Safe wrapper around SpeexDSP's preprocessor (denoise + speech probability).

use std::ffi::{c_int, c_void};

// ======================== FFI declarations ========================

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;
const SPEEX_PREPROCESS_GET_PROB: c_int = 45;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;
}

// ======================== Preprocessor ========================

/// One mono preprocessor instance; frames must be exactly `frame_size` samples.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used from a single thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state, frame_size })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Enable or disable denoising.
    pub fn set_denoise(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_DENOISE,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set noise suppress level in dB (negative value, e.g. -25).
    pub fn set_noise_suppress(&mut self, level: i32) {
        let mut val: c_int = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_NOISE_SUPPRESS,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Speech probability of the last processed frame, in [0, 1].
    pub fn speech_probability(&mut self) -> f32 {
        let mut val: c_int = 0;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_GET_PROB,
                &mut val as *mut c_int as *mut c_void,
            );
        }
        (val as f32 / 100.0).clamp(0.0, 1.0)
    }

    /// Run the preprocessor on one frame in place.
    pub fn process(&mut self, samples: &mut [i16]) -> anyhow::Result<()> {
        if samples.len() != self.frame_size {
            anyhow::bail!(
                "speex frame must be {} samples, got {}",
                self.frame_size,
                samples.len()
            );
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
        Ok(())
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}
