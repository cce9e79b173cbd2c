//! Noise-suppression backends and the multi-channel framing around them.

use std::path::PathBuf;

use anyhow::Result;

use super::NsAlgorithm;

/// A stateful mono noise suppressor working on fixed-size hops.
pub trait Denoiser: Send {
    /// Samples consumed and produced per call.
    fn hop(&self) -> usize;

    /// Denoise one hop in place, returning a speech probability when the
    /// backend produces one.
    fn denoise(&mut self, frame: &mut [i16]) -> Result<Option<f32>>;
}

/// Builds one mono backend for the given algorithm and sample rate.
pub type BackendLoader = Box<dyn Fn(NsAlgorithm, u32) -> Result<Box<dyn Denoiser>> + Send>;

#[cfg(feature = "speexdsp")]
mod classical {
    use anyhow::Result;

    use super::Denoiser;
    use crate::dsp::speex::Preprocessor;

    pub const SPEEX_FRAME: usize = 480;

    pub struct SpeexDenoiser {
        pre: Preprocessor,
    }

    impl SpeexDenoiser {
        pub fn new(sample_rate: u32) -> Result<Self> {
            let mut pre = Preprocessor::new(SPEEX_FRAME, sample_rate)?;
            pre.set_denoise(true);
            pre.set_noise_suppress(-25);
            Ok(Self { pre })
        }
    }

    impl Denoiser for SpeexDenoiser {
        fn hop(&self) -> usize {
            self.pre.frame_size()
        }

        fn denoise(&mut self, frame: &mut [i16]) -> Result<Option<f32>> {
            self.pre.process(frame)?;
            Ok(Some(self.pre.speech_probability()))
        }
    }
}

/// Default backend loader.
///
/// The neural backend walks `model_candidates` in order and uses the first
/// model file that exists.
pub fn backend_loader(model_candidates: Vec<PathBuf>) -> BackendLoader {
    Box::new(move |algorithm, sample_rate| load_backend(algorithm, sample_rate, &model_candidates))
}

fn load_backend(
    algorithm: NsAlgorithm,
    sample_rate: u32,
    model_candidates: &[PathBuf],
) -> Result<Box<dyn Denoiser>> {
    match algorithm {
        NsAlgorithm::Speexdsp => load_classical(sample_rate),
        NsAlgorithm::Neural => load_neural(sample_rate, model_candidates),
    }
}

#[cfg(feature = "speexdsp")]
fn load_classical(sample_rate: u32) -> Result<Box<dyn Denoiser>> {
    Ok(Box::new(classical::SpeexDenoiser::new(sample_rate)?))
}

#[cfg(not(feature = "speexdsp"))]
fn load_classical(_sample_rate: u32) -> Result<Box<dyn Denoiser>> {
    anyhow::bail!("classical noise suppression is not compiled in")
}

#[cfg(feature = "onnx")]
fn load_neural(sample_rate: u32, model_candidates: &[PathBuf]) -> Result<Box<dyn Denoiser>> {
    use super::neural::{OnnxModel, StftDenoiser, locate_model};

    if sample_rate != 48000 {
        log::warn!("Neural noise model expects 48000Hz, stream is {}Hz", sample_rate);
    }
    let path = locate_model(model_candidates).ok_or_else(|| {
        anyhow::anyhow!(
            "no noise model found (tried {})",
            model_candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })?;
    Ok(Box::new(StftDenoiser::new(OnnxModel::load(&path)?)))
}

#[cfg(not(feature = "onnx"))]
fn load_neural(_sample_rate: u32, _model_candidates: &[PathBuf]) -> Result<Box<dyn Denoiser>> {
    anyhow::bail!("neural noise suppression is not compiled in")
}

/// One backend per channel over interleaved buffers.
///
/// Only whole hops are processed; a trailing partial hop passes through
/// untouched.
pub struct NoiseStage {
    per_channel: Vec<Box<dyn Denoiser>>,
    scratch: Vec<i16>,
}

impl NoiseStage {
    pub fn new(per_channel: Vec<Box<dyn Denoiser>>) -> Self {
        Self {
            per_channel,
            scratch: Vec::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.per_channel.len()
    }

    /// Returns the mean speech probability over the processed hops, if the
    /// backend reports one.
    pub fn process(&mut self, samples: &mut [i16]) -> Result<Option<f32>> {
        let channels = self.per_channel.len();
        if channels == 0 {
            return Ok(None);
        }
        let hop = self.per_channel[0].hop();
        let hops = samples.len() / channels / hop;
        if self.scratch.len() != hop {
            self.scratch = vec![0; hop];
        }

        let mut prob_sum = 0.0f32;
        let mut prob_hops = 0usize;
        let mut has_prob = true;

        for h in 0..hops {
            let block = &mut samples[h * hop * channels..(h + 1) * hop * channels];
            let mut hop_sum = 0.0f32;
            for (c, backend) in self.per_channel.iter_mut().enumerate() {
                for (i, s) in self.scratch.iter_mut().enumerate() {
                    *s = block[i * channels + c];
                }
                match backend.denoise(&mut self.scratch)? {
                    Some(p) => hop_sum += p,
                    None => has_prob = false,
                }
                for (i, &s) in self.scratch.iter().enumerate() {
                    block[i * channels + c] = s;
                }
            }
            prob_sum += hop_sum / channels as f32;
            prob_hops += 1;
        }

        Ok((has_prob && prob_hops > 0).then(|| prob_sum / prob_hops as f32))
    }
}
