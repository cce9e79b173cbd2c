//! dsp - Consumer-side speech enhancement
//!
//! Stages run in a fixed order on interleaved i16:
//! noise suppression → dereverberation → AGC → amplification → VAD gate.
//! A stage that fails is switched off for the rest of the session and the
//! audio continues unprocessed by it.

pub mod denoise;
pub mod neural;
#[cfg(feature = "speexdsp")]
mod speex;
pub mod stages;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use denoise::{BackendLoader, NoiseStage};
use stages::{Agc, Dereverb, amplify, vad_gate};

/// Noise-suppression backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NsAlgorithm {
    /// STFT model through ONNX Runtime
    Neural,
    /// SpeexDSP spectral preprocessor
    Speexdsp,
}

impl FromStr for NsAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neural" | "ulunas" | "onnx" => Ok(NsAlgorithm::Neural),
            "speexdsp" | "speex" | "classical" => Ok(NsAlgorithm::Speexdsp),
            other => Err(format!("unknown noise suppression algorithm '{}'", other)),
        }
    }
}

/// Tunables read once per buffer as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DspConfig {
    pub enable_ns: bool,
    pub ns_algorithm: NsAlgorithm,
    pub enable_agc: bool,
    /// Peak level the AGC steers towards, in i16 units
    pub agc_target: i32,
    pub enable_vad: bool,
    /// 0–100; higher lets quieter audio through
    pub vad_threshold: i32,
    pub enable_dereverb: bool,
    pub dereverb_level: f32,
    pub amplification: f32,
}

impl Default for DspConfig {
    /// Every stage off; audio passes through unchanged.
    fn default() -> Self {
        Self {
            enable_ns: false,
            ns_algorithm: NsAlgorithm::Speexdsp,
            enable_agc: false,
            agc_target: 32000,
            enable_vad: false,
            vad_threshold: 10,
            enable_dereverb: false,
            dereverb_level: 0.5,
            amplification: 1.0,
        }
    }
}

type NoiseKey = (NsAlgorithm, u32, usize);

/// Per-session processing state.
pub struct DspPipeline {
    loader: BackendLoader,
    noise: Option<(NoiseKey, NoiseStage)>,
    noise_failed: Option<NoiseKey>,
    dereverb: Dereverb,
    agc: Agc,
    last_channels: usize,
}

impl DspPipeline {
    pub fn new(loader: BackendLoader) -> Self {
        Self {
            loader,
            noise: None,
            noise_failed: None,
            dereverb: Dereverb::default(),
            agc: Agc::default(),
            last_channels: 0,
        }
    }

    /// Drop backend handles and stage state, including a remembered
    /// backend failure.
    pub fn reset(&mut self) {
        if self.noise.take().is_some() {
            log::debug!("Noise suppression released");
        }
        self.noise_failed = None;
        self.dereverb.reset();
        self.agc.reset();
        self.last_channels = 0;
    }

    /// Run every enabled stage over `samples` in place.
    ///
    /// Returns the suppressor's speech probability for this buffer when the
    /// backend produced one.
    pub fn process(
        &mut self,
        samples: &mut [i16],
        sample_rate: u32,
        channels: usize,
        config: &DspConfig,
    ) -> Option<f32> {
        if channels != self.last_channels {
            log::debug!("Channel count changed {} -> {}, resetting DSP state", self.last_channels, channels);
            self.last_channels = channels;
            self.dereverb.reset();
            self.noise = None;
        }
        let supported_layout = channels == 1 || channels == 2;

        let mut speech_probability = None;
        if config.enable_ns && supported_layout {
            speech_probability = self.suppress_noise(samples, (config.ns_algorithm, sample_rate, channels));
        }

        if config.enable_dereverb && config.dereverb_level > 0.0 && supported_layout {
            self.dereverb.process(samples, channels, config.dereverb_level);
        }

        if config.enable_agc {
            self.agc.process(samples, config.agc_target);
        }

        amplify(samples, config.amplification);

        if config.enable_vad {
            vad_gate(samples, config.vad_threshold, speech_probability);
        }

        speech_probability
    }

    fn suppress_noise(&mut self, samples: &mut [i16], key: NoiseKey) -> Option<f32> {
        if self.noise_failed == Some(key) {
            return None;
        }
        if self.noise.as_ref().map(|(k, _)| *k) != Some(key) {
            let (algorithm, sample_rate, channels) = key;
            let built: anyhow::Result<Vec<_>> = (0..channels)
                .map(|_| (self.loader)(algorithm, sample_rate))
                .collect();
            match built {
                Ok(per_channel) => {
                    log::info!("Noise suppression {:?} ready for {}Hz/{}ch", algorithm, sample_rate, channels);
                    self.noise = Some((key, NoiseStage::new(per_channel)));
                }
                Err(e) => {
                    log::error!("Noise suppression disabled: {:#}", e);
                    self.noise = None;
                    self.noise_failed = Some(key);
                    return None;
                }
            }
        }

        let (_, stage) = self.noise.as_mut()?;
        match stage.process(samples) {
            Ok(prob) => prob,
            Err(e) => {
                log::error!("Noise suppression failed, disabling: {:#}", e);
                self.noise = None;
                self.noise_failed = Some(key);
                None
            }
        }
    }
}
