//! Frame-domain neural noise suppression.
//!
//! Audio is cut into 960-sample windows advancing by 480 samples, taken to
//! the frequency domain, passed through a [`SpectralModel`], and overlap-added
//! back. The square-root Hann window is applied on both analysis and
//! synthesis so an identity model reconstructs the input one hop late.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use super::denoise::Denoiser;

pub const FRAME_LEN: usize = 960;
pub const HOP_LEN: usize = 480;
pub const BINS: usize = FRAME_LEN / 2 + 1;

/// Environment variable naming an explicit model file.
pub const MODEL_ENV: &str = "MICYOU_MODEL_PATH";
const MODEL_FILE: &str = "ulunas.onnx";

/// Where to look for the model, in priority order.
pub fn model_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(path) = explicit {
        out.push(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(MODEL_ENV) {
        out.push(PathBuf::from(path));
    }
    out.push(Path::new("models").join(MODEL_FILE));
    out.push(Path::new("/usr/share/micyou/models").join(MODEL_FILE));
    out
}

/// First candidate that exists on disk.
pub fn locate_model(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// Maps one frame of `BINS` complex bins to its enhanced version, in place.
pub trait SpectralModel: Send {
    fn enhance(&mut self, spectrum: &mut [Complex<f32>]) -> Result<()>;
}

/// Streaming STFT wrapper around a [`SpectralModel`].
pub struct StftDenoiser<M> {
    model: M,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    window: Vec<f32>,
    previous: Vec<f32>,
    overlap: Vec<f32>,
    time: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
}

impl<M: SpectralModel> StftDenoiser<M> {
    pub fn new(model: M) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FRAME_LEN);
        let inverse = planner.plan_fft_inverse(FRAME_LEN);
        // periodic sqrt-Hann: squares sum to one at 50% overlap
        let window = (0..FRAME_LEN)
            .map(|i| (std::f32::consts::PI * i as f32 / FRAME_LEN as f32).sin())
            .collect();
        Self {
            model,
            forward,
            inverse,
            window,
            previous: vec![0.0; HOP_LEN],
            overlap: vec![0.0; FRAME_LEN],
            time: vec![0.0; FRAME_LEN],
            spectrum: vec![Complex::new(0.0, 0.0); BINS],
        }
    }
}

impl<M: SpectralModel> Denoiser for StftDenoiser<M> {
    fn hop(&self) -> usize {
        HOP_LEN
    }

    fn denoise(&mut self, frame: &mut [i16]) -> Result<Option<f32>> {
        if frame.len() != HOP_LEN {
            anyhow::bail!("expected {} samples, got {}", HOP_LEN, frame.len());
        }

        self.time[..HOP_LEN].copy_from_slice(&self.previous);
        for (i, &s) in frame.iter().enumerate() {
            let v = f32::from(s) / 32768.0;
            self.time[HOP_LEN + i] = v;
            self.previous[i] = v;
        }
        for (t, w) in self.time.iter_mut().zip(&self.window) {
            *t *= w;
        }

        self.forward
            .process(&mut self.time, &mut self.spectrum)
            .map_err(|e| anyhow!("forward FFT failed: {}", e))?;
        self.model.enhance(&mut self.spectrum)?;
        // a real signal has no imaginary part at DC or Nyquist
        self.spectrum[0].im = 0.0;
        self.spectrum[BINS - 1].im = 0.0;
        self.inverse
            .process(&mut self.spectrum, &mut self.time)
            .map_err(|e| anyhow!("inverse FFT failed: {}", e))?;

        let scale = 1.0 / FRAME_LEN as f32;
        for ((acc, t), w) in self.overlap.iter_mut().zip(&self.time).zip(&self.window) {
            *acc += t * scale * w;
        }
        for (out, &v) in frame.iter_mut().zip(&self.overlap[..HOP_LEN]) {
            *out = (v * 32767.0).clamp(-32768.0, 32767.0) as i16;
        }
        self.overlap.copy_within(HOP_LEN.., 0);
        self.overlap[FRAME_LEN - HOP_LEN..].fill(0.0);
        Ok(None)
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use anyhow::{Context, Result};
    use ndarray::{Array4, ArrayD, IxDyn};
    use ort::{GraphOptimizationLevel, Session};
    use realfft::num_complex::Complex;

    use super::{BINS, SpectralModel};

    /// Recurrent state tensors the model threads from one frame to the next.
    const STATE_SHAPES: [&[usize]; 18] = [
        &[1, 1, 2, 121],
        &[1, 24, 1, 61],
        &[1, 24, 1, 31],
        &[1, 1, 24],
        &[1, 1, 48],
        &[1, 1, 48],
        &[1, 1, 64],
        &[1, 1, 32],
        &[1, 31, 16],
        &[1, 31, 16],
        &[1, 24, 1, 31],
        &[1, 12, 1, 31],
        &[1, 12, 2, 61],
        &[1, 1, 64],
        &[1, 1, 48],
        &[1, 1, 48],
        &[1, 1, 24],
        &[1, 1, 2],
    ];

    pub struct OnnxModel {
        session: Session,
        input_names: Vec<String>,
        output_names: Vec<String>,
        states: Vec<ArrayD<f32>>,
    }

    impl OnnxModel {
        pub fn load(path: &Path) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(1)?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;

            let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
            let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
            let expected = STATE_SHAPES.len() + 1;
            if input_names.len() != expected || output_names.len() != expected {
                anyhow::bail!(
                    "{} has {} inputs/{} outputs, expected {}",
                    path.display(),
                    input_names.len(),
                    output_names.len(),
                    expected
                );
            }

            log::info!("Loaded noise model {}", path.display());
            Ok(Self {
                session,
                input_names,
                output_names,
                states: STATE_SHAPES
                    .iter()
                    .map(|shape| ArrayD::<f32>::zeros(IxDyn(shape)))
                    .collect(),
            })
        }
    }

    impl SpectralModel for OnnxModel {
        fn enhance(&mut self, spectrum: &mut [Complex<f32>]) -> Result<()> {
            let flat: Vec<f32> = spectrum.iter().flat_map(|c| [c.re, c.im]).collect();
            let spec = Array4::from_shape_vec((1, BINS, 1, 2), flat)?;

            let mut inputs = Vec::with_capacity(self.input_names.len());
            inputs.push((self.input_names[0].clone(), ort::Value::from_array(spec.into_dyn())?));
            for (name, state) in self.input_names[1..].iter().zip(&self.states) {
                inputs.push((name.clone(), ort::Value::from_array(state.clone())?));
            }

            let outputs = self.session.run(inputs)?;

            let enhanced = outputs
                .get(self.output_names[0].as_str())
                .context("Missing spectrum output")?
                .try_extract_tensor::<f32>()?;
            let values: Vec<f32> = enhanced.iter().copied().collect();
            if values.len() < BINS * 2 {
                anyhow::bail!("spectrum output has {} values", values.len());
            }
            for (bin, pair) in spectrum.iter_mut().zip(values.chunks_exact(2)) {
                *bin = Complex::new(pair[0], pair[1]);
            }

            for (name, state) in self.output_names[1..].iter().zip(self.states.iter_mut()) {
                let next = outputs
                    .get(name.as_str())
                    .with_context(|| format!("Missing state output {}", name))?
                    .try_extract_tensor::<f32>()?;
                for (dst, src) in state.iter_mut().zip(next.iter()) {
                    *dst = *src;
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
