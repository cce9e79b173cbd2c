//! Per-buffer stages that follow noise suppression.

use crate::audio::format::samples_rms;

/// Delay-line length of the dereverberation stage, per channel.
pub const DEREVERB_DELAY: usize = 480;

/// Subtracts a scaled copy of the signal from 480 samples ago.
///
/// Each channel has its own delay line; the write index is shared.
#[derive(Debug, Default)]
pub struct Dereverb {
    lines: Vec<Vec<i32>>,
    index: usize,
}

impl Dereverb {
    pub fn reset(&mut self) {
        self.lines.clear();
        self.index = 0;
    }

    pub fn process(&mut self, samples: &mut [i16], channels: usize, level: f32) {
        if channels == 0 || level <= 0.0 {
            return;
        }
        if self.lines.len() != channels {
            self.lines = vec![vec![0; DEREVERB_DELAY]; channels];
            self.index = 0;
        }
        for frame in samples.chunks_exact_mut(channels) {
            for (sample, line) in frame.iter_mut().zip(self.lines.iter_mut()) {
                let current = i32::from(*sample);
                let delayed = line[self.index];
                line[self.index] = current;
                let out = current - (delayed as f32 * level) as i32;
                *sample = out.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            self.index = (self.index + 1) % DEREVERB_DELAY;
        }
    }
}

/// Peak-following gain with a slow envelope.
#[derive(Debug, Default)]
pub struct Agc {
    envelope: f32,
}

impl Agc {
    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }

    /// Current smoothed gain; zero until the first non-silent buffer.
    pub fn gain(&self) -> f32 {
        self.envelope
    }

    pub fn process(&mut self, samples: &mut [i16], target: i32) {
        if target <= 0 {
            return;
        }
        let peak = samples
            .iter()
            .map(|&s| i32::from(s).abs())
            .max()
            .unwrap_or(0);
        if peak == 0 {
            return;
        }
        let desired = (target as f32 / peak as f32).clamp(0.1, 10.0);
        self.envelope = if self.envelope == 0.0 {
            desired
        } else {
            self.envelope * 0.95 + desired * 0.05
        };
        let gain = self.envelope;
        for s in samples.iter_mut() {
            let v = (f32::from(*s) * gain) as i32;
            *s = v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }
}

/// Scale every sample, saturating. A factor of exactly 1.0 leaves the buffer alone.
pub fn amplify(samples: &mut [i16], factor: f32) {
    if factor == 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        let v = (f32::from(*s) * factor) as i32;
        *s = v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Silence the buffer unless it looks like speech. Returns whether it did.
///
/// `threshold` is a 0–100 sensitivity; higher lets more through. The
/// suppressor's speech probability is used when present, otherwise the
/// buffer RMS against a scaled floor.
pub fn vad_gate(samples: &mut [i16], threshold: i32, speech_probability: Option<f32>) -> bool {
    let sensitivity = threshold.clamp(0, 100) as f32 / 100.0;
    let required = 1.0 - sensitivity;
    let speech = match speech_probability {
        Some(p) => p >= required,
        None => samples_rms(samples) >= required * 0.12,
    };
    if !speech {
        samples.fill(0);
    }
    speech
}
