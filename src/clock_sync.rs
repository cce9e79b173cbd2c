//! Playback clock-drift compensation.
//!
//! The producer's capture clock and the consumer's output clock never run at
//! exactly the same rate, so the output queue slowly fills or drains. After
//! every buffer the queue depth is fed to a PI controller that picks a
//! resampling ratio; ratios above one consume input faster than real time.

use std::time::Duration;

/// Queue depth the controller steers towards.
pub const TARGET_QUEUE_MS: f64 = 60.0;
/// Above this depth the queue is flushed outright.
pub const FLUSH_QUEUE_MS: u64 = 2000;

const CATCH_UP_RATIO: f64 = 1.08;
const CATCH_UP_ERROR_MS: f64 = 300.0;
const SLOW_DOWN_RATIO: f64 = 0.95;
const SLOW_DOWN_ERROR_MS: f64 = -100.0;

const KP: f64 = 0.000_05;
const KI: f64 = 0.000_000_5;
pub const MAX_ADJUST: f64 = 0.03;
const INTEGRAL_LIMIT: f64 = 10_000.0;
/// Ratios closer to one than this skip resampling entirely.
const BYPASS_EPSILON: f64 = 0.000_05;

/// One controller step. Returns the new ratio and integral.
///
/// Large backlogs and underruns use fixed ratios and leave the integral
/// untouched; the PI output is clamped to `1 ± MAX_ADJUST`.
pub fn next_ratio(queued_ms: f64, integral: f64) -> (f64, f64) {
    let error = queued_ms - TARGET_QUEUE_MS;
    if error > CATCH_UP_ERROR_MS {
        return (CATCH_UP_RATIO, integral);
    }
    if error < SLOW_DOWN_ERROR_MS {
        return (SLOW_DOWN_RATIO, integral);
    }
    let integral = (integral + error).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
    let adjust = (error * KP + integral * KI).clamp(-MAX_ADJUST, MAX_ADJUST);
    (1.0 + adjust, integral)
}

/// Linear-interpolation resampler over interleaved i16.
///
/// The last frame of each buffer is kept as the left neighbour of the next
/// one and the fractional read position carries across calls, so buffer
/// boundaries are seamless.
#[derive(Debug, Default)]
pub struct LinearResampler {
    previous: Vec<i16>,
    position: f64,
    output: Vec<i16>,
}

impl LinearResampler {
    /// Restart reading at the retained anchor frame.
    pub fn reset_position(&mut self) {
        self.position = 0.0;
    }

    /// Resample `input` by `ratio` input frames per output frame.
    pub fn process(&mut self, input: &[i16], channels: usize, ratio: f64) -> &[i16] {
        self.output.clear();
        if channels == 0 || ratio <= 0.0 {
            self.output.extend_from_slice(input);
            return &self.output;
        }
        let frames = input.len() / channels;
        if frames <= 1 {
            self.output.extend_from_slice(input);
            return &self.output;
        }

        if self.previous.len() != channels {
            self.previous = input[..channels].to_vec();
            self.position = 1.0;
        }

        let sample = |frame: usize, ch: usize| -> f64 {
            if frame == 0 {
                f64::from(self.previous[ch])
            } else {
                f64::from(input[(frame - 1) * channels + ch])
            }
        };

        let mut output = std::mem::take(&mut self.output);
        output.reserve(((frames as f64 / ratio) as usize + 4) * channels);
        let available = frames + 1;
        let mut pos = self.position;
        loop {
            let base = pos as usize;
            if base + 1 >= available {
                break;
            }
            let frac = pos - base as f64;
            for ch in 0..channels {
                let s0 = sample(base, ch);
                let s1 = sample(base + 1, ch);
                let v = (s0 + (s1 - s0) * frac) as i32;
                output.push(v.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            }
            pos += ratio;
        }

        self.previous
            .copy_from_slice(&input[(frames - 1) * channels..frames * channels]);
        self.position = pos - frames as f64;
        self.output = output;
        &self.output
    }
}

/// What the caller must do to the output device after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Keep,
    /// Drop everything queued on the device
    Flush,
}

/// Controller plus resampler for one playback session.
#[derive(Debug)]
pub struct ClockSync {
    ratio: f64,
    integral: f64,
    resampler: LinearResampler,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            integral: 0.0,
            resampler: LinearResampler::default(),
        }
    }
}

impl ClockSync {
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Feed the measured queue depth.
    pub fn update(&mut self, queued: Duration) -> QueueAction {
        let queued_ms = queued.as_millis() as u64;
        let (ratio, integral) = next_ratio(queued_ms as f64, self.integral);
        self.ratio = ratio;
        self.integral = integral;
        if queued_ms >= FLUSH_QUEUE_MS {
            log::warn!("Playback queue at {}ms, flushing", queued_ms);
            self.resampler.reset_position();
            return QueueAction::Flush;
        }
        QueueAction::Keep
    }

    /// Apply the current ratio, or pass `samples` through when it is close to one.
    pub fn apply<'a>(&'a mut self, samples: &'a [i16], channels: usize) -> &'a [i16] {
        if (self.ratio - 1.0).abs() < BYPASS_EPSILON {
            return samples;
        }
        self.resampler.process(samples, channels, self.ratio)
    }
}
