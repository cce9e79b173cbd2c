//! Conversions between wire sample formats and interleaved i16, plus level metering.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::SampleFormat;

/// Encode captured i16 samples into the wire format.
pub fn encode_samples(samples: &[i16], format: SampleFormat) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * format.bytes_per_sample());
    match format {
        SampleFormat::Pcm8 => {
            for &s in samples {
                out.put_u8(((s >> 8) + 128) as u8);
            }
        }
        SampleFormat::Pcm16 => {
            for &s in samples {
                out.put_i16_le(s);
            }
        }
        SampleFormat::PcmFloat32 => {
            for &s in samples {
                out.put_f32_le(f32::from(s) / 32768.0);
            }
        }
    }
    out.freeze()
}

/// Decode a wire payload into `out`, replacing its contents.
///
/// Trailing bytes that do not fill a whole sample are ignored.
pub fn decode_samples(payload: &[u8], format: SampleFormat, out: &mut Vec<i16>) {
    out.clear();
    match format {
        SampleFormat::Pcm8 => {
            out.extend(payload.iter().map(|&b| ((i16::from(b) - 128) * 256)));
        }
        SampleFormat::Pcm16 => {
            out.extend(
                payload
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]])),
            );
        }
        SampleFormat::PcmFloat32 => {
            out.extend(payload.chunks_exact(4).map(|c| {
                let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (v * 32767.0).clamp(-32768.0, 32767.0) as i16
            }));
        }
    }
}

/// Root-mean-square level of a wire payload, in [0, 1].
pub fn payload_rms(payload: &[u8], format: SampleFormat) -> f32 {
    let (sum, n) = match format {
        SampleFormat::Pcm8 => payload.iter().fold((0.0f64, 0usize), |(acc, n), &b| {
            let v = (f64::from(b) - 128.0) / 128.0;
            (acc + v * v, n + 1)
        }),
        SampleFormat::Pcm16 => payload.chunks_exact(2).fold((0.0, 0), |(acc, n), c| {
            let v = f64::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0;
            (acc + v * v, n + 1)
        }),
        SampleFormat::PcmFloat32 => payload.chunks_exact(4).fold((0.0, 0), |(acc, n), c| {
            let v = f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            (acc + v * v, n + 1)
        }),
    };
    if n == 0 {
        return 0.0;
    }
    ((sum / n as f64).sqrt() as f32).min(1.0)
}

/// Root-mean-square level of i16 samples, in [0, 1].
pub fn samples_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}
