//! Wire protocol shared by both endpoints.
//!
//! A session starts with a fixed token exchange (see [`handshake`]) and then
//! carries a sequence of frames in both directions:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────────┐
//! │ Magic (4 bytes)  │ Length (4 bytes) │ Payload (Length bytes)   │
//! │ Big-endian u32   │ Big-endian u32   │ Protobuf MessageWrapper  │
//! └──────────────────┴──────────────────┴──────────────────────────┘
//! ```

pub mod codec;
pub mod handshake;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use codec::{FrameReader, decode_payload, encode_frame, encode_payload, write_frame};

/// Frame marker ("MicY").
pub const PACKET_MAGIC: u32 = 0x4D69_6359;

/// Largest payload a frame may announce.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Sample encoding of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit, 128 is silence
    Pcm8,
    /// Signed 16-bit little-endian
    Pcm16,
    /// 32-bit little-endian IEEE float in [-1, 1]
    PcmFloat32,
}

impl SampleFormat {
    /// Tag carried in the `audio_format` field.
    pub fn wire_tag(self) -> i32 {
        match self {
            SampleFormat::Pcm16 => 2,
            SampleFormat::Pcm8 => 3,
            SampleFormat::PcmFloat32 => 4,
        }
    }

    /// Accepts the platform encoding constants and the bit-width aliases.
    pub fn from_wire_tag(tag: i32) -> Option<Self> {
        match tag {
            2 | 16 => Some(SampleFormat::Pcm16),
            3 | 8 => Some(SampleFormat::Pcm8),
            4 | 32 => Some(SampleFormat::PcmFloat32),
            _ => None,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Pcm8 => 1,
            SampleFormat::Pcm16 => 2,
            SampleFormat::PcmFloat32 => 4,
        }
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcm8" | "u8" => Ok(SampleFormat::Pcm8),
            "pcm16" | "s16" | "s16le" => Ok(SampleFormat::Pcm16),
            "pcmfloat32" | "float" | "f32" => Ok(SampleFormat::PcmFloat32),
            other => Err(format!("unknown sample format '{}'", other)),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::Pcm8 => "pcm8",
            SampleFormat::Pcm16 => "pcm16",
            SampleFormat::PcmFloat32 => "float",
        };
        f.write_str(name)
    }
}

/// One captured buffer, interleaved, in `sample_format`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    /// Per-session counter, wraps at `u32::MAX`
    pub sequence: u32,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub sample_format: SampleFormat,
    pub payload: Bytes,
}

/// Everything that travels inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Audio(AudioPacket),
    Mute { is_muted: bool },
}
