//! Frame encoding, payload (de)serialization and resynchronizing reader.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message as ProstMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{AudioPacket, MAX_FRAME_LEN, Message, PACKET_MAGIC, SampleFormat};
use crate::error::ProtocolError;

/// Protobuf schema of the payload.
///
/// Scalars are declared `optional` so zero values (sequence 0, unmuted) are
/// still emitted; peers that require explicit fields decode them.
mod wire {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MessageWrapper {
        #[prost(message, optional, tag = "1")]
        pub audio_packet: Option<AudioPacketOrdered>,
        #[prost(message, optional, tag = "2")]
        pub mute: Option<MuteMessage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AudioPacketOrdered {
        #[prost(int32, optional, tag = "1")]
        pub sequence_number: Option<i32>,
        #[prost(message, optional, tag = "2")]
        pub audio_packet: Option<AudioPacketBody>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AudioPacketBody {
        #[prost(bytes = "bytes", optional, tag = "1")]
        pub buffer: Option<Bytes>,
        #[prost(int32, optional, tag = "2")]
        pub sample_rate: Option<i32>,
        #[prost(int32, optional, tag = "3")]
        pub channel_count: Option<i32>,
        #[prost(int32, optional, tag = "4")]
        pub audio_format: Option<i32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MuteMessage {
        #[prost(bool, optional, tag = "1")]
        pub is_muted: Option<bool>,
    }
}

impl From<&Message> for wire::MessageWrapper {
    fn from(msg: &Message) -> Self {
        match msg {
            Message::Audio(packet) => wire::MessageWrapper {
                audio_packet: Some(wire::AudioPacketOrdered {
                    // the sequence travels as a signed 32-bit field and wraps through negatives
                    sequence_number: Some(packet.sequence as i32),
                    audio_packet: Some(wire::AudioPacketBody {
                        buffer: Some(packet.payload.clone()),
                        sample_rate: Some(packet.sample_rate as i32),
                        channel_count: Some(i32::from(packet.channel_count)),
                        audio_format: Some(packet.sample_format.wire_tag()),
                    }),
                }),
                mute: None,
            },
            Message::Mute { is_muted } => wire::MessageWrapper {
                audio_packet: None,
                mute: Some(wire::MuteMessage {
                    is_muted: Some(*is_muted),
                }),
            },
        }
    }
}

impl TryFrom<wire::MessageWrapper> for Message {
    type Error = ProtocolError;

    fn try_from(wrapper: wire::MessageWrapper) -> Result<Self, Self::Error> {
        if let Some(ordered) = wrapper.audio_packet {
            let body = ordered.audio_packet.ok_or(ProtocolError::Empty)?;
            let tag = body.audio_format.unwrap_or_default();
            let sample_format =
                SampleFormat::from_wire_tag(tag).ok_or(ProtocolError::UnknownFormat(tag))?;
            let channel_count = u8::try_from(body.channel_count.unwrap_or_default())
                .map_err(|_| ProtocolError::OutOfRange("channel_count"))?;
            let sample_rate = u32::try_from(body.sample_rate.unwrap_or_default())
                .map_err(|_| ProtocolError::OutOfRange("sample_rate"))?;
            return Ok(Message::Audio(AudioPacket {
                sequence: ordered.sequence_number.unwrap_or_default() as u32,
                sample_rate,
                channel_count,
                sample_format,
                payload: body.buffer.unwrap_or_default(),
            }));
        }
        if let Some(mute) = wrapper.mute {
            return Ok(Message::Mute {
                is_muted: mute.is_muted.unwrap_or_default(),
            });
        }
        Err(ProtocolError::Empty)
    }
}

/// Serialize a message into a frame payload.
pub fn encode_payload(msg: &Message) -> Bytes {
    Bytes::from(wire::MessageWrapper::from(msg).encode_to_vec())
}

/// Parse a frame payload.
pub fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let wrapper = wire::MessageWrapper::decode(payload)?;
    Message::try_from(wrapper)
}

/// Build a complete frame: magic, length, payload.
pub fn encode_frame(msg: &Message) -> Bytes {
    let payload = encode_payload(msg);
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u32(PACKET_MAGIC);
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(msg)).await?;
    writer.flush().await
}

/// Pulls frames out of a byte stream.
///
/// Bytes that do not start with [`PACKET_MAGIC`] are skipped one at a time
/// until the marker reappears. A header announcing an empty or oversized
/// payload is dropped without reading the payload, and scanning resumes
/// right after it.
pub struct FrameReader<R> {
    inner: R,
    skipped_bytes: u64,
    dropped_frames: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            skipped_bytes: 0,
            dropped_frames: 0,
        }
    }

    /// Bytes discarded while hunting for the frame marker.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Frames discarded for a bad length or an undecodable payload.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn sync_to_magic(&mut self) -> io::Result<()> {
        let mut window = self.inner.read_u32().await?;
        let mut skipped = 0u64;
        while window != PACKET_MAGIC {
            let byte = self.inner.read_u8().await?;
            window = (window << 8) | u32::from(byte);
            skipped += 1;
        }
        if skipped > 0 {
            log::debug!("Resynchronized after skipping {} bytes", skipped);
            self.skipped_bytes += skipped;
        }
        Ok(())
    }

    /// Read the next well-formed frame payload.
    ///
    /// Returns `UnexpectedEof` once the peer closes the stream.
    pub async fn read_frame(&mut self) -> io::Result<Bytes> {
        loop {
            self.sync_to_magic().await?;
            let length = self.inner.read_u32().await?;
            if length == 0 || length > MAX_FRAME_LEN {
                log::warn!("Dropping frame with invalid length {}", length);
                self.dropped_frames += 1;
                continue;
            }
            let mut payload = vec![0u8; length as usize];
            self.inner.read_exact(&mut payload).await?;
            return Ok(Bytes::from(payload));
        }
    }

    /// Read frames until one decodes into a [`Message`].
    pub async fn next_message(&mut self) -> io::Result<Message> {
        loop {
            let payload = self.read_frame().await?;
            match decode_payload(&payload) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    log::warn!("Skipping undecodable frame ({} bytes): {}", payload.len(), e);
                    self.dropped_frames += 1;
                }
            }
        }
    }
}
