//! audio - Device access and sample format handling
//!
//! Real-time device I/O stays on dedicated OS threads (capture) or inside
//! blocking sections (playback) so the async network tasks never stall on
//! ALSA. Engines only see the [`DeviceProvider`] seam.

#[cfg(feature = "alsa-backend")]
mod alsa_device;
mod device;
pub mod format;

#[cfg(feature = "alsa-backend")]
pub use alsa_device::AlsaDevices;
pub use device::{AudioSink, AudioSource, CaptureThread, DeviceProvider, playback_buffer_bytes, run_blocking};
