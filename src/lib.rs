//! Microphone streaming from a capture device to a desktop virtual
//! microphone, over TCP, adb-forwarded USB or Bluetooth RFCOMM.

pub mod audio;
pub mod clock_sync;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;

pub use engine::{AudioEngine, ConsumerEngine, EngineSettings, EngineState, ProducerEngine};
