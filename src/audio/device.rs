//! Device seams used by the engines, and the dedicated capture thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

/// Blocking microphone.
pub trait AudioSource: Send {
    /// Fill `buf` with interleaved samples, returning how many were written.
    ///
    /// Blocks until at least one period is available. `Ok(0)` means the
    /// device recovered from an overrun and the caller should read again.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u8;

    /// Interleaved samples delivered per read.
    fn buffer_len(&self) -> usize;
}

/// Output the consumer renders into.
pub trait AudioSink: Send {
    /// Queue interleaved samples for playback.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Audio written but not yet played, in milliseconds.
    fn queued_ms(&self) -> Option<u64>;

    /// Discard everything queued.
    fn flush(&mut self) -> Result<()>;

    /// True when this is the virtual microphone cable rather than a speaker.
    fn is_virtual(&self) -> bool;
}

/// Opens sources and sinks; engines hold one of these instead of touching ALSA.
pub trait DeviceProvider: Send + Sync {
    fn open_source(&self, sample_rate: u32, channels: u8) -> Result<Box<dyn AudioSource>>;

    fn open_sink(
        &self,
        sample_rate: u32,
        channels: u8,
        buffer_bytes: usize,
    ) -> Result<Box<dyn AudioSink>>;
}

/// Roughly 200 ms of 16-bit audio, kept within [8 KiB, 128 KiB].
pub fn playback_buffer_bytes(sample_rate: u32, channels: u8) -> usize {
    let bytes_per_sec = (sample_rate as usize * channels as usize * 2).max(1);
    (bytes_per_sec / 5).clamp(8192, 131_072)
}

/// Reads a source on its own OS thread and forwards buffers to async code.
///
/// Stopping (or dropping) the handle waits for the thread to finish its
/// current read, so the device is closed once `stop` returns.
pub struct CaptureThread {
    running: Arc<AtomicBool>,
    buffers: mpsc::Receiver<Result<Vec<i16>>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    /// Start reading `source`, keeping up to `depth` buffers in flight.
    pub fn spawn(mut source: Box<dyn AudioSource>, depth: usize) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let (tx, buffers) = mpsc::channel(depth.max(1));
        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let len = source.buffer_len().max(1);
                log::info!(
                    "Capture started: rate={}, ch={}, buffer={}",
                    source.sample_rate(),
                    source.channels(),
                    len
                );
                while flag.load(Ordering::Relaxed) {
                    let mut buf = vec![0i16; len];
                    match source.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            buf.truncate(n);
                            if tx.blocking_send(Ok(buf)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("Capture read failed: {:#}", e);
                            let _ = tx.blocking_send(Err(e));
                            break;
                        }
                    }
                }
                drop(source);
                log::info!("Capture stopped");
            })?;
        Ok(Self {
            running,
            buffers,
            handle: Some(handle),
        })
    }

    /// Next captured buffer; `None` once the thread has exited.
    pub async fn recv(&mut self) -> Option<Result<Vec<i16>>> {
        self.buffers.recv().await
    }

    /// Stop the thread and wait until it has released the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // unblocks a thread waiting for channel capacity
        self.buffers.close();
        if let Some(handle) = self.handle.take() {
            join_capture(handle);
        }
    }
}

fn join_capture(handle: JoinHandle<()>) {
    run_blocking(move || {
        if handle.join().is_err() {
            log::error!("Capture thread panicked");
        }
    });
}

/// Run blocking device or DSP work, moving other tasks off this worker when
/// the runtime allows it.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}
