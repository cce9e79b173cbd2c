use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::delivery::DeliveryChannel;
use super::session::{
    AbortOnDrop, EngineCore, SessionGuard, Shared, child_result, finish, read_loop, with_timeout,
    write_loop,
};
use super::{AudioEngine, EngineSettings, StreamingNotifier};
use crate::audio::format::{decode_samples, samples_rms};
use crate::audio::{AudioSink, DeviceProvider, playback_buffer_bytes, run_blocking};
use crate::clock_sync::{ClockSync, QueueAction};
use crate::config::{ConnectionConfig, TransportKind};
use crate::dsp::denoise::{BackendLoader, backend_loader};
use crate::dsp::{DspConfig, DspPipeline};
use crate::error::EngineError;
use crate::protocol::handshake::server_handshake;
use crate::protocol::{AudioPacket, Message};
use crate::transport::{self, Connection, adb};

/// Playback side: accepts one producer at a time, enhances its audio and
/// renders it to the virtual microphone.
pub struct ConsumerEngine {
    core: EngineCore,
    devices: Arc<dyn DeviceProvider>,
    settings: EngineSettings,
}

impl ConsumerEngine {
    pub fn new(devices: Arc<dyn DeviceProvider>, settings: EngineSettings) -> Self {
        Self {
            core: EngineCore::new(settings.dsp),
            devices,
            settings,
        }
    }

    pub fn with_notifier(self, notifier: Arc<dyn StreamingNotifier>) -> Self {
        self.core.set_notifier(notifier);
        self
    }
}

#[async_trait]
impl AudioEngine for ConsumerEngine {
    async fn start(&self, config: ConnectionConfig) {
        let devices = self.devices.clone();
        let settings = self.settings.clone();
        self.core
            .spawn_session(move |shared, id| async move {
                log::info!("[{}] Consumer session on port {} over {}", id, config.port, config.transport);
                let mut guard = SessionGuard::new(shared.clone());
                let result = serve(&shared, &mut guard, devices, &settings, &config, id).await;
                drop(guard);
                finish(&shared, id, result);
            })
            .await;
    }

    fn core(&self) -> &EngineCore {
        &self.core
    }
}

/// Bind once, then handle producers one after another until stopped or a
/// fatal error.
async fn serve(
    shared: &Arc<Shared>,
    guard: &mut SessionGuard,
    devices: Arc<dyn DeviceProvider>,
    settings: &EngineSettings,
    config: &ConnectionConfig,
    id: Uuid,
) -> Result<(), EngineError> {
    if config.transport == TransportKind::Usb {
        adb::reverse_port(config.port, settings.adb_timeout).await?;
    }
    let mut listener = transport::bind(config).await?;
    log::info!("[{}] Listening on {}", id, listener.local_description());

    let mut playback = Playback::new(devices, backend_loader(settings.model_candidates.clone()));
    loop {
        let connection = listener.accept().await?;
        log::info!("[{}] Producer connected from {}", id, connection.peer);
        shared.status.clear_error();
        guard.streaming();
        let result = handle_producer(shared, connection, &mut playback, settings).await;
        playback.close();
        match result {
            Ok(()) => {}
            Err(e) if e.is_expected_disconnect() => log::info!("[{}] Producer disconnected", id),
            Err(EngineError::Device(e)) => return Err(EngineError::Device(e)),
            Err(e) => {
                log::warn!("[{}] Connection ended: {}", id, e);
                shared.status.record_error(e.to_string());
            }
        }
        guard.connecting();
    }
}

async fn handle_producer(
    shared: &Arc<Shared>,
    connection: Connection,
    playback: &mut Playback,
    settings: &EngineSettings,
) -> Result<(), EngineError> {
    let mut stream = connection.stream;
    with_timeout(settings.handshake_timeout, server_handshake(&mut stream)).await?;

    let (reader, writer) = tokio::io::split(stream);
    let outbound = Arc::new(DeliveryChannel::new(settings.delivery_capacity));
    outbound.push(Message::Mute {
        is_muted: shared.status.is_muted(),
    });
    shared.attach(outbound.clone());

    let (tx, mut packets) = mpsc::channel(settings.delivery_capacity.max(1));
    let mut writer_task = AbortOnDrop::spawn(write_loop(outbound, writer));
    let reader_task = AbortOnDrop::spawn(read_loop(reader, shared.clone(), Some(tx)));

    let mut dsp = shared.dsp();
    let mut monitoring = shared.monitoring();
    loop {
        tokio::select! {
            packet = packets.recv() => match packet {
                Some(packet) => {
                    let config = *dsp.borrow_and_update();
                    let monitor = *monitoring.borrow_and_update();
                    // model loading and inference block as much as the device write
                    if let Some(level) = run_blocking(|| playback.render(&packet, &config, monitor))? {
                        shared.status.set_level(level);
                    }
                }
                None => break,
            },
            joined = &mut writer_task => return Err(child_result(joined)),
        }
    }
    Err(child_result(reader_task.await))
}

/// Output device, enhancement chain and drift control for one listener.
struct Playback {
    devices: Arc<dyn DeviceProvider>,
    sink: Option<OpenSink>,
    pipeline: DspPipeline,
    clock: ClockSync,
    samples: Vec<i16>,
}

struct OpenSink {
    device: Box<dyn AudioSink>,
    sample_rate: u32,
    channels: u8,
}

impl Playback {
    fn new(devices: Arc<dyn DeviceProvider>, loader: BackendLoader) -> Self {
        Self {
            devices,
            sink: None,
            pipeline: DspPipeline::new(loader),
            clock: ClockSync::default(),
            samples: Vec::new(),
        }
    }

    /// End of one producer's connection: release the device and every
    /// per-stream DSP handle.
    fn close(&mut self) {
        if self.sink.take().is_some() {
            log::info!("Playback device closed");
        }
        self.pipeline.reset();
        self.clock = ClockSync::default();
    }

    /// Decode, enhance and play one packet. Returns the level of the
    /// processed audio.
    fn render(
        &mut self,
        packet: &AudioPacket,
        config: &DspConfig,
        monitoring: bool,
    ) -> Result<Option<f32>, EngineError> {
        decode_samples(&packet.payload, packet.sample_format, &mut self.samples);
        let channels = packet.channel_count.max(1);
        if self.samples.len() < channels as usize {
            return Ok(None);
        }
        self.ensure_sink(packet.sample_rate, channels)?;
        let Some(sink) = self.sink.as_mut() else {
            return Ok(None);
        };

        self.pipeline
            .process(&mut self.samples, packet.sample_rate, channels as usize, config);
        let level = samples_rms(&self.samples);

        if !sink.device.is_virtual() && !monitoring {
            self.samples.fill(0);
        }

        if let Some(queued) = sink.device.queued_ms() {
            if self.clock.update(Duration::from_millis(queued)) == QueueAction::Flush {
                sink.device.flush().map_err(EngineError::Device)?;
            }
        }
        let out = self.clock.apply(&self.samples, channels as usize);
        sink.device.write(out).map_err(EngineError::Device)?;
        Ok(Some(level))
    }

    fn ensure_sink(&mut self, sample_rate: u32, channels: u8) -> Result<(), EngineError> {
        if let Some(open) = &self.sink {
            if open.sample_rate == sample_rate && open.channels == channels {
                return Ok(());
            }
            log::info!(
                "Stream format changed to {}Hz/{}ch, reopening output",
                sample_rate,
                channels
            );
        }
        self.sink = None;
        let buffer_bytes = playback_buffer_bytes(sample_rate, channels);
        let device = self
            .devices
            .open_sink(sample_rate, channels, buffer_bytes)
            .map_err(EngineError::Device)?;
        log::info!(
            "Playback opened: {}Hz/{}ch, buffer {} bytes, virtual={}",
            sample_rate,
            channels,
            buffer_bytes,
            device.is_virtual()
        );
        self.sink = Some(OpenSink {
            device,
            sample_rate,
            channels,
        });
        self.clock = ClockSync::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::audio::AudioSource;
    use crate::dsp::NsAlgorithm;
    use crate::dsp::denoise::Denoiser;
    use crate::dsp::denoise::tests::Halver;
    use crate::protocol::SampleFormat;

    #[derive(Clone, Default)]
    struct Recorded(Arc<Mutex<Vec<i16>>>);

    /// Output whose queue depth the test controls.
    #[derive(Clone)]
    struct Queue {
        depth_ms: Arc<AtomicU64>,
        flushes: Arc<AtomicUsize>,
    }

    impl Default for Queue {
        fn default() -> Self {
            Self {
                depth_ms: Arc::new(AtomicU64::new(60)),
                flushes: Arc::default(),
            }
        }
    }

    struct FakeSink {
        virtual_device: bool,
        out: Recorded,
        queue: Queue,
    }

    impl AudioSink for FakeSink {
        fn write(&mut self, samples: &[i16]) -> anyhow::Result<()> {
            self.out.0.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
        fn queued_ms(&self) -> Option<u64> {
            Some(self.queue.depth_ms.load(Ordering::SeqCst))
        }
        fn flush(&mut self) -> anyhow::Result<()> {
            self.queue.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_virtual(&self) -> bool {
            self.virtual_device
        }
    }

    struct Sinks {
        virtual_device: bool,
        out: Recorded,
        queue: Queue,
        opened: Arc<Mutex<Vec<(u32, u8, usize)>>>,
    }

    impl DeviceProvider for Sinks {
        fn open_source(&self, _rate: u32, _channels: u8) -> anyhow::Result<Box<dyn AudioSource>> {
            anyhow::bail!("no microphone")
        }

        fn open_sink(&self, rate: u32, channels: u8, buffer_bytes: usize) -> anyhow::Result<Box<dyn AudioSink>> {
            self.opened.lock().unwrap().push((rate, channels, buffer_bytes));
            Ok(Box::new(FakeSink {
                virtual_device: self.virtual_device,
                out: self.out.clone(),
                queue: self.queue.clone(),
            }))
        }
    }

    struct Rig {
        playback: Playback,
        out: Recorded,
        queue: Queue,
        opened: Arc<Mutex<Vec<(u32, u8, usize)>>>,
    }

    fn rig_with_loader(virtual_device: bool, loader: BackendLoader) -> Rig {
        let out = Recorded::default();
        let queue = Queue::default();
        let opened = Arc::new(Mutex::new(Vec::new()));
        let devices = Arc::new(Sinks {
            virtual_device,
            out: out.clone(),
            queue: queue.clone(),
            opened: opened.clone(),
        });
        Rig {
            playback: Playback::new(devices, loader),
            out,
            queue,
            opened,
        }
    }

    fn rig(virtual_device: bool) -> Rig {
        rig_with_loader(virtual_device, backend_loader(Vec::new()))
    }

    fn packet(rate: u32, channels: u8, samples: &[i16]) -> AudioPacket {
        AudioPacket {
            sequence: 0,
            sample_rate: rate,
            channel_count: channels,
            sample_format: SampleFormat::Pcm16,
            payload: Bytes::from(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn sink_opens_lazily_and_reopens_on_format_change() {
        let mut rig = rig(true);
        assert!(rig.opened.lock().unwrap().is_empty());
        let config = DspConfig::default();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        rig.playback.render(&packet(44100, 2, &[0; 480]), &config, false).unwrap();
        assert_eq!(*rig.opened.lock().unwrap(), vec![(48000, 1, 19200), (44100, 2, 35280)]);
    }

    #[test]
    fn virtual_output_gets_processed_audio() {
        let mut rig = rig(true);
        let samples: Vec<i16> = (0..480).map(|i| (i * 10) as i16).collect();
        let level = rig
            .playback
            .render(&packet(48000, 1, &samples), &DspConfig::default(), false)
            .unwrap()
            .unwrap();
        assert!(level > 0.0);
        // resampler bypassed at the 60ms target
        assert_eq!(*rig.out.0.lock().unwrap(), samples);
    }

    #[test]
    fn speaker_output_is_silent_unless_monitoring() {
        let mut rig = rig(false);
        let samples = vec![1000i16; 480];
        let level = rig
            .playback
            .render(&packet(48000, 1, &samples), &DspConfig::default(), false)
            .unwrap()
            .unwrap();
        assert!(level > 0.0);
        assert!(rig.out.0.lock().unwrap().iter().all(|&s| s == 0));

        rig.out.0.lock().unwrap().clear();
        rig.playback
            .render(&packet(48000, 1, &samples), &DspConfig::default(), true)
            .unwrap();
        assert_eq!(*rig.out.0.lock().unwrap(), samples);
    }

    #[test]
    fn empty_payload_is_ignored() {
        let mut rig = rig(true);
        let level = rig
            .playback
            .render(&packet(48000, 1, &[]), &DspConfig::default(), false)
            .unwrap();
        assert_eq!(level, None);
        assert!(rig.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn amplification_applies_before_output() {
        let mut rig = rig(true);
        let config = DspConfig {
            amplification: 2.0,
            ..DspConfig::default()
        };
        rig.playback.render(&packet(48000, 1, &[100; 480]), &config, false).unwrap();
        assert!(rig.out.0.lock().unwrap().iter().all(|&s| s == 200));
    }

    #[test]
    fn close_forgets_device() {
        let mut rig = rig(true);
        rig.playback.render(&packet(48000, 1, &[0; 480]), &DspConfig::default(), false).unwrap();
        rig.playback.close();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &DspConfig::default(), false).unwrap();
        assert_eq!(rig.opened.lock().unwrap().len(), 2);
    }

    #[test]
    fn close_releases_noise_backends() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let loader: BackendLoader = Box::new(move |_: NsAlgorithm, _: u32| -> anyhow::Result<Box<dyn Denoiser>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Halver { hop: 480, probability: None }))
        });
        let mut rig = rig_with_loader(true, loader);
        let config = DspConfig {
            enable_ns: true,
            ..DspConfig::default()
        };
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        rig.playback.close();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backlog_is_drained_by_resampling() {
        let mut rig = rig(true);
        rig.queue.depth_ms.store(500, Ordering::SeqCst);
        rig.playback
            .render(&packet(48000, 1, &[1000; 480]), &DspConfig::default(), false)
            .unwrap();
        let written = rig.out.0.lock().unwrap().clone();
        // 1.08 input frames per output frame
        assert_eq!(written.len(), 444);
        assert!(written.iter().all(|&s| s == 1000));
        assert_eq!(rig.queue.flushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn runaway_queue_is_flushed() {
        let mut rig = rig(true);
        let config = DspConfig::default();
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        assert_eq!(rig.queue.flushes.load(Ordering::SeqCst), 0);

        rig.queue.depth_ms.store(2000, Ordering::SeqCst);
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        assert_eq!(rig.queue.flushes.load(Ordering::SeqCst), 1);

        rig.queue.depth_ms.store(60, Ordering::SeqCst);
        rig.playback.render(&packet(48000, 1, &[0; 480]), &config, false).unwrap();
        assert_eq!(rig.queue.flushes.load(Ordering::SeqCst), 1);
    }
}
