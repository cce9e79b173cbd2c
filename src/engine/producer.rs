use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::delivery::DeliveryChannel;
use super::session::{
    AbortOnDrop, EngineCore, SessionGuard, Shared, child_result, finish, read_loop, with_timeout,
    write_loop,
};
use super::{AudioEngine, EngineSettings, StreamingNotifier};
use crate::audio::format::{encode_samples, payload_rms};
use crate::audio::{CaptureThread, DeviceProvider};
use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::protocol::handshake::client_handshake;
use crate::protocol::{AudioPacket, Message};
use crate::transport;

/// Capture side: reads the microphone and streams it to a consumer.
pub struct ProducerEngine {
    core: EngineCore,
    devices: Arc<dyn DeviceProvider>,
    settings: EngineSettings,
}

impl ProducerEngine {
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
impl AudioEngine for ProducerEngine {
    async fn start(&self, config: ConnectionConfig) {
        let devices = self.devices.clone();
        let settings = self.settings.clone();
        self.core
            .spawn_session(move |shared, id| async move {
                log::info!(
                    "[{}] Producer session to {} over {} ({}Hz, {}ch, {})",
                    id,
                    config.address,
                    config.transport,
                    config.sample_rate,
                    config.channel_count,
                    config.sample_format
                );
                let mut guard = SessionGuard::new(shared.clone());
                let result = run(&shared, &mut guard, devices, &settings, &config, id).await;
                drop(guard);
                finish(&shared, id, result);
            })
            .await;
    }

    fn core(&self) -> &EngineCore {
        &self.core
    }
}

async fn run(
    shared: &Arc<Shared>,
    guard: &mut SessionGuard,
    devices: Arc<dyn DeviceProvider>,
    settings: &EngineSettings,
    config: &ConnectionConfig,
    id: Uuid,
) -> Result<(), EngineError> {
    let connection = transport::connect(config, settings.connect_timeout).await?;
    log::info!("[{}] Connected to {}", id, connection.peer);
    let mut stream = connection.stream;
    with_timeout(settings.handshake_timeout, client_handshake(&mut stream)).await?;

    let source = devices
        .open_source(config.sample_rate, config.channel_count)
        .map_err(EngineError::Device)?;
    let sample_rate = source.sample_rate();
    let channel_count = source.channels();
    let format = config.sample_format;

    let (reader, writer) = tokio::io::split(stream);
    let outbound = Arc::new(DeliveryChannel::new(settings.delivery_capacity));
    outbound.push(Message::Mute {
        is_muted: shared.status.is_muted(),
    });
    shared.attach(outbound.clone());

    let mut writer_task = AbortOnDrop::spawn(write_loop(outbound.clone(), writer));
    let mut reader_task = AbortOnDrop::spawn(read_loop(reader, shared.clone(), None));

    let mut capture = CaptureThread::spawn(source, 4).map_err(EngineError::Device)?;
    guard.streaming();

    let mut sequence: u32 = 0;
    loop {
        tokio::select! {
            buffer = capture.recv() => {
                let samples = match buffer {
                    Some(Ok(samples)) => samples,
                    Some(Err(e)) => return Err(EngineError::Device(e)),
                    None => return Err(EngineError::Device(anyhow::anyhow!("capture thread exited"))),
                };
                let payload = encode_samples(&samples, format);
                shared.status.set_level(payload_rms(&payload, format));
                if shared.status.is_muted() {
                    continue;
                }
                outbound.push(Message::Audio(AudioPacket {
                    sequence,
                    sample_rate,
                    channel_count,
                    sample_format: format,
                    payload,
                }));
                sequence = sequence.wrapping_add(1);
            }
            joined = &mut writer_task => {
                return Err(child_result(joined));
            }
            joined = &mut reader_task => {
                return Err(child_result(joined));
            }
        }
    }
}
