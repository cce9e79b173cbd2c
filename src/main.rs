use std::sync::Arc;

use clap::{Parser, Subcommand};
use micyou::audio::DeviceProvider;
use micyou::config::{Config, TransportKind};
use micyou::dsp::{DspConfig, NsAlgorithm};
use micyou::engine::{AudioEngine, ConsumerEngine, EngineSettings, EngineState, LogNotifier, ProducerEngine};
use micyou::protocol::SampleFormat;

#[derive(Parser, Debug)]
#[command(version, about = "Stream a microphone to a desktop virtual microphone")]
struct Cli {
    /// wifi, usb or bluetooth
    #[arg(long, global = true)]
    transport: Option<TransportKind>,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    #[arg(long, global = true)]
    channels: Option<u8>,

    /// pcm8, pcm16 or pcmfloat32
    #[arg(long, global = true)]
    format: Option<SampleFormat>,

    /// Start muted
    #[arg(long, global = true)]
    mute: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Receive audio and play it into the virtual microphone
    Server {
        /// Also play through the speakers when no virtual device exists
        #[arg(long)]
        monitor: bool,

        /// Noise suppression: speexdsp or neural
        #[arg(long)]
        ns: Option<NsAlgorithm>,

        /// Automatic gain control towards this peak (i16 units)
        #[arg(long)]
        agc: Option<i32>,

        /// Silence buffers without speech; 0-100, higher is more permissive
        #[arg(long)]
        vad: Option<i32>,

        /// Dereverberation strength, 0.0-1.0
        #[arg(long)]
        dereverb: Option<f32>,

        #[arg(long)]
        amplification: Option<f32>,
    },
    /// Capture the local microphone and send it to a server
    Client {
        /// Server IP address, or Bluetooth MAC address
        #[arg(long)]
        address: Option<String>,
    },
}

#[cfg(feature = "alsa-backend")]
fn devices(config: &Config) -> anyhow::Result<Arc<dyn DeviceProvider>> {
    Ok(Arc::new(micyou::audio::AlsaDevices {
        capture_device: config.capture_device.to_string(),
        playback_device: config.playback_device.to_string(),
        virtual_device: config.virtual_device.to_string(),
    }))
}

#[cfg(not(feature = "alsa-backend"))]
fn devices(_config: &Config) -> anyhow::Result<Arc<dyn DeviceProvider>> {
    anyhow::bail!("built without an audio backend; enable the alsa-backend feature")
}

fn apply_dsp_flags(
    dsp: &mut DspConfig,
    ns: Option<NsAlgorithm>,
    agc: Option<i32>,
    vad: Option<i32>,
    dereverb: Option<f32>,
    amplification: Option<f32>,
) {
    if let Some(algorithm) = ns {
        dsp.enable_ns = true;
        dsp.ns_algorithm = algorithm;
    }
    if let Some(target) = agc {
        dsp.enable_agc = true;
        dsp.agc_target = target;
    }
    if let Some(threshold) = vad {
        dsp.enable_vad = true;
        dsp.vad_threshold = threshold.clamp(0, 100);
    }
    if let Some(level) = dereverb {
        dsp.enable_dereverb = true;
        dsp.dereverb_level = level.clamp(0.0, 1.0);
    }
    if let Some(gain) = amplification {
        dsp.amplification = gain.max(0.0);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} {}", config.app_name, config.app_version);

    let mut connection = config.connection();
    if let Some(transport) = cli.transport {
        connection.transport = transport;
    }
    if let Some(port) = cli.port {
        connection.port = port;
    }
    if let Some(rate) = cli.sample_rate {
        connection.sample_rate = rate;
    }
    if let Some(channels) = cli.channels {
        connection.channel_count = channels;
    }
    if let Some(format) = cli.format {
        connection.sample_format = format;
    }

    let devices = devices(&config)?;
    let settings = EngineSettings::from(&config);
    let notifier = Arc::new(LogNotifier);

    let engine: Arc<dyn AudioEngine> = match cli.mode {
        Mode::Server {
            monitor,
            ns,
            agc,
            vad,
            dereverb,
            amplification,
        } => {
            let mut dsp = config.dsp;
            apply_dsp_flags(&mut dsp, ns, agc, vad, dereverb, amplification);
            let engine = ConsumerEngine::new(devices, settings).with_notifier(notifier);
            engine.update_config(dsp);
            engine.set_monitoring(monitor);
            Arc::new(engine)
        }
        Mode::Client { address } => {
            if let Some(address) = address {
                connection.address = address;
            }
            Arc::new(ProducerEngine::new(devices, settings).with_notifier(notifier))
        }
    };
    engine.set_mute(cli.mute);

    let mut state = engine.status().subscribe_state();
    engine.start(connection).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping");
                engine.stop().await;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                log::info!("State: {}", current);
                match current {
                    EngineState::Idle => break,
                    EngineState::Error(message) => {
                        engine.stop().await;
                        anyhow::bail!(message);
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
