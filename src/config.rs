use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dsp::{DspConfig, NsAlgorithm};
use crate::protocol::SampleFormat;

/// Build-time defaults baked in from config.toml.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置
    pub transport: TransportKind,
    pub address: &'static str,
    pub port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub adb_timeout: Duration,
    pub delivery_capacity: usize,

    // 音频配置
    pub sample_rate: u32,
    pub channels: u8,
    pub sample_format: SampleFormat,
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub virtual_device: &'static str,

    // DSP 默认参数
    pub dsp: DspConfig,
    pub model_path: Option<&'static str>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    pub fn new() -> Result<Self, &'static str> {
        let model_path = env!("DSP_MODEL_PATH");
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            transport: env!("NET_TRANSPORT")
                .parse()
                .map_err(|_| "Failed to parse NET_TRANSPORT")?,
            address: env!("NET_ADDRESS"),
            port: env!("NET_PORT")
                .parse()
                .map_err(|_| "Failed to parse NET_PORT")?,
            connect_timeout: Duration::from_millis(
                env!("NET_CONNECT_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse NET_CONNECT_TIMEOUT_MS")?,
            ),
            handshake_timeout: Duration::from_millis(
                env!("NET_HANDSHAKE_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse NET_HANDSHAKE_TIMEOUT_MS")?,
            ),
            adb_timeout: Duration::from_millis(
                env!("NET_ADB_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse NET_ADB_TIMEOUT_MS")?,
            ),
            delivery_capacity: env!("NET_DELIVERY_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse NET_DELIVERY_CAPACITY")?,

            sample_rate: env!("AUDIO_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
            channels: env!("AUDIO_CHANNELS")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
            sample_format: env!("AUDIO_SAMPLE_FORMAT")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_FORMAT")?,
            capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            virtual_device: env!("AUDIO_VIRTUAL_DEVICE"),

            dsp: DspConfig {
                enable_ns: env!("DSP_ENABLE_NS")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_ENABLE_NS")?,
                ns_algorithm: env!("DSP_NS_ALGORITHM")
                    .parse::<NsAlgorithm>()
                    .map_err(|_| "Failed to parse DSP_NS_ALGORITHM")?,
                enable_agc: env!("DSP_ENABLE_AGC")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_ENABLE_AGC")?,
                agc_target: env!("DSP_AGC_TARGET")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_AGC_TARGET")?,
                enable_vad: env!("DSP_ENABLE_VAD")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_ENABLE_VAD")?,
                vad_threshold: env!("DSP_VAD_THRESHOLD")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_VAD_THRESHOLD")?,
                enable_dereverb: env!("DSP_ENABLE_DEREVERB")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_ENABLE_DEREVERB")?,
                dereverb_level: env!("DSP_DEREVERB_LEVEL")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_DEREVERB_LEVEL")?,
                amplification: env!("DSP_AMPLIFICATION")
                    .parse()
                    .map_err(|_| "Failed to parse DSP_AMPLIFICATION")?,
            },
            model_path: (!model_path.is_empty()).then_some(model_path),
        })
    }

    /// Session parameters assembled from the defaults.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            transport: self.transport,
            address: self.address.to_string(),
            port: self.port,
            sample_rate: self.sample_rate,
            channel_count: self.channels,
            sample_format: self.sample_format,
        }
    }
}

/// Medium carrying the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Wifi,
    Bluetooth,
    /// TCP over `adb reverse` to the loopback interface
    Usb,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" | "tcp" => Ok(TransportKind::Wifi),
            "bluetooth" | "bt" | "rfcomm" => Ok(TransportKind::Bluetooth),
            "usb" | "adb" => Ok(TransportKind::Usb),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Wifi => "wifi",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Usb => "usb",
        };
        f.write_str(name)
    }
}

/// Fixed for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    /// IP address or host for TCP, `XX:XX:XX:XX:XX:XX` for Bluetooth
    pub address: String,
    pub port: u16,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub sample_format: SampleFormat,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Wifi,
            address: "127.0.0.1".to_string(),
            port: 6000,
            sample_rate: 48000,
            channel_count: 1,
            sample_format: SampleFormat::Pcm16,
        }
    }
}
