use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    dsp: Dsp,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    transport: String,
    address: String,
    port: u16,
    connect_timeout_ms: u64,
    handshake_timeout_ms: u64,
    adb_timeout_ms: u64,
    delivery_capacity: usize,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    channels: u8,
    sample_format: String,
    capture_device: String,
    playback_device: String,
    virtual_device: String,
}

#[derive(Deserialize)]
struct Dsp {
    enable_ns: bool,
    ns_algorithm: String,
    enable_agc: bool,
    agc_target: i32,
    enable_vad: bool,
    vad_threshold: i32,
    enable_dereverb: bool,
    dereverb_level: f32,
    amplification: f32,
    model_path: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=NET_TRANSPORT={}", config.network.transport);
    println!("cargo:rustc-env=NET_ADDRESS={}", config.network.address);
    println!("cargo:rustc-env=NET_PORT={}", config.network.port);
    println!("cargo:rustc-env=NET_CONNECT_TIMEOUT_MS={}", config.network.connect_timeout_ms);
    println!("cargo:rustc-env=NET_HANDSHAKE_TIMEOUT_MS={}", config.network.handshake_timeout_ms);
    println!("cargo:rustc-env=NET_ADB_TIMEOUT_MS={}", config.network.adb_timeout_ms);
    println!("cargo:rustc-env=NET_DELIVERY_CAPACITY={}", config.network.delivery_capacity);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_SAMPLE_FORMAT={}", config.audio.sample_format);
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_VIRTUAL_DEVICE={}", config.audio.virtual_device);

    // DSP 默认参数
    println!("cargo:rustc-env=DSP_ENABLE_NS={}", config.dsp.enable_ns);
    println!("cargo:rustc-env=DSP_NS_ALGORITHM={}", config.dsp.ns_algorithm);
    println!("cargo:rustc-env=DSP_ENABLE_AGC={}", config.dsp.enable_agc);
    println!("cargo:rustc-env=DSP_AGC_TARGET={}", config.dsp.agc_target);
    println!("cargo:rustc-env=DSP_ENABLE_VAD={}", config.dsp.enable_vad);
    println!("cargo:rustc-env=DSP_VAD_THRESHOLD={}", config.dsp.vad_threshold);
    println!("cargo:rustc-env=DSP_ENABLE_DEREVERB={}", config.dsp.enable_dereverb);
    println!("cargo:rustc-env=DSP_DEREVERB_LEVEL={}", config.dsp.dereverb_level);
    println!("cargo:rustc-env=DSP_AMPLIFICATION={}", config.dsp.amplification);
    println!("cargo:rustc-env=DSP_MODEL_PATH={}", config.dsp.model_path);

    if std::env::var_os("CARGO_FEATURE_SPEEXDSP").is_some() {
        link_speexdsp();
    }
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
