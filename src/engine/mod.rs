//! engine - Session lifecycle for both ends of the link
//!
//! Each engine owns at most one session task. The session task spawns a
//! writer (draining the [`DeliveryChannel`]) and a reader (decoding frames),
//! and runs the capture or playback loop itself. Aborting the session task
//! drops both children and runs cleanup through a guard, so every exit path
//! leaves the engine in a consistent state.

mod consumer;
mod delivery;
mod producer;
mod session;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, ConnectionConfig};
use crate::dsp::DspConfig;
use crate::dsp::neural::model_candidates;

pub use consumer::ConsumerEngine;
pub use delivery::DeliveryChannel;
pub use producer::ProducerEngine;
pub use session::{EngineCore, EngineStatus};

/// Connection state published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Error(String),
}

impl EngineState {
    pub fn is_error(&self) -> bool {
        matches!(self, EngineState::Error(_))
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::Connecting => f.write_str("connecting"),
            EngineState::Streaming => f.write_str("streaming"),
            EngineState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Engine parameters that outlive a single session.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Per `adb` invocation
    pub adb_timeout: Duration,
    pub delivery_capacity: usize,
    /// Initial DSP snapshot; replaced through `update_config`
    pub dsp: DspConfig,
    /// Neural model files to try, in order
    pub model_candidates: Vec<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            adb_timeout: Duration::from_secs(6),
            delivery_capacity: 64,
            dsp: DspConfig::default(),
            model_candidates: model_candidates(None),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            adb_timeout: config.adb_timeout,
            delivery_capacity: config.delivery_capacity,
            dsp: config.dsp,
            model_candidates: model_candidates(config.model_path.map(Path::new)),
        }
    }
}

/// Command and observation surface shared by both engines.
///
/// Only `start` differs between the two; everything else works on the
/// [`EngineCore`].
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Begin a session. Ignored while one is already running.
    async fn start(&self, config: ConnectionConfig);

    fn core(&self) -> &EngineCore;

    /// Cancel the running session and return to `Idle`.
    async fn stop(&self) {
        self.core().stop().await;
    }

    /// Change the local mute state and tell the peer when connected.
    fn set_mute(&self, muted: bool) {
        self.core().set_mute(muted);
    }

    /// Publish a new DSP snapshot; picked up on the next buffer.
    fn update_config(&self, config: DspConfig) {
        self.core().update_config(config);
    }

    /// Let processed audio reach a non-virtual output.
    fn set_monitoring(&self, enabled: bool) {
        self.core().set_monitoring(enabled);
    }

    /// Relay progress of the external virtual-device installer.
    fn report_install_progress(&self, progress: Option<String>) {
        self.status().report_install_progress(progress);
    }

    fn status(&self) -> &EngineStatus {
        self.core().status()
    }
}

/// Told when audio starts and stops flowing, e.g. to show an OS notification.
pub trait StreamingNotifier: Send + Sync {
    fn streaming_started(&self);
    fn streaming_stopped(&self);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl StreamingNotifier for LogNotifier {
    fn streaming_started(&self) {
        log::info!("Streaming started");
    }

    fn streaming_stopped(&self) {
        log::info!("Streaming stopped");
    }
}

/// "Disconnect" button of a notification.
///
/// Holds the engine weakly so a lingering notification never keeps it alive.
#[derive(Clone)]
pub struct DisconnectAction {
    engine: Weak<dyn AudioEngine>,
}

impl DisconnectAction {
    pub fn new<E: AudioEngine + 'static>(engine: &Arc<E>) -> Self {
        let engine: Arc<dyn AudioEngine> = engine.clone();
        Self {
            engine: Arc::downgrade(&engine),
        }
    }

    /// Stop the engine if it still exists. Returns whether it did.
    pub async fn trigger(&self) -> bool {
        match self.engine.upgrade() {
            Some(engine) => {
                engine.stop().await;
                true
            }
            None => {
                log::debug!("Disconnect requested for an engine that is gone");
                false
            }
        }
    }
}
