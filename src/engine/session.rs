//! Pieces shared by the producer and consumer sessions.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use super::delivery::DeliveryChannel;
use super::{EngineState, StreamingNotifier};
use crate::dsp::DspConfig;
use crate::error::{EngineError, ProtocolError};
use crate::protocol::{AudioPacket, FrameReader, Message, write_frame};

/// Observable engine state. Every stream always holds its latest value.
pub struct EngineStatus {
    state: watch::Sender<EngineState>,
    level: watch::Sender<f32>,
    last_error: watch::Sender<Option<String>>,
    muted: watch::Sender<bool>,
    install_progress: watch::Sender<Option<String>>,
}

impl EngineStatus {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(EngineState::Idle),
            level: watch::Sender::new(0.0),
            last_error: watch::Sender::new(None),
            muted: watch::Sender::new(false),
            install_progress: watch::Sender::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// RMS of the last buffer, 0.0–1.0
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn subscribe_last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    pub fn subscribe_muted(&self) -> watch::Receiver<bool> {
        self.muted.subscribe()
    }

    pub fn install_progress(&self) -> Option<String> {
        self.install_progress.borrow().clone()
    }

    pub fn subscribe_install_progress(&self) -> watch::Receiver<Option<String>> {
        self.install_progress.subscribe()
    }

    pub fn report_install_progress(&self, progress: Option<String>) {
        self.install_progress.send_replace(progress);
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Engine state {} -> {}", current, state);
            *current = state;
            true
        });
    }

    pub(crate) fn set_level(&self, level: f32) {
        self.level.send_replace(level.clamp(0.0, 1.0));
    }

    pub(crate) fn set_error(&self, message: String) {
        self.record_error(message.clone());
        self.set_state(EngineState::Error(message));
    }

    /// Report a failure that does not end the session.
    pub(crate) fn record_error(&self, message: String) {
        self.last_error.send_replace(Some(message));
    }

    pub(crate) fn clear_error(&self) {
        self.last_error.send_replace(None);
    }

    /// Returns true when the value changed.
    pub(crate) fn set_muted(&self, muted: bool) -> bool {
        self.muted.send_if_modified(|current| {
            let changed = *current != muted;
            *current = muted;
            changed
        })
    }
}

/// State reachable from the session task.
pub(crate) struct Shared {
    pub status: EngineStatus,
    dsp: watch::Sender<DspConfig>,
    monitoring: watch::Sender<bool>,
    outbound: Mutex<Option<Arc<DeliveryChannel>>>,
    notifier: Mutex<Option<Arc<dyn StreamingNotifier>>>,
}

impl Shared {
    /// Make `channel` the target of locally originated messages.
    pub fn attach(&self, channel: Arc<DeliveryChannel>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(channel);
        }
    }

    /// Close and forget the current outbound channel.
    pub fn detach(&self) {
        let channel = self.outbound.lock().ok().and_then(|mut slot| slot.take());
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn send_to_peer(&self, msg: Message) {
        let channel = self.outbound.lock().ok().and_then(|slot| slot.clone());
        if let Some(channel) = channel {
            channel.push(msg);
        }
    }

    pub fn dsp(&self) -> watch::Receiver<DspConfig> {
        self.dsp.subscribe()
    }

    pub fn monitoring(&self) -> watch::Receiver<bool> {
        self.monitoring.subscribe()
    }

    fn notifier(&self) -> Option<Arc<dyn StreamingNotifier>> {
        self.notifier.lock().ok().and_then(|n| n.clone())
    }
}

struct SessionHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

/// Session slot plus the shared state both engines are built on.
pub struct EngineCore {
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<SessionHandle>>,
}

impl EngineCore {
    pub(crate) fn new(dsp: DspConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: EngineStatus::new(),
                dsp: watch::Sender::new(dsp),
                monitoring: watch::Sender::new(false),
                outbound: Mutex::new(None),
                notifier: Mutex::new(None),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> &EngineStatus {
        &self.shared.status
    }

    pub fn set_notifier(&self, notifier: Arc<dyn StreamingNotifier>) {
        if let Ok(mut slot) = self.shared.notifier.lock() {
            *slot = Some(notifier);
        }
    }

    /// Spawn the session built by `make` unless one is already running.
    pub(crate) async fn spawn_session<F, Fut>(&self, make: F)
    where
        F: FnOnce(Arc<Shared>, Uuid) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.session.lock().await;
        if let Some(running) = slot.as_ref() {
            if !running.task.is_finished() {
                log::warn!("Session {} already running, start ignored", running.id);
                return;
            }
        }
        let id = Uuid::new_v4();
        self.shared.status.clear_error();
        self.shared.status.set_state(EngineState::Connecting);
        let task = tokio::spawn(make(self.shared.clone(), id));
        *slot = Some(SessionHandle { id, task });
    }

    pub(crate) async fn stop(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.task.abort();
            if let Err(e) = session.task.await {
                if !e.is_cancelled() {
                    log::error!("Session {} panicked: {}", session.id, e);
                }
            }
            log::info!("Session {} stopped", session.id);
        }
        self.shared.detach();
        self.shared.status.set_level(0.0);
        self.shared.status.set_state(EngineState::Idle);
    }

    pub(crate) fn set_mute(&self, muted: bool) {
        if self.shared.status.set_muted(muted) {
            log::info!("Mute {}", if muted { "on" } else { "off" });
            self.shared.send_to_peer(Message::Mute { is_muted: muted });
        }
    }

    pub(crate) fn update_config(&self, config: DspConfig) {
        log::debug!("DSP config updated: {:?}", config);
        self.shared.dsp.send_replace(config);
    }

    pub(crate) fn set_monitoring(&self, enabled: bool) {
        self.shared.monitoring.send_replace(enabled);
    }
}

/// Runs on every exit of a session task, including abort.
pub(crate) struct SessionGuard {
    shared: Arc<Shared>,
    notifier: Option<Arc<dyn StreamingNotifier>>,
    streaming: bool,
}

impl SessionGuard {
    pub fn new(shared: Arc<Shared>) -> Self {
        let notifier = shared.notifier();
        Self {
            shared,
            notifier,
            streaming: false,
        }
    }

    pub fn streaming(&mut self) {
        self.shared.status.set_state(EngineState::Streaming);
        if !self.streaming {
            self.streaming = true;
            if let Some(n) = &self.notifier {
                n.streaming_started();
            }
        }
    }

    /// Back to waiting for a peer.
    pub fn connecting(&mut self) {
        self.end_streaming();
        self.shared.status.set_state(EngineState::Connecting);
    }

    fn end_streaming(&mut self) {
        self.shared.detach();
        self.shared.status.set_level(0.0);
        if self.streaming {
            self.streaming = false;
            if let Some(n) = &self.notifier {
                n.streaming_stopped();
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.end_streaming();
    }
}

/// Join handle that aborts its task when dropped.
pub(crate) struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Flatten a child task's result. A child that ends cleanly means the
/// stream is gone.
pub(crate) fn child_result(joined: Result<Result<(), EngineError>, JoinError>) -> EngineError {
    match joined {
        Ok(Ok(())) => EngineError::Disconnected,
        Ok(Err(e)) => e,
        Err(e) => EngineError::Io(std::io::Error::other(e)),
    }
}

/// Log a finished session and publish its outcome.
pub(crate) fn finish(shared: &Shared, id: Uuid, result: Result<(), EngineError>) {
    match result {
        Ok(()) => {
            log::info!("[{}] Session ended", id);
            shared.status.set_state(EngineState::Idle);
        }
        Err(e) if e.is_expected_disconnect() => {
            log::info!("[{}] Peer disconnected", id);
            shared.status.set_state(EngineState::Idle);
        }
        Err(e) => {
            log::error!("[{}] Session failed: {}", id, e);
            shared.status.set_error(e.to_string());
        }
    }
}

pub(crate) async fn with_timeout<F>(limit: Duration, handshake: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    tokio::time::timeout(limit, handshake)
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)?
}

/// Drain `channel` into `writer` until it closes.
pub(crate) async fn write_loop<W>(channel: Arc<DeliveryChannel>, mut writer: W) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = channel.recv().await {
        write_frame(&mut writer, &msg).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Decode incoming frames. Mute updates are applied here; audio goes to
/// `audio` when given, and is ignored otherwise.
pub(crate) async fn read_loop<R>(
    reader: R,
    shared: Arc<Shared>,
    audio: Option<mpsc::Sender<AudioPacket>>,
) -> Result<(), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.next_message().await? {
            Message::Mute { is_muted } => {
                log::info!("Peer set mute {}", is_muted);
                shared.status.set_muted(is_muted);
            }
            Message::Audio(packet) => match &audio {
                Some(tx) => {
                    if tx.send(packet).await.is_err() {
                        return Ok(());
                    }
                }
                None => log::trace!("Ignoring audio packet {}", packet.sequence),
            },
        }
    }
}
