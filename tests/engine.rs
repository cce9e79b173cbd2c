use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use micyou::audio::{AudioSink, AudioSource, DeviceProvider};
use micyou::config::{ConnectionConfig, TransportKind};
use micyou::dsp::DspConfig;
use micyou::engine::{
    AudioEngine, ConsumerEngine, DisconnectAction, EngineSettings, EngineState, ProducerEngine,
};
use micyou::protocol::handshake::{CLIENT_TOKEN, SERVER_TOKEN};
use micyou::protocol::{AudioPacket, FrameReader, Message, PACKET_MAGIC, SampleFormat, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

/// Constant-valued microphone and a recording output, the virtual cable
/// unless `speaker` is set.
#[derive(Clone, Default)]
struct FakeDevices {
    fill: i16,
    speaker: bool,
    played: Arc<Mutex<Vec<i16>>>,
}

struct FakeSource {
    fill: i16,
}

impl AudioSource for FakeSource {
    fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<usize> {
        std::thread::sleep(Duration::from_millis(10));
        buf.fill(self.fill);
        Ok(buf.len())
    }
    fn sample_rate(&self) -> u32 {
        48000
    }
    fn channels(&self) -> u8 {
        1
    }
    fn buffer_len(&self) -> usize {
        480
    }
}

struct FakeSink {
    speaker: bool,
    played: Arc<Mutex<Vec<i16>>>,
}

impl AudioSink for FakeSink {
    fn write(&mut self, samples: &[i16]) -> anyhow::Result<()> {
        self.played.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
    fn queued_ms(&self) -> Option<u64> {
        Some(60)
    }
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn is_virtual(&self) -> bool {
        !self.speaker
    }
}

impl DeviceProvider for FakeDevices {
    fn open_source(&self, _rate: u32, _channels: u8) -> anyhow::Result<Box<dyn AudioSource>> {
        Ok(Box::new(FakeSource { fill: self.fill }))
    }

    fn open_sink(&self, _rate: u32, _channels: u8, _buffer: usize) -> anyhow::Result<Box<dyn AudioSink>> {
        Ok(Box::new(FakeSink {
            speaker: self.speaker,
            played: self.played.clone(),
        }))
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        handshake_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    }
}

fn wifi(address: &str, port: u16) -> ConnectionConfig {
    ConnectionConfig {
        transport: TransportKind::Wifi,
        address: address.to_string(),
        port,
        ..ConnectionConfig::default()
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_state<F>(rx: &mut watch::Receiver<EngineState>, pred: F) -> EngineState
where
    F: Fn(&EngineState) -> bool,
{
    let seen = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("state wait timed out")
        .expect("engine dropped");
    (*seen).clone()
}

async fn connect_when_listening(port: u16) -> TcpStream {
    for _ in 0..300 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nothing listening on {}", port);
}

async fn wait_played(played: &Arc<Mutex<Vec<i16>>>, at_least: usize) -> Vec<i16> {
    for _ in 0..500 {
        {
            let samples = played.lock().unwrap();
            if samples.len() >= at_least {
                return samples.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("playback never reached {} samples", at_least);
}

/// Wait until the most recent `window` played samples all satisfy `pred`.
async fn wait_tail<F>(played: &Arc<Mutex<Vec<i16>>>, window: usize, pred: F)
where
    F: Fn(i16) -> bool,
{
    for _ in 0..500 {
        {
            let samples = played.lock().unwrap();
            if samples.len() >= window && samples[samples.len() - window..].iter().all(|&s| pred(s)) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("playback never settled");
}

/// Start `producer` against a consumer that may not be listening yet.
async fn stream_to(producer: &ProducerEngine, port: u16) {
    let mut state = producer.status().subscribe_state();
    let mut attempts = 0;
    loop {
        producer.start(wifi("127.0.0.1", port)).await;
        let seen = wait_state(&mut state, |s| {
            matches!(s, EngineState::Streaming | EngineState::Error(_))
        })
        .await;
        if seen == EngineState::Streaming {
            return;
        }
        attempts += 1;
        assert!(attempts < 100, "producer never connected: {}", seen);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn silence_packet(sequence: u32) -> Message {
    Message::Audio(AudioPacket {
        sequence,
        sample_rate: 48000,
        channel_count: 1,
        sample_format: SampleFormat::Pcm16,
        payload: Bytes::from(vec![0u8; 960]),
    })
}

async fn next_message<R: tokio::io::AsyncRead + Unpin>(frames: &mut FrameReader<R>) -> Message {
    tokio::time::timeout(WAIT, frames.next_message())
        .await
        .expect("no frame")
        .expect("stream closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_streams_silence_to_consumer() {
    let devices = FakeDevices::default();
    let consumer = ConsumerEngine::new(Arc::new(devices.clone()), settings());
    let port = free_port();
    let mut consumer_state = consumer.status().subscribe_state();
    consumer.start(wifi("0.0.0.0", port)).await;

    let producer = ProducerEngine::new(Arc::new(devices.clone()), settings());
    stream_to(&producer, port).await;
    wait_state(&mut consumer_state, |s| *s == EngineState::Streaming).await;

    let played = wait_played(&devices.played, 960).await;
    assert!(played.iter().all(|&s| s == 0));
    assert_eq!(consumer.status().level(), 0.0);
    assert_eq!(producer.status().level(), 0.0);

    let mut consumer_muted = consumer.status().subscribe_muted();
    producer.set_mute(true);
    tokio::time::timeout(WAIT, consumer_muted.wait_for(|m| *m))
        .await
        .expect("mute never reached consumer")
        .unwrap();

    producer.stop().await;
    assert_eq!(producer.status().state(), EngineState::Idle);
    wait_state(&mut consumer_state, |s| *s == EngineState::Connecting).await;
    assert_eq!(consumer.status().last_error(), None);

    consumer.stop().await;
    assert_eq!(consumer.status().state(), EngineState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_plays_packets_from_raw_peer_and_resyncs() {
    let devices = FakeDevices::default();
    let consumer = ConsumerEngine::new(Arc::new(devices.clone()), settings());
    let port = free_port();
    let mut state = consumer.status().subscribe_state();
    consumer.start(wifi("0.0.0.0", port)).await;

    let stream = connect_when_listening(port).await;
    let (mut read_half, mut write_half) = stream.into_split();
    write_half.write_all(CLIENT_TOKEN).await.unwrap();
    let mut answer = [0u8; 12];
    tokio::time::timeout(WAIT, read_half.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer, SERVER_TOKEN);
    let mut frames = FrameReader::new(read_half);
    assert_eq!(next_message(&mut frames).await, Message::Mute { is_muted: false });
    wait_state(&mut state, |s| *s == EngineState::Streaming).await;

    write_half.write_all(b"garbage!").await.unwrap();
    write_half.write_all(&encode_frame(&silence_packet(0))).await.unwrap();
    let played = wait_played(&devices.played, 480).await;
    assert_eq!(played, vec![0i16; 480]);

    // oversized header is dropped without reading a payload
    let mut oversized = PACKET_MAGIC.to_be_bytes().to_vec();
    oversized.extend_from_slice(&(3u32 * 1024 * 1024).to_be_bytes());
    write_half.write_all(&oversized).await.unwrap();
    let loud = Message::Audio(AudioPacket {
        sequence: 1,
        sample_rate: 48000,
        channel_count: 1,
        sample_format: SampleFormat::Pcm16,
        payload: Bytes::from([7i16; 480].iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<_>>()),
    });
    write_half.write_all(&encode_frame(&loud)).await.unwrap();
    let played = wait_played(&devices.played, 960).await;
    assert!(played[480..].iter().all(|&s| s == 7));

    consumer.set_mute(true);
    assert_eq!(next_message(&mut frames).await, Message::Mute { is_muted: true });

    drop(write_half);
    wait_state(&mut state, |s| *s == EngineState::Connecting).await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_survives_bad_handshake() {
    let devices = FakeDevices::default();
    let consumer = ConsumerEngine::new(Arc::new(devices.clone()), settings());
    let port = free_port();
    let mut state = consumer.status().subscribe_state();
    consumer.start(wifi("0.0.0.0", port)).await;

    let mut intruder = connect_when_listening(port).await;
    intruder.write_all(b"HelloThere!!").await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, intruder.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap_or(0);
    assert!(reply.is_empty());

    let mut last_error = consumer.status().subscribe_last_error();
    tokio::time::timeout(WAIT, last_error.wait_for(|e| e.is_some()))
        .await
        .unwrap()
        .unwrap();
    wait_state(&mut state, |s| *s == EngineState::Connecting).await;
    let error = consumer.status().last_error().unwrap();
    assert!(error.contains("Handshake"), "{}", error);

    let mut good = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    good.write_all(CLIENT_TOKEN).await.unwrap();
    let mut answer = [0u8; 12];
    tokio::time::timeout(WAIT, good.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer, SERVER_TOKEN);
    wait_state(&mut state, |s| *s == EngineState::Streaming).await;
    // a rejected connection does not linger once a producer is accepted
    assert_eq!(consumer.status().last_error(), None);
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dsp_update_applies_to_running_stream() {
    let devices = FakeDevices {
        fill: 100,
        ..FakeDevices::default()
    };
    let consumer = ConsumerEngine::new(Arc::new(devices.clone()), settings());
    let port = free_port();
    consumer.start(wifi("0.0.0.0", port)).await;
    let producer = ProducerEngine::new(Arc::new(devices.clone()), settings());
    stream_to(&producer, port).await;

    wait_tail(&devices.played, 480, |s| s == 100).await;
    consumer.update_config(DspConfig {
        amplification: 3.0,
        ..DspConfig::default()
    });
    wait_tail(&devices.played, 480, |s| s == 300).await;

    producer.stop().await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitoring_toggles_speaker_output() {
    let devices = FakeDevices {
        fill: 100,
        speaker: true,
        ..FakeDevices::default()
    };
    let consumer = ConsumerEngine::new(Arc::new(devices.clone()), settings());
    let port = free_port();
    consumer.start(wifi("0.0.0.0", port)).await;
    let producer = ProducerEngine::new(Arc::new(devices.clone()), settings());
    stream_to(&producer, port).await;

    wait_tail(&devices.played, 480, |s| s == 0).await;
    // the meter still follows the stream while the speaker is silent
    assert!(consumer.status().level() > 0.0);

    consumer.set_monitoring(true);
    wait_tail(&devices.played, 480, |s| s == 100).await;
    consumer.set_monitoring(false);
    wait_tail(&devices.played, 480, |s| s == 0).await;

    producer.stop().await;
    consumer.stop().await;
}

/// Microphone with a long blocking read that records when it is closed.
struct SlowMic {
    closed: Arc<AtomicBool>,
}

impl AudioSource for SlowMic {
    fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<usize> {
        std::thread::sleep(Duration::from_millis(300));
        buf.fill(0);
        Ok(buf.len())
    }
    fn sample_rate(&self) -> u32 {
        48000
    }
    fn channels(&self) -> u8 {
        1
    }
    fn buffer_len(&self) -> usize {
        480
    }
}

impl Drop for SlowMic {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct SlowMicDevices {
    closed: Arc<AtomicBool>,
}

impl DeviceProvider for SlowMicDevices {
    fn open_source(&self, _rate: u32, _channels: u8) -> anyhow::Result<Box<dyn AudioSource>> {
        Ok(Box::new(SlowMic {
            closed: self.closed.clone(),
        }))
    }

    fn open_sink(&self, _rate: u32, _channels: u8, _buffer: usize) -> anyhow::Result<Box<dyn AudioSink>> {
        anyhow::bail!("no speaker")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_microphone_before_idle() {
    let (listener, port) = raw_server().await;
    let closed = Arc::new(AtomicBool::new(false));
    let producer = ProducerEngine::new(
        Arc::new(SlowMicDevices {
            closed: closed.clone(),
        }),
        settings(),
    );
    let mut state = producer.status().subscribe_state();
    producer.start(wifi("127.0.0.1", port)).await;
    let _stream = accept_and_answer(&listener, SERVER_TOKEN).await;
    wait_state(&mut state, |s| *s == EngineState::Streaming).await;

    producer.stop().await;
    assert_eq!(producer.status().state(), EngineState::Idle);
    assert!(closed.load(Ordering::SeqCst), "microphone still open after stop");
}

#[tokio::test]
async fn consumer_reports_port_in_use() {
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = blocker.local_addr().unwrap().port();
    let consumer = ConsumerEngine::new(Arc::new(FakeDevices::default()), settings());
    let mut state = consumer.status().subscribe_state();
    consumer.start(wifi("0.0.0.0", port)).await;

    let state = wait_state(&mut state, EngineState::is_error).await;
    assert!(state.to_string().contains("already in use"), "{}", state);
    assert!(consumer.status().last_error().is_some());
}

async fn raw_server() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept_and_answer(listener: &TcpListener, answer: &[u8]) -> TcpStream {
    let (mut stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut token = [0u8; 12];
    stream.read_exact(&mut token).await.unwrap();
    assert_eq!(&token, CLIENT_TOKEN);
    stream.write_all(answer).await.unwrap();
    stream
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_sends_ordered_packets_and_honours_mute() {
    let (listener, port) = raw_server().await;
    let producer = ProducerEngine::new(Arc::new(FakeDevices::default()), settings());
    producer.start(wifi("127.0.0.1", port)).await;

    let stream = accept_and_answer(&listener, SERVER_TOKEN).await;
    let mut frames = FrameReader::new(stream);
    assert_eq!(next_message(&mut frames).await, Message::Mute { is_muted: false });
    for expected in 0..3u32 {
        match next_message(&mut frames).await {
            Message::Audio(packet) => {
                assert_eq!(packet.sequence, expected);
                assert_eq!(packet.sample_rate, 48000);
                assert_eq!(packet.channel_count, 1);
                assert_eq!(packet.sample_format, SampleFormat::Pcm16);
                assert_eq!(packet.payload.len(), 960);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(producer.status().state(), EngineState::Streaming);

    producer.set_mute(true);
    loop {
        if next_message(&mut frames).await == (Message::Mute { is_muted: true }) {
            break;
        }
    }
    // at most one buffer can race the mute flag
    let mut late = 0;
    while let Ok(msg) = tokio::time::timeout(Duration::from_millis(300), frames.next_message()).await {
        match msg {
            Ok(Message::Audio(_)) => late += 1,
            Ok(_) => {}
            Err(e) => panic!("stream closed while muted: {}", e),
        }
    }
    assert!(late <= 1, "{} packets sent while muted", late);
    assert_eq!(producer.status().state(), EngineState::Streaming);

    producer.stop().await;
    assert_eq!(producer.status().state(), EngineState::Idle);
}

#[tokio::test]
async fn producer_rejects_wrong_server_token() {
    let (listener, port) = raw_server().await;
    let producer = ProducerEngine::new(Arc::new(FakeDevices::default()), settings());
    let mut state = producer.status().subscribe_state();
    producer.start(wifi("127.0.0.1", port)).await;
    let _stream = accept_and_answer(&listener, b"MicYouCheck9").await;

    let state = wait_state(&mut state, EngineState::is_error).await;
    assert!(state.to_string().contains("Handshake"), "{}", state);
    assert!(producer.status().last_error().unwrap().contains("MicYouCheck9"));
}

#[tokio::test]
async fn peer_close_ends_producer_quietly() {
    let (listener, port) = raw_server().await;
    let producer = ProducerEngine::new(Arc::new(FakeDevices::default()), settings());
    let mut state = producer.status().subscribe_state();
    producer.start(wifi("127.0.0.1", port)).await;
    let stream = accept_and_answer(&listener, SERVER_TOKEN).await;
    wait_state(&mut state, |s| *s == EngineState::Streaming).await;

    drop(stream);
    wait_state(&mut state, |s| *s == EngineState::Idle).await;
    assert_eq!(producer.status().last_error(), None);
    assert_eq!(producer.status().level(), 0.0);
}

#[tokio::test]
async fn double_start_opens_one_connection() {
    let (listener, port) = raw_server().await;
    let producer = ProducerEngine::new(Arc::new(FakeDevices::default()), settings());
    producer.start(wifi("127.0.0.1", port)).await;
    producer.start(wifi("127.0.0.1", port)).await;

    let _first = listener.accept().await.unwrap();
    let second = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(second.is_err(), "a second session connected");

    producer.stop().await;
    assert_eq!(producer.status().state(), EngineState::Idle);
}

#[tokio::test]
async fn stop_interrupts_a_pending_handshake() {
    let (listener, port) = raw_server().await;
    let producer = ProducerEngine::new(
        Arc::new(FakeDevices::default()),
        EngineSettings {
            handshake_timeout: Duration::from_secs(60),
            ..settings()
        },
    );
    producer.start(wifi("127.0.0.1", port)).await;
    let _silent = listener.accept().await.unwrap();
    assert_eq!(producer.status().state(), EngineState::Connecting);

    tokio::time::timeout(Duration::from_secs(1), producer.stop())
        .await
        .expect("stop blocked");
    assert_eq!(producer.status().state(), EngineState::Idle);
}

#[tokio::test]
async fn refused_connection_is_an_error() {
    let port = free_port();
    let producer = ProducerEngine::new(Arc::new(FakeDevices::default()), settings());
    let mut state = producer.status().subscribe_state();
    producer.start(wifi("127.0.0.1", port)).await;
    wait_state(&mut state, EngineState::is_error).await;
    assert!(producer.status().last_error().is_some());
}

#[tokio::test]
async fn disconnect_action_does_not_keep_engine_alive() {
    let producer = Arc::new(ProducerEngine::new(Arc::new(FakeDevices::default()), settings()));
    let action = DisconnectAction::new(&producer);
    assert!(action.trigger().await);
    assert_eq!(producer.status().state(), EngineState::Idle);

    drop(producer);
    assert!(!action.trigger().await);
}

#[tokio::test]
async fn install_progress_is_observable() {
    let consumer = ConsumerEngine::new(Arc::new(FakeDevices::default()), settings());
    let mut progress = consumer.status().subscribe_install_progress();
    consumer.report_install_progress(Some("Installing loopback driver".into()));
    progress.changed().await.unwrap();
    assert_eq!(
        progress.borrow().as_deref(),
        Some("Installing loopback driver")
    );
    consumer.report_install_progress(None);
    assert_eq!(consumer.status().install_progress(), None);
}
