//! Session controller against in-memory signaling and a loopback media server.

use std::sync::Arc;
use std::time::Duration;

use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use voxcore::crypto::{DecodedPacket, SecureDatagramTransport};
use voxcore::session::{SessionDescriptor, UdpGrant};
use voxcore::state::SessionState;
use voxlink::audio::{AudioBackend, AudioSink, AudioSource, FileAudioBackend, SilenceSource};
use voxlink::config::ClientConfig;
use voxlink::error::{BootstrapError, SessionError, SignalingError};
use voxlink::session::AudioParams;
use voxlink::test_utils::{
    CollectingSink, FailingMockHttpClient, MemorySignaling, ScriptedHttpClient,
};
use voxlink::{CloseReason, ControllerHandle, SessionController};

const KEY: &str = "000102030405060708090a0b0c0d0e0f";
const REGRANT_KEY: &str = "ffeeddccbbaa99887766554433221100";
const NONCE: &str = "010000000000002a0000000000000000";
const FRAME_BYTES: usize = 640;

fn pcm_audio() -> AudioParams {
    AudioParams {
        format: "pcm".to_string(),
        ..AudioParams::default()
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        device_id: Some("00:16:3e:00:00:01".parse().unwrap()),
        audio: pcm_audio(),
        hello_timeout: Duration::from_secs(2),
        recv_timeout: Duration::from_millis(50),
        retry_delay: Duration::from_millis(50),
        join_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

fn bootstrap_http() -> Arc<ScriptedHttpClient> {
    let http = Arc::new(ScriptedHttpClient::new());
    http.push_json(
        200,
        json!({
            "mqtt": {
                "endpoint": "broker.test:1883",
                "client_id": "GID_test@@@00_16_3e_00_00_01@@@abc",
                "username": "user",
                "password": "secret"
            }
        }),
    );
    http
}

fn hello_with_key(session_id: &str, port: u16, key: &str) -> Value {
    json!({
        "type": "hello",
        "session_id": session_id,
        "transport": "udp",
        "audio_params": {"sample_rate": 16000, "channels": 1, "frame_duration": 20, "format": "pcm"},
        "udp": {"server": "127.0.0.1", "port": port, "key": key, "nonce": NONCE, "encryption": "aes-128-ctr"}
    })
}

fn hello_reply(session_id: &str, port: u16) -> Value {
    hello_with_key(session_id, port, KEY)
}

fn transport_for(key: &str) -> SecureDatagramTransport {
    let grant = UdpGrant {
        server: "127.0.0.1".to_string(),
        port: 1,
        encryption: None,
        key: key.to_string(),
        nonce: NONCE.to_string(),
    };
    SessionDescriptor::from_grant("s1", None, &grant)
        .unwrap()
        .transport()
}

fn transport() -> SecureDatagramTransport {
    transport_for(KEY)
}

/// Silence in, every played frame kept.
struct CollectingBackend {
    sink: CollectingSink,
}

#[async_trait]
impl AudioBackend for CollectingBackend {
    async fn open_source(&self) -> anyhow::Result<Box<dyn AudioSource>> {
        Ok(Box::new(SilenceSource))
    }

    async fn open_sink(&self) -> anyhow::Result<Box<dyn AudioSink>> {
        Ok(Box::new(self.sink.clone()))
    }
}

struct Harness {
    memory: MemorySignaling,
    server: UdpSocket,
    handle: ControllerHandle,
    run: tokio::task::JoinHandle<Result<CloseReason, SessionError>>,
}

async fn start_session(config: ClientConfig) -> Harness {
    start_session_with(config, Arc::new(FileAudioBackend::new(None, None))).await
}

async fn start_session_with(config: ClientConfig, audio: Arc<dyn AudioBackend>) -> Harness {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let memory = MemorySignaling::new();
    memory.respond_with(move |message| {
        if message["type"] == "hello" {
            vec![hello_reply("s1", port)]
        } else {
            Vec::new()
        }
    });

    let (controller, handle) = SessionController::new(
        config,
        bootstrap_http(),
        Arc::new(memory.clone()),
        audio,
    );
    let run = tokio::spawn(controller.run());

    let state = tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for(|s| s.is_streaming() || s.is_terminal()),
    )
    .await
    .unwrap();
    assert!(state.is_streaming(), "unexpected state {state:?}");

    Harness {
        memory,
        server,
        handle,
        run,
    }
}

async fn recv_payload(server: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    transport().decode(&buf[..n]).unwrap().payload
}

async fn recv_packet(
    server: &UdpSocket,
    transport: &SecureDatagramTransport,
) -> (DecodedPacket, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    (transport.decode(&buf[..n]).unwrap(), from)
}

/// Next datagram carrying a full audio frame, skipping probes and keepalives.
async fn recv_audio_frame(server: &UdpSocket) -> DecodedPacket {
    let transport = transport();
    for _ in 0..50 {
        let (packet, _) = recv_packet(server, &transport).await;
        if packet.payload.len() == FRAME_BYTES {
            return packet;
        }
    }
    panic!("no captured audio reached the server");
}

/// Discard queued datagrams until the socket stays quiet for 60 ms.
async fn drain(server: &UdpSocket) {
    let mut buf = [0u8; 2048];
    for _ in 0..100 {
        if tokio::time::timeout(Duration::from_millis(60), server.recv_from(&mut buf))
            .await
            .is_err()
        {
            return;
        }
    }
    panic!("server socket never went quiet");
}

async fn send_audio(server: &UdpSocket, to: SocketAddr, sequences: std::ops::RangeInclusive<u32>) {
    let transport = transport();
    for seq in sequences {
        let packet = transport.encode(seq, &[0u8; FRAME_BYTES]).unwrap();
        server.send_to(&packet, to).await.unwrap();
    }
}

async fn wait_retry_text(memory: &MemorySignaling, attempt: u32) {
    let expected = format!("retry attempt {attempt}");
    for _ in 0..200 {
        let found = memory
            .published()
            .await
            .iter()
            .any(|(_, m)| m["type"] == "listen" && m["text"] == expected.as_str());
        if found {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{expected} was never published");
}

async fn wait_published(memory: &MemorySignaling, kind: &str) -> Value {
    for _ in 0..200 {
        if let Some((_, message)) = memory
            .published()
            .await
            .into_iter()
            .rev()
            .find(|(_, m)| m["type"] == kind)
        {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no {kind} message published");
}

#[tokio::test]
async fn test_handshake_streaming_and_goodbye_on_shutdown() {
    let h = start_session(config()).await;

    let credentials = h.memory.credentials().unwrap();
    assert_eq!(credentials.host, "broker.test");
    assert_eq!(credentials.subscribe_topic, "devices/p2p/GID_test@@@00_16_3e_00_00_01@@@abc");

    let published = h.memory.published().await;
    assert_eq!(published[0].0, "device-server");
    assert_eq!(published[0].1["type"], "hello");
    assert_eq!(published[0].1["version"], 3);
    assert_eq!(published[0].1["transport"], "mqtt");

    assert_eq!(recv_payload(&h.server).await, b"ping:s1");
    assert_eq!(h.handle.state().session_id(), Some("s1"));

    h.handle.shutdown();
    let reason = tokio::time::timeout(Duration::from_secs(5), h.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::Shutdown);

    let goodbye = wait_published(&h.memory, "goodbye").await;
    assert_eq!(goodbye["session_id"], "s1");
    assert!(h.memory.is_disconnected());
    assert_eq!(h.handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_operator_commands_publish_control_messages() {
    let h = start_session(config()).await;
    assert_eq!(recv_payload(&h.server).await, b"ping:s1");

    h.handle.trigger_turn_start().await.unwrap();
    let greeting = wait_published(&h.memory, "start_greeting").await;
    assert_eq!(greeting["session_id"], "s1");

    h.handle.trigger_listen_stop().await.unwrap();
    let listen = wait_published(&h.memory, "listen").await;
    assert_eq!(listen["state"], "stop");

    h.handle.trigger_abort().await.unwrap();
    wait_published(&h.memory, "abort").await;

    // Clearing history publishes goodbye but keeps the session.
    h.handle.trigger_clear_history().await.unwrap();
    wait_published(&h.memory, "goodbye").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.handle.state().is_streaming());

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_turn_start_sends_keepalive_and_silent_turn_retries() {
    let h = start_session(config()).await;
    assert_eq!(recv_payload(&h.server).await, b"ping:s1");

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    assert_eq!(recv_payload(&h.server).await, b"keepalive:s1");

    h.memory.inject(json!({"type": "tts", "state": "stop"})).await;
    let listen = wait_published(&h.memory, "listen").await;
    assert_eq!(listen["state"], "detect");
    assert_eq!(listen["text"], "retry attempt 1");

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_goodbye_tears_down() {
    let h = start_session(config()).await;
    h.memory
        .inject(json!({"type": "ready_for_greeting"}))
        .await;
    h.memory
        .inject(json!({"type": "goodbye", "session_id": "s1"}))
        .await;

    let reason = tokio::time::timeout(Duration::from_secs(5), h.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::ServerGoodbye);
    assert!(h.handle.is_ready());
    assert_eq!(h.handle.state(), SessionState::Closed);
    assert!(matches!(
        h.handle.trigger_turn_start().await,
        Err(SessionError::NotStreaming)
    ));
}

#[tokio::test]
async fn test_bootstrap_failure_closes_session() {
    let (controller, handle) = SessionController::new(
        config(),
        Arc::new(FailingMockHttpClient),
        Arc::new(MemorySignaling::new()),
        Arc::new(FileAudioBackend::new(None, None)),
    );
    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, SessionError::Bootstrap(BootstrapError::Http(_))));
    assert_eq!(handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_missing_hello_reply_times_out() {
    let memory = MemorySignaling::new();
    let (controller, handle) = SessionController::new(
        ClientConfig {
            hello_timeout: Duration::from_millis(100),
            ..config()
        },
        bootstrap_http(),
        Arc::new(memory.clone()),
        Arc::new(FileAudioBackend::new(None, None)),
    );
    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Signaling(SignalingError::HandshakeTimeout(_))
    ));
    assert_eq!(memory.published_types().await, vec!["hello".to_string()]);
    assert!(memory.is_disconnected());
    assert_eq!(handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_silent_turns_stop_after_retry_limit() {
    let h = start_session(config()).await;
    assert_eq!(recv_payload(&h.server).await, b"ping:s1");

    for attempt in 1..=3 {
        h.memory.inject(json!({"type": "tts", "state": "start"})).await;
        assert_eq!(recv_payload(&h.server).await, b"keepalive:s1");
        h.memory.inject(json!({"type": "tts", "state": "stop"})).await;
        wait_retry_text(&h.memory, attempt).await;
        assert!(h.handle.state().is_streaming());
    }

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    h.memory.inject(json!({"type": "tts", "state": "stop"})).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), h.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::MediaTimeout);
    assert_eq!(h.handle.state(), SessionState::Closed);

    let retries: Vec<Value> = h
        .memory
        .published()
        .await
        .into_iter()
        .filter(|(_, m)| m["type"] == "listen")
        .map(|(_, m)| m["text"].clone())
        .collect();
    assert_eq!(retries.len(), 3);
    wait_published(&h.memory, "goodbye").await;
}

#[tokio::test]
async fn test_media_timeout_gives_up_after_retries() {
    let h = start_session(ClientConfig {
        media_timeout: Duration::from_millis(200),
        max_media_retries: 1,
        ..config()
    })
    .await;
    assert_eq!(recv_payload(&h.server).await, b"ping:s1");

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    wait_retry_text(&h.memory, 1).await;

    let reason = tokio::time::timeout(Duration::from_secs(10), h.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::MediaTimeout);
    assert_eq!(h.handle.state(), SessionState::Closed);
    assert!(h.memory.is_disconnected());
}

#[tokio::test]
async fn test_regrant_moves_media_to_new_server() {
    let h = start_session(config()).await;
    let (first_probe, _) = recv_packet(&h.server, &transport()).await;
    assert_eq!(first_probe.payload, b"ping:s1");

    let server2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port2 = server2.local_addr().unwrap().port();
    h.memory
        .inject(hello_with_key("s2", port2, REGRANT_KEY))
        .await;

    let regrant = transport_for(REGRANT_KEY);
    let (probe, _) = recv_packet(&server2, &regrant).await;
    assert_eq!(probe.payload, b"ping:s2");
    assert_eq!(probe.header.sequence, first_probe.header.sequence);

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        h.handle.wait_for(|s| s.session_id() == Some("s2")),
    )
    .await
    .unwrap();
    assert!(state.is_streaming());

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    let (keepalive, _) = recv_packet(&server2, &regrant).await;
    assert_eq!(keepalive.payload, b"keepalive:s2");

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
    let goodbye = wait_published(&h.memory, "goodbye").await;
    assert_eq!(goodbye["session_id"], "s2");
}

#[tokio::test]
async fn test_server_abort_clears_playback() {
    let sink = CollectingSink::new();
    let frames = sink.frames();
    let h = start_session_with(config(), Arc::new(CollectingBackend { sink })).await;
    let (probe, client) = recv_packet(&h.server, &transport()).await;
    assert_eq!(probe.payload, b"ping:s1");

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    assert_eq!(recv_payload(&h.server).await, b"keepalive:s1");

    // Below the start watermark on their own, above it together.
    send_audio(&h.server, client, 1..=10).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.memory.inject(json!({"type": "abort_playback"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_audio(&h.server, client, 11..=20).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(frames.lock().await.is_empty());
    assert!(h.handle.state().is_streaming());

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tts_stop_after_audio_opens_capture() {
    let h = start_session(config()).await;
    let (_, client) = recv_packet(&h.server, &transport()).await;

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    assert_eq!(recv_payload(&h.server).await, b"keepalive:s1");
    // Capture stays closed while the server speaks.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), recv_audio_frame(&h.server))
            .await
            .is_err()
    );

    send_audio(&h.server, client, 1..=3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.memory.inject(json!({"type": "tts", "state": "stop"})).await;

    let frame = recv_audio_frame(&h.server).await;
    assert!(frame.payload.iter().all(|&b| b == 0));
    assert!(
        !h.memory
            .published()
            .await
            .iter()
            .any(|(_, m)| m["type"] == "listen")
    );

    // The next turn starting does not close capture on its own.
    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    let target = frame.header.sequence + 25;
    tokio::time::timeout(Duration::from_secs(3), async {
        while recv_audio_frame(&h.server).await.header.sequence < target {}
    })
    .await
    .unwrap();

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_record_stop_closes_capture() {
    let h = start_session(config()).await;
    let (_, client) = recv_packet(&h.server, &transport()).await;

    h.memory.inject(json!({"type": "tts", "state": "start"})).await;
    assert_eq!(recv_payload(&h.server).await, b"keepalive:s1");
    send_audio(&h.server, client, 1..=3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.memory.inject(json!({"type": "tts", "state": "stop"})).await;
    recv_audio_frame(&h.server).await;

    h.memory.inject(json!({"type": "record_stop"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&h.server).await;

    let mut buf = [0u8; 2048];
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.server.recv_from(&mut buf))
            .await
            .is_err()
    );
    assert!(h.handle.state().is_streaming());

    h.handle.shutdown();
    h.run.await.unwrap().unwrap();
}
