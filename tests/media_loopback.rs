//! Media plane over loopback UDP.
//!
//! A plain socket plays the media server: it learns the client's address
//! from the probe and sends encrypted audio back.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use voxcore::codec::PcmCodec;
use voxcore::session::{AudioParams, SessionDescriptor, UdpGrant};
use voxlink::audio::{NullSink, SilenceSource};
use voxlink::config::ClientConfig;
use voxlink::media::{MediaSession, MediaSettings, MediaShared, ReceiveContext, run_receive};

const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";

fn pcm_audio() -> AudioParams {
    AudioParams {
        format: "pcm".to_string(),
        ..AudioParams::default()
    }
}

fn descriptor(server: &UdpSocket) -> SessionDescriptor {
    let addr = server.local_addr().unwrap();
    let grant = UdpGrant {
        server: addr.ip().to_string(),
        port: addr.port(),
        encryption: Some("aes-128-ctr".to_string()),
        key: KEY.to_string(),
        nonce: "010000000000002a0000000000000000".to_string(),
    };
    SessionDescriptor::from_grant("s1", Some(pcm_audio()), &grant).unwrap()
}

fn settings() -> MediaSettings {
    MediaSettings {
        recv_timeout: Duration::from_millis(50),
        ..MediaSettings::from(&ClientConfig::default())
    }
}

async fn wait_for_total(shared: &MediaShared, total: u64) {
    for _ in 0..400 {
        if shared.tracker.lock().await.stats().total_received >= total {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("receive loop did not see {total} packets");
}

#[tokio::test]
async fn test_hundred_packets_end_to_end() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let desc = descriptor(&server);
    assert_eq!(desc.connection_id, 42);
    let transport = desc.transport();

    let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client_addr = client.local_addr().unwrap();
    let shared = Arc::new(MediaShared::new(ClientConfig::default().jitter));
    let cancel = CancellationToken::new();
    let frame_samples = desc.audio.frame_samples();

    let task = tokio::spawn(run_receive(
        ReceiveContext {
            socket: client,
            key: desc.key.clone(),
            decoder: Box::new(PcmCodec::new(frame_samples)),
            frame_samples,
            recv_timeout: Duration::from_millis(50),
            buffer_size: 4096,
        },
        shared.clone(),
        cancel.clone(),
    ));

    for seq in 1..=100u32 {
        let pcm: Vec<u8> = (0..frame_samples * 2).map(|i| (i as u32 ^ seq) as u8).collect();
        let packet = transport.encode(seq, &pcm).unwrap();
        server.send_to(&packet, client_addr).await.unwrap();
        if seq % 20 == 0 {
            // Keep the loopback socket buffer from overflowing.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    wait_for_total(&shared, 100).await;
    let summary = shared.tracker.lock().await.summary();
    assert_eq!(summary.total, 100);
    assert_eq!(summary.missing, 0);
    assert_eq!(summary.duplicate, 0);
    assert_eq!(summary.out_of_order, 0);
    assert_eq!(summary.loss_rate, 0.0);

    assert_eq!(shared.playback.len().await, 100);
    assert_eq!(shared.playback.stats().await.frames_pushed, 100);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_foreign_key_and_garbage_are_dropped() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let desc = descriptor(&server);
    let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client_addr = client.local_addr().unwrap();
    let shared = Arc::new(MediaShared::new(ClientConfig::default().jitter));
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_receive(
        ReceiveContext {
            socket: client,
            key: desc.key.clone(),
            decoder: Box::new(PcmCodec::new(320)),
            frame_samples: 320,
            recv_timeout: Duration::from_millis(50),
            buffer_size: 4096,
        },
        shared.clone(),
        cancel.clone(),
    ));

    // Too short to hold a header.
    server.send_to(&[0x01, 0x00, 0x00], client_addr).await.unwrap();
    // Header claims more payload than the datagram carries.
    let mut truncated = desc.transport().encode(1, &[0u8; 64]).unwrap();
    truncated.truncate(40);
    server.send_to(&truncated, client_addr).await.unwrap();
    // Well-formed packet, tracked.
    let good = desc.transport().encode(2, &[0u8; 640]).unwrap();
    server.send_to(&good, client_addr).await.unwrap();

    wait_for_total(&shared, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shared.tracker.lock().await.stats().total_received, 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_turn_stats_are_isolated() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let desc = descriptor(&server);
    let transport = desc.transport();
    let mut session = MediaSession::bind(desc, settings(), CancellationToken::new())
        .await
        .unwrap();
    session
        .start(Box::new(SilenceSource), Box::new(NullSink::default()))
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (n, client_addr) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(transport.decode(&buf[..n]).unwrap().payload, b"ping:s1");

    // Turn A: a three-packet gap.
    session.begin_turn().await;
    let (n, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(transport.decode(&buf[..n]).unwrap().payload, b"keepalive:s1");
    for seq in [1u32, 2, 3, 7, 8] {
        let packet = transport.encode(seq, &[0u8; 640]).unwrap();
        server.send_to(&packet, client_addr).await.unwrap();
    }
    wait_for_total(session.shared(), 5).await;
    let turn_a = session.end_turn().await;
    assert_eq!(turn_a.total, 5);
    assert_eq!(turn_a.missing, 3);
    assert_eq!(session.shared().tracker.lock().await.gaps().len(), 1);

    // Turn B starts clean.
    session.begin_turn().await;
    {
        let tracker = session.shared().tracker.lock().await;
        assert!(tracker.gaps().is_empty());
        assert_eq!(tracker.stats().total_received, 0);
        assert_eq!(tracker.stats().missing_count, 0);
    }
    let packet = transport.encode(1, &[0u8; 640]).unwrap();
    server.send_to(&packet, client_addr).await.unwrap();
    wait_for_total(session.shared(), 1).await;
    let turn_b = session.end_turn().await;
    assert_eq!((turn_b.total, turn_b.missing), (1, 0));

    tokio::time::timeout(
        Duration::from_secs(5),
        session.shutdown(Duration::from_secs(2)),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_receive_survives_socket_errors() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let desc = descriptor(&server);

    // A port with nobody listening, so sends come back as ICMP unreachable.
    let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client_addr = client.local_addr().unwrap();
    client.connect(closed_addr).await.unwrap();
    let shared = Arc::new(MediaShared::new(ClientConfig::default().jitter));
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_receive(
        ReceiveContext {
            socket: client.clone(),
            key: desc.key.clone(),
            decoder: Box::new(PcmCodec::new(320)),
            frame_samples: 320,
            recv_timeout: Duration::from_millis(50),
            buffer_size: 4096,
        },
        shared.clone(),
        cancel.clone(),
    ));

    for _ in 0..3 {
        let _ = client.send(b"ping").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(!task.is_finished());

    client.connect(server_addr).await.unwrap();
    let packet = desc.transport().encode(1, &[0u8; 640]).unwrap();
    server.send_to(&packet, client_addr).await.unwrap();
    wait_for_total(&shared, 1).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}
