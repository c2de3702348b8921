use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use voxcore::codec::AudioDecoder;
use voxcore::crypto::{MediaKey, decode_packet};
use voxcore::packet::PacketType;

use super::MediaShared;

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// Receive-loop settings.
pub struct ReceiveContext {
    pub socket: Arc<UdpSocket>,
    pub key: MediaKey,
    pub decoder: Box<dyn AudioDecoder>,
    /// Interleaved samples in one decoded frame.
    pub frame_samples: usize,
    pub recv_timeout: Duration,
    pub buffer_size: usize,
}

/// UDP receive → decrypt → sequence tracking → decode → jitter buffer.
///
/// Malformed packets, codec failures and socket errors are logged and
/// skipped; only cancellation ends the loop.
pub async fn run_receive(ctx: ReceiveContext, shared: Arc<MediaShared>, cancel: CancellationToken) {
    let ReceiveContext {
        socket,
        key,
        mut decoder,
        frame_samples,
        recv_timeout,
        buffer_size,
    } = ctx;

    info!(target: "Media/Recv", "Receive task started on {:?}", socket.local_addr().ok());
    let mut buf = vec![0u8; buffer_size];
    let mut dropped = 0u64;
    let mut socket_errors = 0u64;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => r,
        };

        let (len, from) = match received {
            // Timeout only exists to re-check cancellation.
            Err(_) => continue,
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                // ICMP errors (e.g. port unreachable after the probe) surface
                // here; the socket stays usable.
                socket_errors += 1;
                if socket_errors == 1 || socket_errors % 100 == 0 {
                    warn!(target: "Media/Recv", "Socket receive failed ({socket_errors} so far): {e}");
                } else {
                    debug!(target: "Media/Recv", "Socket receive failed: {e}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => continue,
                }
            }
        };

        let packet = match decode_packet(&key, &buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                dropped += 1;
                debug!(target: "Media/Recv", "Dropping {len}-byte datagram from {from}: {e}");
                continue;
            }
        };

        if packet.header.kind() != Some(PacketType::Audio) {
            dropped += 1;
            debug!(
                target: "Media/Recv",
                "Dropping packet with type {:#04x}", packet.header.packet_type
            );
            continue;
        }

        let total = {
            let mut tracker = shared.tracker.lock().await;
            tracker.track(packet.header.sequence);
            tracker.stats().total_received
        };
        if total <= 5 {
            debug!(
                target: "Media/Recv",
                "Packet seq={} payload={}B ts={} from {from}",
                packet.header.sequence,
                packet.header.payload_len,
                packet.header.timestamp
            );
        }

        match decoder.decode(&packet.payload, frame_samples) {
            Ok(pcm) => shared.playback.push(pcm).await,
            Err(e) => {
                dropped += 1;
                warn!(target: "Media/Recv", "Decode failed for seq {}: {e}", packet.header.sequence);
            }
        }
    }

    info!(
        target: "Media/Recv",
        "Receive task finished ({dropped} packets dropped, {socket_errors} socket errors)"
    );
}
