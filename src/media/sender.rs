use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use tokio::net::UdpSocket;
use voxcore::crypto::SecureDatagramTransport;
use voxcore::session::SessionDescriptor;

use crate::error::MediaError;

/// Sole writer of the outbound sequence counter.
///
/// Audio frames, the reachability probe and turn keepalives all go through
/// here so that no two packets share a `(timestamp, sequence)` counter block.
pub struct PacketSender {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    transport: SecureDatagramTransport,
    next_sequence: AtomicU32,
    packets_sent: AtomicU64,
}

impl PacketSender {
    /// Create a sender whose first packet carries sequence 0.
    pub fn new(socket: Arc<UdpSocket>, server: SocketAddr, transport: SecureDatagramTransport) -> Self {
        Self::with_initial_sequence(socket, server, transport, 0)
    }

    pub fn with_initial_sequence(
        socket: Arc<UdpSocket>,
        server: SocketAddr,
        transport: SecureDatagramTransport,
        initial: u32,
    ) -> Self {
        Self {
            socket,
            server,
            transport,
            next_sequence: AtomicU32::new(initial),
            packets_sent: AtomicU64::new(0),
        }
    }

    /// Encrypt and send one payload. Returns the sequence number used.
    pub async fn send(&self, payload: &[u8]) -> Result<u32, MediaError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let packet = self.transport.encode(sequence, payload)?;
        self.socket.send_to(&packet, self.server).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    /// Send the reachability probe. No reply is expected.
    pub async fn send_probe(&self, session: &SessionDescriptor) -> Result<u32, MediaError> {
        let sequence = self.send(&session.probe_payload()).await?;
        debug!(target: "Media/Send", "Probe sent to {} (seq {sequence})", self.server);
        Ok(sequence)
    }

    /// Send the turn-start keepalive.
    pub async fn send_keepalive(&self, session: &SessionDescriptor) -> Result<u32, MediaError> {
        let sequence = self.send(&session.keepalive_payload()).await?;
        debug!(target: "Media/Send", "Keepalive sent (seq {sequence})");
        Ok(sequence)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxcore::session::UdpGrant;

    #[tokio::test]
    async fn test_probe_keepalive_and_audio_share_counter() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let grant = UdpGrant {
            server: server_addr.ip().to_string(),
            port: server_addr.port(),
            encryption: None,
            key: "07070707070707070707070707070707".to_string(),
            nonce: "010000000000002a0000000000000000".to_string(),
        };
        let session = SessionDescriptor::from_grant("s1", None, &grant).unwrap();
        let transport = session.transport();

        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = PacketSender::new(client, server_addr, transport.clone());

        assert_eq!(sender.send_probe(&session).await.unwrap(), 0);
        assert_eq!(sender.send(b"frame").await.unwrap(), 1);
        assert_eq!(sender.send_keepalive(&session).await.unwrap(), 2);
        assert_eq!(sender.next_sequence(), 3);
        assert_eq!(sender.packets_sent(), 3);

        let mut buf = [0u8; 256];
        let mut payloads = Vec::new();
        for _ in 0..3 {
            let (n, _) = server.recv_from(&mut buf).await.unwrap();
            let decoded = transport.decode(&buf[..n]).unwrap();
            assert_eq!(decoded.header.connection_id, 42);
            payloads.push((decoded.header.sequence, decoded.payload));
        }
        assert_eq!(
            payloads,
            vec![
                (0, b"ping:s1".to_vec()),
                (1, b"frame".to_vec()),
                (2, b"keepalive:s1".to_vec())
            ]
        );
    }
}
