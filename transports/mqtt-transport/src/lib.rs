//! MQTT signaling transport for voxlink.
//!
//! This crate provides a concrete implementation of the `SignalingConnector`
//! trait using `rumqttc`. The connection is a dumb pipe for JSON payloads
//! with no knowledge of the control protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use voxcore::net::{SignalingChannel, SignalingConnector, SignalingCredentials, SignalingEvent};

/// Capacity of the request queue between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Open MQTT connection.
pub struct MqttSignalingChannel {
    client: AsyncClient,
}

#[async_trait]
impl SignalingChannel for MqttSignalingChannel {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), anyhow::Error> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| anyhow::anyhow!("MQTT publish error: {}", e))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(target: "Signaling/MQTT", "Disconnect request dropped: {e}");
        }
    }
}

/// Connector for MQTT 3.1.1 brokers.
pub struct MqttSignalingConnector {
    connect_timeout: Duration,
}

impl MqttSignalingConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for MqttSignalingConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingConnector for MqttSignalingConnector {
    async fn connect(
        &self,
        credentials: &SignalingCredentials,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>), anyhow::Error> {
        info!(
            target: "Signaling/MQTT",
            "Connecting to {}:{} as {}",
            credentials.host, credentials.port, credentials.client_id
        );

        let mut options = MqttOptions::new(
            credentials.client_id.clone(),
            credentials.host.clone(),
            credentials.port,
        );
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
        options.set_keep_alive(credentials.keep_alive);
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| anyhow::anyhow!("MQTT connect timed out after {:?}", self.connect_timeout))??;

        client
            .subscribe(credentials.subscribe_topic.clone(), QoS::AtMostOnce)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT subscribe error: {}", e))?;
        info!(
            target: "Signaling/MQTT",
            "Connected, subscribed to {}", credentials.subscribe_topic
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        // Queued before the loop starts so it is always the first event.
        let _ = event_tx.try_send(SignalingEvent::Connected);
        tokio::spawn(read_pump(event_loop, event_tx));

        let channel: Arc<dyn SignalingChannel> = Arc::new(MqttSignalingChannel { client });
        Ok((channel, event_rx))
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), anyhow::Error> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(anyhow::anyhow!("MQTT broker refused connection: {:?}", ack.code));
            }
            Ok(_) => continue,
            Err(e) => return Err(anyhow::anyhow!("MQTT connect error: {}", e)),
        }
    }
}

async fn read_pump(mut event_loop: EventLoop, event_tx: mpsc::Sender<SignalingEvent>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    target: "Signaling/MQTT",
                    "<-- {} ({} bytes)", publish.topic, publish.payload.len()
                );
                let event = SignalingEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if event_tx.send(event).await.is_err() {
                    debug!(target: "Signaling/MQTT", "Event receiver dropped, stopping read pump");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!(target: "Signaling/MQTT", "Broker sent disconnect");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!(target: "Signaling/MQTT", "Disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "Signaling/MQTT", "Connection lost: {e}");
                break;
            }
        }
    }
    let _ = event_tx.send(SignalingEvent::Disconnected).await;
}
