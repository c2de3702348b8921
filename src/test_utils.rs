//! In-memory stand-ins for the HTTP, signaling and audio seams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use voxcore::net::{
    HttpClient, HttpRequest, HttpResponse, SignalingChannel, SignalingConnector,
    SignalingCredentials, SignalingEvent,
};

use crate::audio::AudioSink;

#[derive(Debug, Clone, Default)]
pub struct FailingMockHttpClient;

#[async_trait]
impl HttpClient for FailingMockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        Err(anyhow!("Not implemented"))
    }
}

/// Replies with queued responses in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    responses: StdMutex<VecDeque<HttpResponse>>,
    requests: StdMutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, status_code: u16, body: serde_json::Value) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(HttpResponse {
                status_code,
                body: body.to_string().into_bytes(),
            });
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.responses
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted response left"))
    }
}

/// Audio sink that keeps every frame for inspection.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<Vec<i16>>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Arc<Mutex<Vec<Vec<i16>>>> {
        self.frames.clone()
    }
}

#[async_trait]
impl AudioSink for CollectingSink {
    async fn write_frame(&mut self, pcm: &[i16]) -> Result<()> {
        self.frames.lock().await.push(pcm.to_vec());
        Ok(())
    }
}

type Responder = Box<dyn Fn(&serde_json::Value) -> Vec<serde_json::Value> + Send + Sync>;

struct MemoryState {
    published: Mutex<Vec<(String, serde_json::Value)>>,
    events_tx: mpsc::Sender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
    responder: StdMutex<Option<Responder>>,
    credentials: StdMutex<Option<SignalingCredentials>>,
    disconnected: std::sync::atomic::AtomicBool,
}

/// Broker-less signaling: records publishes and lets tests play the server.
///
/// A responder installed with [`MemorySignaling::respond_with`] sees every
/// published message and may answer with any number of server messages.
#[derive(Clone)]
pub struct MemorySignaling {
    state: Arc<MemoryState>,
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignaling {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            state: Arc::new(MemoryState {
                published: Mutex::new(Vec::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                responder: StdMutex::new(None),
                credentials: StdMutex::new(None),
                disconnected: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&serde_json::Value) -> Vec<serde_json::Value> + Send + Sync + 'static,
    ) {
        if let Ok(mut slot) = self.state.responder.lock() {
            *slot = Some(Box::new(responder));
        }
    }

    pub fn channel(&self) -> Arc<dyn SignalingChannel> {
        Arc::new(self.clone())
    }

    /// Deliver a server message to the client.
    pub async fn inject(&self, message: serde_json::Value) {
        let _ = self
            .state
            .events_tx
            .send(SignalingEvent::Message {
                topic: "devices/p2p/memory".to_string(),
                payload: Bytes::from(message.to_string()),
            })
            .await;
    }

    pub async fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.state.published.lock().await.clone()
    }

    /// Types of all published messages, in order.
    pub async fn published_types(&self) -> Vec<String> {
        self.published()
            .await
            .iter()
            .filter_map(|(_, m)| m["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn credentials(&self) -> Option<SignalingCredentials> {
        self.state.credentials.lock().ok().and_then(|c| c.clone())
    }

    pub fn is_disconnected(&self) -> bool {
        self.state
            .disconnected
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let message: serde_json::Value = serde_json::from_slice(payload)?;
        self.state
            .published
            .lock()
            .await
            .push((topic.to_string(), message.clone()));

        let replies = match self.state.responder.lock() {
            Ok(responder) => responder.as_ref().map(|r| r(&message)).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for reply in replies {
            self.inject(reply).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.state
            .disconnected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.state.events_tx.try_send(SignalingEvent::Disconnected);
    }
}

#[async_trait]
impl SignalingConnector for MemorySignaling {
    async fn connect(
        &self,
        credentials: &SignalingCredentials,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>)> {
        if let Ok(mut slot) = self.state.credentials.lock() {
            *slot = Some(credentials.clone());
        }
        let events = self
            .state
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("memory signaling already connected"))?;
        self.state
            .events_tx
            .send(SignalingEvent::Connected)
            .await
            .map_err(|_| anyhow!("event stream closed"))?;
        Ok((self.channel(), events))
    }
}
