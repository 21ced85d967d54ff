//! Test doubles for the upstream streaming service.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::upstream::UpstreamEndpoint;

/// Maps one received content frame to the raw frames sent back.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

enum Command {
    Push(String),
    PushBinary(Vec<u8>),
    HangUp,
}

/// Upstream response frame carrying a text part.
pub fn server_text_frame(text: &str, turn_complete: bool) -> String {
    json!({
        "serverContent": {
            "modelTurn": {"parts": [{"text": text}]},
            "turnComplete": turn_complete
        }
    })
    .to_string()
}

/// Upstream response frame carrying one inline audio chunk.
pub fn server_audio_frame(data: &str) -> String {
    json!({
        "serverContent": {
            "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}]}
        }
    })
    .to_string()
}

pub fn server_error_frame(message: &str) -> String {
    json!({"error": {"message": message}}).to_string()
}

/// A `ws://` URL nothing is listening on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// A `wss://` URL whose listener accepts TCP and then drops the connection
/// before any TLS handshake completes.
pub async fn dropping_wss_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    format!("wss://{}", addr)
}

#[derive(Default)]
pub struct MockUpstreamBuilder {
    reject_setup: Option<String>,
    withhold_ack: bool,
    responder: Option<Responder>,
    close_after: Option<usize>,
}

impl MockUpstreamBuilder {
    /// Answer the setup frame with an error and hang up.
    pub fn reject_setup(mut self, message: &str) -> Self {
        self.reject_setup = Some(message.to_string());
        self
    }

    /// Never acknowledge the setup frame.
    pub fn withhold_ack(mut self) -> Self {
        self.withhold_ack = true;
        self
    }

    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Hang up after this many content frames (setup excluded).
    pub fn close_after(mut self, frames: usize) -> Self {
        self.close_after = Some(frames);
        self
    }

    pub async fn start(self) -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Arc::new(Shared {
            behavior: self,
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            peer_closed: AtomicUsize::new(0),
            commands: Mutex::new(None),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    serve_connection(stream, shared).await;
                });
            }
        });

        MockUpstream { addr, shared }
    }
}

struct Shared {
    behavior: MockUpstreamBuilder,
    received: Mutex<Vec<Value>>,
    connections: AtomicUsize,
    peer_closed: AtomicUsize,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    fn record(&self, raw: &str) -> Value {
        let value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string()));
        self.received.lock().unwrap().push(value.clone());
        value
    }
}

/// Scripted stand-in for the upstream streaming service, speaking real
/// WebSocket on a loopback port.
pub struct MockUpstream {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockUpstream {
    pub fn builder() -> MockUpstreamBuilder {
        MockUpstreamBuilder::default()
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn endpoint(&self) -> UpstreamEndpoint {
        UpstreamEndpoint::new(self.url())
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
    }

    /// Every frame received so far, setup included, parsed as JSON.
    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Connections the bridge side closed or dropped.
    pub fn peer_closed_count(&self) -> usize {
        self.shared.peer_closed.load(Ordering::SeqCst)
    }

    /// Send a raw frame on the most recent connection.
    pub fn push(&self, frame: impl Into<String>) {
        if let Some(tx) = self.shared.commands.lock().unwrap().as_ref() {
            let _ = tx.send(Command::Push(frame.into()));
        }
    }

    /// Send a raw binary frame on the most recent connection.
    pub fn push_binary(&self, frame: impl Into<Vec<u8>>) {
        if let Some(tx) = self.shared.commands.lock().unwrap().as_ref() {
            let _ = tx.send(Command::PushBinary(frame.into()));
        }
    }

    /// Close the most recent connection from the upstream side.
    pub fn hang_up(&self) {
        if let Some(tx) = self.shared.commands.lock().unwrap().as_ref() {
            let _ = tx.send(Command::HangUp);
        }
    }

    pub async fn wait_for_frames(&self, count: usize, limit: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let frames = self.received();
            if frames.len() >= count || tokio::time::Instant::now() >= deadline {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_peer_close(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.peer_closed_count() > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.peer_closed_count() > 0
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();

    let setup = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
            Some(Ok(Message::Binary(bytes))) => break String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(_)) => continue,
            _ => {
                shared.peer_closed.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    };
    shared.record(&setup);

    if let Some(message) = &shared.behavior.reject_setup {
        let _ = sink
            .send(Message::Text(server_error_frame(message).into()))
            .await;
        let _ = sink.close().await;
        return;
    }

    let (tx, mut commands) = mpsc::unbounded_channel();
    *shared.commands.lock().unwrap() = Some(tx);

    if !shared.behavior.withhold_ack {
        let ack = json!({"setupComplete": {}}).to_string();
        if sink.send(Message::Text(ack.into())).await.is_err() {
            return;
        }
    }

    let mut content_frames = 0;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Push(frame)) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::PushBinary(frame)) => {
                    if sink.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::HangUp) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = source.next() => {
                let raw = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        shared.peer_closed.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let value = shared.record(&raw);
                content_frames += 1;

                if let Some(responder) = &shared.behavior.responder {
                    for reply in responder(&value) {
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }

                if shared.behavior.close_after == Some(content_frames) {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}
