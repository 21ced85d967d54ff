use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use liveline_config::UpstreamSettings;

use crate::codec::{
    decode_handshake_reply, encode_upstream_content, encode_upstream_setup, frame_text,
    HandshakeReply, NormalizedMessage,
};
use crate::config::SessionConfig;
use crate::error::{ConnectError, RecvError, SendError};

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Install the process-wide rustls crypto provider that `wss://` connections
/// need. Safe to call any number of times; an already-installed provider is
/// left in place.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if let Err(existing) = rustls::crypto::ring::default_provider().install_default() {
            debug!(?existing, "rustls crypto provider already installed");
        }
    });
}

/// Where and how to reach the upstream streaming service.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    url: String,
    model: String,
    api_key: Option<SecretString>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl UpstreamEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = UpstreamSettings::default();
        Self {
            url: url.into(),
            model: defaults.model,
            api_key: None,
            connect_timeout: Duration::from_secs(defaults.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(defaults.handshake_timeout_secs),
        }
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            url: settings.url.clone(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone().map(SecretString::from),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// Model identifier as the upstream expects it: always `models/<name>`.
    pub fn model_name(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    fn request_url(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.url, separator, key.expose_secret())
            }
            None => self.url.clone(),
        }
    }
}

/// One upstream streaming connection.
///
/// `send` and `receive` may run concurrently from different tasks. `close`
/// may be called any number of times, from any task, and wakes a pending
/// `receive` or `send`.
pub struct UpstreamAdapter {
    endpoint: UpstreamEndpoint,
    writer: Mutex<Option<SplitSink<UpstreamStream, Message>>>,
    reader: Mutex<Option<SplitStream<UpstreamStream>>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl UpstreamAdapter {
    pub fn new(endpoint: UpstreamEndpoint) -> Self {
        Self {
            endpoint,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Open the connection, send the setup frame and wait for its
    /// acknowledgement.
    pub async fn connect(&self, config: &SessionConfig) -> Result<(), ConnectError> {
        if self.closed.is_cancelled() {
            return Err(ConnectError::Closed);
        }

        ensure_crypto_provider();
        let url = self.endpoint.request_url();
        let (stream, _response) =
            match timeout(self.endpoint.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
            {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(ConnectError::Refused(e.to_string())),
                Err(_) => return Err(ConnectError::Timeout(self.endpoint.connect_timeout)),
            };

        let (mut sink, mut stream) = stream.split();

        let model = self.endpoint.model_name();
        let setup = encode_upstream_setup(&model, config);
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| ConnectError::SetupFailed(e.to_string()))?;
        debug!(model = %model, voice = ?config.voice, "Sent upstream setup");

        let reply = match timeout(self.endpoint.handshake_timeout, read_handshake(&mut stream)).await
        {
            Ok(reply) => reply,
            Err(_) => Err(ConnectError::Timeout(self.endpoint.handshake_timeout)),
        };

        if let Err(error) = reply {
            let _ = timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
            return Err(error);
        }

        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);

        // close() may have run while the handshake was in flight.
        if self.closed.is_cancelled() {
            self.close().await;
            return Err(ConnectError::Closed);
        }

        info!(model = %model, "Upstream session established");
        Ok(())
    }

    /// Forward one message upstream. Does nothing before `connect` succeeds
    /// or after `close`.
    pub async fn send(&self, msg: &NormalizedMessage) -> Result<(), SendError> {
        let Some(frame) = encode_upstream_content(msg) else {
            debug!(kind = msg.kind(), "Message kind is not forwarded upstream");
            return Ok(());
        };

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Ok(());
        };

        tokio::select! {
            _ = self.closed.cancelled() => Ok(()),
            result = sink.send(Message::Text(frame.into())) => {
                result.map_err(|e| SendError::Transport(e.to_string()))
            }
        }
    }

    /// Wait for the next upstream frame. `Ok(None)` means the connection
    /// ended cleanly or was closed locally.
    pub async fn receive(&self) -> Result<Option<String>, RecvError> {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Ok(None);
        };

        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                next = stream.next() => next,
            };

            match next {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Binary(bytes))) => match frame_text(&bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => {
                        warn!(
                            error = %e,
                            raw = %e.raw_preview(),
                            "Skipping undecodable upstream frame"
                        );
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Upstream sent close frame");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(RecvError::Transport(e.to_string())),
            }
        }
    }

    pub async fn close(&self) {
        self.closed.cancel();

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            if let Ok(Err(e)) = timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await {
                debug!(error = %e, "Upstream close handshake failed");
            }
            info!("Upstream connection closed");
        }
        self.reader.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn read_handshake(stream: &mut SplitStream<UpstreamStream>) -> Result<(), ConnectError> {
    loop {
        let raw = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(bytes))) => match frame_text(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, raw = %e.raw_preview(), "Undecodable handshake reply");
                    return Err(ConnectError::HandshakeRejected(e.to_string()));
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                return Err(match reason {
                    Some(reason) => ConnectError::HandshakeRejected(reason),
                    None => ConnectError::Closed,
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ConnectError::Refused(e.to_string())),
            None => return Err(ConnectError::Closed),
        };

        return match decode_handshake_reply(&raw) {
            Ok(HandshakeReply::Accepted) => Ok(()),
            Ok(HandshakeReply::Rejected(reason)) => Err(ConnectError::HandshakeRejected(reason)),
            Err(e) => {
                warn!(error = %e, raw = %e.raw_preview(), "Undecodable handshake reply");
                Err(ConnectError::HandshakeRejected(e.to_string()))
            }
        };
    }
}
