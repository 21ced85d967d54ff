//! Drives one client connection from the config handshake to teardown.
//!
//! After the upstream handshake succeeds, two pumps run as separate tasks:
//! the inbound pump (client -> upstream) and the outbound pump
//! (upstream -> client). Whichever exits first cancels the other. The
//! upstream connection is closed before the coordinator waits for the
//! second pump, so a stalled peer on either side cannot keep the other
//! side's connection open.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use liveline_config::SessionSettings;

use crate::codec::{
    decode_client_frame, decode_upstream_frame, encode_client_frame, frame_text, ClientInbound,
    NormalizedMessage,
};
use crate::error::{
    DecodeError, GatewayError, ProtocolError, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStatus};
use crate::upstream::{UpstreamAdapter, UpstreamEndpoint};

const CONFIG_REQUIRED_REASON: &str = "configuration required first";
const UPSTREAM_FAILURE_REASON: &str = "upstream failure";

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// How long to wait for the client's config frame.
    pub config_timeout: Duration,
    /// Upper bound on waiting for the second pump after the first exits.
    pub shutdown_grace: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionTiming {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            config_timeout: Duration::from_secs(settings.config_timeout_secs),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The client closed its connection or it broke.
    ClientDisconnected,
    /// The upstream ended the stream cleanly.
    UpstreamClosed,
    /// Torn down from outside through the session's cancel token.
    Cancelled,
    /// Ended on an error. The client received the matching close code.
    Failed(GatewayError),
}

#[derive(Debug)]
enum PumpExit {
    EndOfStream,
    Cancelled,
    /// The client side of the connection broke.
    ClientGone(String),
    Failed(GatewayError),
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Inbound,
    Outbound,
}

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;

pub struct DuplexCoordinator {
    session: Session,
    registry: Arc<SessionRegistry>,
    endpoint: UpstreamEndpoint,
    timing: SessionTiming,
}

impl DuplexCoordinator {
    pub fn new(
        session: Session,
        registry: Arc<SessionRegistry>,
        endpoint: UpstreamEndpoint,
        timing: SessionTiming,
    ) -> Self {
        Self {
            session,
            registry,
            endpoint,
            timing,
        }
    }

    /// Run the session to completion over `socket`.
    ///
    /// The session is registered for the whole run and released before it
    /// reaches `Closed`, even if driving it panics.
    pub async fn run(mut self, socket: WebSocket) -> SessionOutcome {
        let handle = self.session.handle();
        self.registry.put(handle.clone()).await;
        info!(
            client_id = %handle.client_id(),
            session_id = handle.session_id(),
            "Session started"
        );

        let outcome = contain_panic(self.drive(socket)).await;

        self.session.begin_closing().await;
        self.registry.release(&handle).await;
        self.session.finish_closed();

        match &outcome {
            SessionOutcome::Failed(e) => warn!(
                client_id = %handle.client_id(),
                session_id = handle.session_id(),
                error = %e,
                "Session ended with error"
            ),
            other => info!(
                client_id = %handle.client_id(),
                session_id = handle.session_id(),
                outcome = ?other,
                "Session ended"
            ),
        }
        outcome
    }

    async fn drive(&mut self, mut socket: WebSocket) -> SessionOutcome {
        let cancel = self.session.cancel_token().clone();
        if let Err(e) = self.session.transition_to(SessionStatus::AwaitingConfig) {
            warn!(
                client_id = %self.session.client_id(),
                error = %e,
                "Session not awaiting config"
            );
        }

        let first = tokio::select! {
            _ = cancel.cancelled() => {
                close_client(&mut socket, close_code::AWAY, "server shutting down").await;
                return SessionOutcome::Cancelled;
            }
            first = timeout(self.timing.config_timeout, next_data_frame(&mut socket)) => first,
        };

        let frame = match first {
            Ok(Some(frame)) => frame,
            Ok(None) => return SessionOutcome::ClientDisconnected,
            Err(_) => {
                let error = ProtocolError::ConfigRequired {
                    received: "nothing before timeout".to_string(),
                };
                return reject_client(&mut socket, error).await;
            }
        };

        let accepted = match frame.and_then(|raw| decode_client_frame(&raw)) {
            Ok(inbound) => self.session.accept_first_frame(inbound),
            Err(e) => {
                warn!(error = %e, raw = %e.raw_preview(), "Undecodable first frame");
                Err(ProtocolError::ConfigRequired {
                    received: "malformed frame".to_string(),
                })
            }
        };
        if let Err(error) = accepted {
            return reject_client(&mut socket, error).await;
        }

        let Some(config) = self.session.config().cloned() else {
            let error = ProtocolError::ConfigRequired {
                received: "nothing".to_string(),
            };
            return reject_client(&mut socket, error).await;
        };

        let upstream = Arc::new(UpstreamAdapter::new(self.endpoint.clone()));
        if let Err(e) = self.session.attach_upstream(upstream.clone()) {
            return fail_client(&mut socket, e.into()).await;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                close_client(&mut socket, close_code::AWAY, "server shutting down").await;
                return SessionOutcome::Cancelled;
            }
            connected = upstream.connect(&config) => connected,
        };
        if let Err(e) = connected {
            error!(client_id = %self.session.client_id(), error = %e, "Upstream connect failed");
            return fail_client(&mut socket, e.into()).await;
        }

        if let Err(e) = self.session.transition_to(SessionStatus::Active) {
            return fail_client(&mut socket, e.into()).await;
        }

        self.run_pumps(socket, upstream).await
    }

    async fn run_pumps(&self, socket: WebSocket, upstream: Arc<UpstreamAdapter>) -> SessionOutcome {
        let client_id = self.session.client_id().to_string();
        let cancel = self.session.cancel_token().child_token();
        let (sink, stream) = socket.split();

        let mut inbound: JoinHandle<PumpExit> = tokio::spawn(inbound_pump(
            stream,
            upstream.clone(),
            cancel.clone(),
            client_id.clone(),
        ));
        let mut outbound: JoinHandle<(PumpExit, ClientSink)> = {
            let upstream = upstream.clone();
            let cancel = cancel.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                let mut sink = sink;
                let exit = outbound_pump(&mut sink, upstream, cancel, client_id).await;
                (exit, sink)
            })
        };

        let (side, exit, mut sink) = tokio::select! {
            joined = &mut inbound => {
                let exit = joined.unwrap_or_else(|e| pump_panicked(Side::Inbound, e));
                (Side::Inbound, exit, None)
            }
            joined = &mut outbound => match joined {
                Ok((exit, sink)) => (Side::Outbound, exit, Some(sink)),
                Err(e) => (Side::Outbound, pump_panicked(Side::Outbound, e), None),
            },
        };
        debug!(client_id = %client_id, ?side, ?exit, "First pump exited");

        cancel.cancel();
        upstream.close().await;

        match side {
            Side::Inbound => match timeout(self.timing.shutdown_grace, &mut outbound).await {
                Ok(Ok((_, returned))) => sink = Some(returned),
                Ok(Err(e)) => warn!(client_id = %client_id, error = %e, "Outbound pump failed"),
                Err(_) => {
                    warn!(client_id = %client_id, "Outbound pump did not stop in time");
                    outbound.abort();
                }
            },
            Side::Outbound => {
                if timeout(self.timing.shutdown_grace, &mut inbound).await.is_err() {
                    warn!(client_id = %client_id, "Inbound pump did not stop in time");
                    inbound.abort();
                }
            }
        }

        let outcome = resolve_outcome(side, exit);
        if let Some(sink) = sink.as_mut() {
            finish_client(sink, &outcome).await;
        }
        outcome
    }
}

async fn inbound_pump(
    mut stream: ClientStream,
    upstream: Arc<UpstreamAdapter>,
    cancel: CancellationToken,
    client_id: String,
) -> PumpExit {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            frame = stream.next() => frame,
        };

        let raw = match frame {
            None | Some(Ok(Message::Close(_))) => return PumpExit::EndOfStream,
            Some(Err(e)) => return PumpExit::ClientGone(e.to_string()),
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(bytes))) => match frame_text(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        client_id = %client_id,
                        error = %e,
                        raw = %e.raw_preview(),
                        "Skipping undecodable client frame"
                    );
                    continue;
                }
            },
            Some(Ok(_)) => continue,
        };

        match decode_client_frame(&raw) {
            Ok(ClientInbound::Message(msg)) => {
                if let Err(e) = upstream.send(&msg).await {
                    return PumpExit::Failed(e.into());
                }
            }
            Ok(ClientInbound::Config(_)) => {
                warn!(client_id = %client_id, "Ignoring config frame after session start");
            }
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    error = %e,
                    raw = %e.raw_preview(),
                    "Skipping undecodable client frame"
                );
            }
        }
    }
}

async fn outbound_pump(
    sink: &mut ClientSink,
    upstream: Arc<UpstreamAdapter>,
    cancel: CancellationToken,
    client_id: String,
) -> PumpExit {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            received = upstream.receive() => received,
        };

        let raw = match received {
            Ok(Some(raw)) => raw,
            Ok(None) if cancel.is_cancelled() => return PumpExit::Cancelled,
            Ok(None) => return PumpExit::EndOfStream,
            Err(e) => return PumpExit::Failed(e.into()),
        };

        let messages = match decode_upstream_frame(&raw) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    error = %e,
                    raw = %e.raw_preview(),
                    "Skipping undecodable upstream frame"
                );
                continue;
            }
        };

        for msg in messages {
            if let NormalizedMessage::Error(message) = &msg {
                warn!(client_id = %client_id, message = %message, "Upstream reported error");
            }
            if let Err(e) = sink.send(Message::Text(encode_client_frame(&msg).into())).await {
                return PumpExit::ClientGone(e.to_string());
            }
        }
    }
}

/// Await `fut`, turning a panic into a failed outcome so the caller's
/// teardown still runs.
async fn contain_panic<F>(fut: F) -> SessionOutcome
where
    F: Future<Output = SessionOutcome>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            SessionOutcome::Failed(GatewayError::ServerError(format!(
                "session task panicked: {}",
                detail
            )))
        }
    }
}

fn pump_panicked(side: Side, error: tokio::task::JoinError) -> PumpExit {
    PumpExit::Failed(GatewayError::ServerError(format!(
        "{:?} pump failed: {}",
        side, error
    )))
}

fn resolve_outcome(side: Side, exit: PumpExit) -> SessionOutcome {
    match (side, exit) {
        (_, PumpExit::Failed(e)) => SessionOutcome::Failed(e),
        (_, PumpExit::Cancelled) => SessionOutcome::Cancelled,
        (_, PumpExit::ClientGone(reason)) => {
            debug!(reason = %reason, "Client connection broke");
            SessionOutcome::ClientDisconnected
        }
        (Side::Inbound, PumpExit::EndOfStream) => SessionOutcome::ClientDisconnected,
        (Side::Outbound, PumpExit::EndOfStream) => SessionOutcome::UpstreamClosed,
    }
}

/// Tell the client how the session ended, where it is still listening.
async fn finish_client(sink: &mut ClientSink, outcome: &SessionOutcome) {
    let (code, reason) = match outcome {
        SessionOutcome::ClientDisconnected => return,
        SessionOutcome::UpstreamClosed => (close_code::NORMAL, "upstream closed"),
        SessionOutcome::Cancelled => (close_code::AWAY, "server shutting down"),
        SessionOutcome::Failed(e) => {
            let frame = encode_client_frame(&NormalizedMessage::Error(e.to_string()));
            let _ = sink.send(Message::Text(frame.into())).await;
            (e.close_code(), UPSTREAM_FAILURE_REASON)
        }
    };
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Next text or binary frame before the session starts. `None` if the
/// client went away.
async fn next_data_frame(socket: &mut WebSocket) -> Option<Result<String, DecodeError>> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
            Ok(Message::Binary(bytes)) => return Some(frame_text(&bytes)),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn reject_client(socket: &mut WebSocket, error: ProtocolError) -> SessionOutcome {
    warn!(error = %error, "Rejecting client");
    close_client(socket, CLOSE_POLICY_VIOLATION, CONFIG_REQUIRED_REASON).await;
    SessionOutcome::Failed(error.into())
}

async fn fail_client(socket: &mut WebSocket, error: GatewayError) -> SessionOutcome {
    let frame = encode_client_frame(&NormalizedMessage::Error(error.to_string()));
    let _ = socket.send(Message::Text(frame.into())).await;
    close_client(socket, CLOSE_INTERNAL_ERROR, UPSTREAM_FAILURE_REASON).await;
    SessionOutcome::Failed(error)
}

async fn close_client(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Client already gone while closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectError, RecvError};

    #[test]
    fn test_outbound_end_of_stream_is_upstream_closed() {
        let outcome = resolve_outcome(Side::Outbound, PumpExit::EndOfStream);
        assert!(matches!(outcome, SessionOutcome::UpstreamClosed));
    }

    #[test]
    fn test_inbound_end_of_stream_is_client_disconnect() {
        let outcome = resolve_outcome(Side::Inbound, PumpExit::EndOfStream);
        assert!(matches!(outcome, SessionOutcome::ClientDisconnected));

        let outcome = resolve_outcome(Side::Outbound, PumpExit::ClientGone("reset".into()));
        assert!(matches!(outcome, SessionOutcome::ClientDisconnected));
    }

    #[test]
    fn test_transport_failure_maps_to_internal_error() {
        let outcome = resolve_outcome(
            Side::Outbound,
            PumpExit::Failed(RecvError::Transport("reset".into()).into()),
        );
        match outcome {
            SessionOutcome::Failed(e) => assert_eq!(e.close_code(), CLOSE_INTERNAL_ERROR),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_wins_regardless_of_side() {
        assert!(matches!(
            resolve_outcome(Side::Inbound, PumpExit::Cancelled),
            SessionOutcome::Cancelled
        ));
        assert!(matches!(
            resolve_outcome(Side::Outbound, PumpExit::Cancelled),
            SessionOutcome::Cancelled
        ));
    }

    #[test]
    fn test_connect_failure_is_not_policy_violation() {
        let error: GatewayError = ConnectError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(error.close_code(), CLOSE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_contain_panic_maps_to_server_error() {
        let outcome = contain_panic(async {
            if true {
                panic!("handshake exploded");
            }
            SessionOutcome::UpstreamClosed
        })
        .await;
        match outcome {
            SessionOutcome::Failed(GatewayError::ServerError(reason)) => {
                assert!(reason.contains("handshake exploded"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let outcome = contain_panic(async { SessionOutcome::ClientDisconnected }).await;
        assert!(matches!(outcome, SessionOutcome::ClientDisconnected));
    }

    #[test]
    fn test_timing_from_settings() {
        let timing = SessionTiming::from(&SessionSettings {
            config_timeout_secs: 3,
            shutdown_grace_ms: 250,
        });
        assert_eq!(timing.config_timeout, Duration::from_secs(3));
        assert_eq!(timing.shutdown_grace, Duration::from_millis(250));
    }
}
