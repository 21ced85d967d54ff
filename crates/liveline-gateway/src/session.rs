use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::ClientInbound;
use crate::config::SessionConfig;
use crate::error::ProtocolError;
use crate::protocol::ConfigPayload;
use crate::registry::SessionHandle;
use crate::upstream::UpstreamAdapter;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a bridged session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionStatus {
    Created,
    AwaitingConfig,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionStatus {
    /// Whether a session in this status owns an upstream connection.
    pub fn holds_upstream(self) -> bool {
        matches!(
            self,
            SessionStatus::Connecting | SessionStatus::Active | SessionStatus::Closing
        )
    }
}

/// One client's bridged conversation.
///
/// Owned by the coordinator driving it; everyone else observes it through a
/// [`SessionHandle`].
pub struct Session {
    id: u64,
    client_id: String,
    config: Option<SessionConfig>,
    upstream: Option<Arc<UpstreamAdapter>>,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn create(client_id: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Created);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.into(),
            config: None,
            upstream: None,
            status: SessionStatus::Created,
            status_tx,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn upstream(&self) -> Option<&Arc<UpstreamAdapter>> {
        self.upstream.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Token that stops this session from outside when cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.id,
            self.client_id.clone(),
            self.created_at,
            self.status_tx.subscribe(),
            self.cancel.clone(),
        )
    }

    /// Move to `next`. Transitions must go strictly forward, and must keep
    /// the "upstream present iff Connecting/Active/Closing" rule intact.
    /// Re-entering `Closed` is a no-op.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), ProtocolError> {
        if self.status == SessionStatus::Closed && next == SessionStatus::Closed {
            return Ok(());
        }

        if next <= self.status || next.holds_upstream() != self.upstream.is_some() {
            return Err(ProtocolError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        debug!(
            client_id = %self.client_id,
            session_id = self.id,
            from = ?self.status,
            to = ?next,
            "Session transition"
        );
        self.status = next;
        self.status_tx.send_replace(next);
        Ok(())
    }

    pub fn apply_config(&mut self, payload: ConfigPayload) -> Result<(), ProtocolError> {
        if !matches!(
            self.status,
            SessionStatus::Created | SessionStatus::AwaitingConfig
        ) {
            return Err(ProtocolError::IllegalTransition {
                from: self.status,
                to: SessionStatus::Connecting,
            });
        }
        if self.config.is_some() {
            return Err(ProtocolError::ConfigAlreadyApplied);
        }

        self.config = Some(SessionConfig::from(payload));
        Ok(())
    }

    /// Accept the connection's first decoded frame, which must be a config.
    pub fn accept_first_frame(&mut self, inbound: ClientInbound) -> Result<(), ProtocolError> {
        match inbound {
            ClientInbound::Config(payload) => self.apply_config(payload),
            other => Err(ProtocolError::ConfigRequired {
                received: other.kind().to_string(),
            }),
        }
    }

    /// Attach the upstream adapter and move to `Connecting`.
    pub fn attach_upstream(&mut self, adapter: Arc<UpstreamAdapter>) -> Result<(), ProtocolError> {
        if self.config.is_none() {
            return Err(ProtocolError::ConfigRequired {
                received: "nothing".to_string(),
            });
        }
        if self.upstream.is_some() || self.status >= SessionStatus::Connecting {
            return Err(ProtocolError::IllegalTransition {
                from: self.status,
                to: SessionStatus::Connecting,
            });
        }

        self.upstream = Some(adapter);
        if let Err(e) = self.transition_to(SessionStatus::Connecting) {
            self.upstream = None;
            return Err(e);
        }
        Ok(())
    }

    /// First half of teardown: enter `Closing` and close the upstream.
    /// Sessions that never reached `Connecting` skip straight past this.
    pub async fn begin_closing(&mut self) {
        let Some(upstream) = self.upstream.clone() else {
            return;
        };
        if self.status < SessionStatus::Closing {
            if let Err(e) = self.transition_to(SessionStatus::Closing) {
                warn!(
                    client_id = %self.client_id,
                    session_id = self.id,
                    error = %e,
                    "Could not enter Closing"
                );
            }
        }
        upstream.close().await;
    }

    /// Second half of teardown: drop the upstream and enter `Closed`.
    pub fn finish_closed(&mut self) {
        self.upstream = None;
        if let Err(e) = self.transition_to(SessionStatus::Closed) {
            warn!(
                client_id = %self.client_id,
                session_id = self.id,
                error = %e,
                "Could not enter Closed"
            );
        }
    }

    pub async fn close(&mut self) {
        self.begin_closing().await;
        self.finish_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NormalizedMessage;
    use crate::upstream::UpstreamEndpoint;

    fn payload(prompt: &str) -> ConfigPayload {
        ConfigPayload {
            system_prompt: prompt.to_string(),
            voice: None,
        }
    }

    fn adapter() -> Arc<UpstreamAdapter> {
        Arc::new(UpstreamAdapter::new(UpstreamEndpoint::new("ws://127.0.0.1:9")))
    }

    #[test]
    fn test_create_starts_in_created() {
        let session = Session::create("web");
        assert_eq!(session.status(), SessionStatus::Created);
        assert_eq!(session.client_id(), "web");
        assert!(session.config().is_none());
        assert!(session.upstream().is_none());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = Session::create("same");
        let b = Session::create("same");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_apply_config_in_awaiting_config() {
        let mut session = Session::create("web");
        session.transition_to(SessionStatus::AwaitingConfig).unwrap();
        session.apply_config(payload("hi")).unwrap();
        assert_eq!(session.config().unwrap().system_prompt, "hi");
    }

    #[test]
    fn test_apply_config_twice_fails() {
        let mut session = Session::create("web");
        session.apply_config(payload("hi")).unwrap();
        let err = session.apply_config(payload("again")).unwrap_err();
        assert!(matches!(err, ProtocolError::ConfigAlreadyApplied));
        assert_eq!(session.config().unwrap().system_prompt, "hi");
    }

    #[test]
    fn test_first_frame_must_be_config() {
        let mut session = Session::create("web");
        let err = session
            .accept_first_frame(ClientInbound::Message(NormalizedMessage::Text("hi".into())))
            .unwrap_err();
        match err {
            ProtocolError::ConfigRequired { received } => assert_eq!(received, "text"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(session.config().is_none());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut session = Session::create("web");
        session.transition_to(SessionStatus::AwaitingConfig).unwrap();
        let err = session.transition_to(SessionStatus::Created).unwrap_err();
        assert!(matches!(err, ProtocolError::IllegalTransition { .. }));
        assert_eq!(session.status(), SessionStatus::AwaitingConfig);
    }

    #[test]
    fn test_connecting_requires_upstream() {
        let mut session = Session::create("web");
        assert!(session.transition_to(SessionStatus::Connecting).is_err());
        assert!(session.transition_to(SessionStatus::Active).is_err());
    }

    #[test]
    fn test_attach_upstream_requires_config() {
        let mut session = Session::create("web");
        assert!(session.attach_upstream(adapter()).is_err());
        assert!(session.upstream().is_none());
        assert_eq!(session.status(), SessionStatus::Created);
    }

    #[test]
    fn test_upstream_present_exactly_while_connected() {
        let mut session = Session::create("web");
        session.transition_to(SessionStatus::AwaitingConfig).unwrap();
        session.apply_config(payload("hi")).unwrap();
        assert!(session.upstream().is_none());

        session.attach_upstream(adapter()).unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(session.upstream().is_some());

        session.transition_to(SessionStatus::Active).unwrap();
        assert!(session.upstream().is_some());

        // Closed while still holding the upstream would break the invariant.
        assert!(session.transition_to(SessionStatus::Closed).is_err());
    }

    #[tokio::test]
    async fn test_close_walks_through_closing() {
        let mut session = Session::create("web");
        let mut status = session.handle().subscribe();
        session.apply_config(payload("hi")).unwrap();
        let upstream = adapter();
        session.attach_upstream(upstream.clone()).unwrap();
        session.transition_to(SessionStatus::Active).unwrap();

        session.begin_closing().await;
        assert_eq!(session.status(), SessionStatus::Closing);
        assert!(session.upstream().is_some());
        assert!(upstream.is_closed());

        session.finish_closed();
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(session.upstream().is_none());
        assert_eq!(*status.borrow_and_update(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_before_connect_and_repeated_close() {
        let mut session = Session::create("web");
        session.transition_to(SessionStatus::AwaitingConfig).unwrap();
        session.close().await;
        assert_eq!(session.status(), SessionStatus::Closed);

        session.close().await;
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(session.transition_to(SessionStatus::Active).is_err());
    }

    #[tokio::test]
    async fn test_teardown_reaches_closed_from_every_live_status() {
        let mut fresh = Session::create("web");
        fresh.close().await;
        assert_eq!(fresh.status(), SessionStatus::Closed);

        let mut connecting = Session::create("web");
        connecting.transition_to(SessionStatus::AwaitingConfig).unwrap();
        assert!(connecting
            .transition_to(SessionStatus::AwaitingConfig)
            .is_err());
        connecting.apply_config(payload("hi")).unwrap();
        connecting.attach_upstream(adapter()).unwrap();
        assert_eq!(connecting.status(), SessionStatus::Connecting);

        connecting.begin_closing().await;
        connecting.begin_closing().await;
        assert_eq!(connecting.status(), SessionStatus::Closing);
        connecting.finish_closed();
        connecting.finish_closed();
        assert_eq!(connecting.status(), SessionStatus::Closed);
        assert!(connecting.upstream().is_none());
    }
}
