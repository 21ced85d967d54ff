use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::SessionStatus;

/// Read-only view of a live session, as stored in the registry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: u64,
    client_id: String,
    created_at: DateTime<Utc>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: u64,
        client_id: String,
        created_at: DateTime<Utc>,
        status: watch::Receiver<SessionStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            client_id,
            created_at,
            status,
            cancel,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Ask the owning coordinator to tear the session down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session reaches `Closed`. Returns false on timeout.
    pub async fn wait_closed(&self, limit: Duration) -> bool {
        let mut status = self.status.clone();
        let reached = timeout(limit, status.wait_for(|s| *s == SessionStatus::Closed))
            .await
            .map(|result| result.is_ok());
        match reached {
            Ok(true) => true,
            // Sender dropped: the session is gone, which only happens after Closed.
            Ok(false) => *status.borrow() == SessionStatus::Closed,
            Err(_) => false,
        }
    }
}

/// Live sessions keyed by client id.
///
/// Registering a client id that is already present replaces the older entry
/// (last writer wins). The older session keeps running until its own
/// connection ends, but can no longer be looked up.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its client id. Returns the entry it replaced.
    pub async fn put(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let client_id = handle.client_id.clone();
        let previous = sessions.insert(client_id.clone(), handle);
        if let Some(previous) = &previous {
            warn!(
                client_id = %client_id,
                replaced_session = previous.session_id,
                "Client id already registered; replacing entry"
            );
        }
        previous
    }

    /// Remove whatever is registered under `client_id`. Removing an absent
    /// entry is a no-op.
    pub async fn remove(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(client_id)
    }

    /// Remove `handle`'s entry only if it has not been replaced since.
    pub async fn release(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let owned = sessions
            .get(&handle.client_id)
            .is_some_and(|current| current.session_id == handle.session_id);
        if owned {
            sessions.remove(&handle.client_id);
            debug!(client_id = %handle.client_id, session_id = handle.session_id, "Session released");
        }
        owned
    }

    pub async fn get(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().await.contains_key(client_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All registered sessions, ordered by client id.
    pub async fn list(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        let mut handles: Vec<SessionHandle> = sessions.values().cloned().collect();
        handles.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        handles
    }

    /// Request teardown of every registered session.
    pub async fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.cancel();
        }
        sessions.len()
    }
}
