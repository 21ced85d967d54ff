use std::time::Duration;

use thiserror::Error;

use crate::session::SessionStatus;

/// WebSocket close code sent when the first client frame is not a config frame.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code sent when the upstream side fails.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// The client broke the session handshake contract.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("configuration required first (received {received})")]
    ConfigRequired { received: String },

    #[error("configuration already applied")]
    ConfigAlreadyApplied,

    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// One frame that could not be decoded. Never fatal to a pump.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DecodeError {
    pub reason: String,
    pub raw: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// The raw payload cut down to something safe to put in a log line.
    pub fn raw_preview(&self) -> &str {
        const MAX_PREVIEW: usize = 256;
        if self.raw.len() <= MAX_PREVIEW {
            return &self.raw;
        }
        let mut end = MAX_PREVIEW;
        while !self.raw.is_char_boundary(end) {
            end -= 1;
        }
        &self.raw[..end]
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("upstream refused connection: {0}")]
    Refused(String),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream rejected setup: {0}")]
    HandshakeRejected(String),

    #[error("failed to send setup: {0}")]
    SetupFailed(String),

    #[error("upstream closed during handshake")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("upstream send failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("upstream receive failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error("Gateway server error: {0}")]
    ServerError(String),
}

impl GatewayError {
    /// Close code the client connection should receive for this failure.
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::Protocol(ProtocolError::ConfigRequired { .. }) => CLOSE_POLICY_VIOLATION,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}
