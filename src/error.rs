//! Gateway error taxonomy
//!
//! Only synchronously-known failures are returned from facade calls.
//! Exchange outcomes (rejections, fills, disconnects) arrive on the event
//! stream instead.

use thiserror::Error;

use crate::codec::DecodingError;
use crate::config::ConfigError;
use crate::messages::RejectReason;
use crate::session::SessionState;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    // === Caller Errors ===
    #[error("Validation failed: {0}")]
    Validation(RejectReason),

    #[error("Session not ready (state {0})")]
    SessionNotReady(SessionState),

    // === Recoverable (handled by the session, surfaced for diagnostics) ===
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodingError),

    // === Fatal ===
    #[error("Fatal session error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // === Facade ===
    #[error("Command queue full")]
    QueueFull,

    #[error("Gateway stopped")]
    Stopped,

    #[error("Gateway already started")]
    AlreadyStarted,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

impl GatewayError {
    /// Stable error code for logs and callers
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::SessionNotReady(_) => "SESSION_NOT_READY",
            GatewayError::Transport(_) => "TRANSPORT",
            GatewayError::Protocol(_) => "PROTOCOL",
            GatewayError::Fatal(_) => "FATAL",
            GatewayError::Config(_) => "CONFIG",
            GatewayError::QueueFull => "QUEUE_FULL",
            GatewayError::Stopped => "STOPPED",
            GatewayError::AlreadyStarted => "ALREADY_STARTED",
            GatewayError::Timeout(_) => "TIMEOUT",
        }
    }

    /// Caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::SessionNotReady(_)
                | GatewayError::QueueFull
                | GatewayError::Transport(_)
                | GatewayError::Timeout(_)
        )
    }
}

impl From<RejectReason> for GatewayError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::SessionNotReady => GatewayError::SessionNotReady(SessionState::Disconnected),
            other => GatewayError::Validation(other),
        }
    }
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::Config(e.to_string())
    }
}
