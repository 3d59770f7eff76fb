//! Session lifecycle states
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Authenticating ─▶ Active ◀──▶ Degraded
//!      ▲              ▲               │             │            │
//!      │              │               │ (rejected)  │ (gap)      │ (N+2 missed)
//!      │              │               ▼             ▼            ▼
//!      └──────────────┴────────── Reconnecting ◀─────────────────┘
//! ```
//!
//! `Disconnected` is both the initial state and the terminal state after
//! shutdown or a fatal login rejection.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    /// Transport connect in flight
    Connecting,
    /// Login (and optional settlement confirm) in flight
    Authenticating,
    Active,
    /// Heartbeat acks missing; still connected
    Degraded,
    /// Transport torn down, waiting for the backoff timer
    Reconnecting,
}

impl SessionState {
    /// A transport is held in this state
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticating | SessionState::Active | SessionState::Degraded
        )
    }

    /// Heartbeats run in this state
    #[inline]
    pub fn is_logged_in(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Active => "ACTIVE",
            SessionState::Degraded => "DEGRADED",
            SessionState::Reconnecting => "RECONNECTING",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
