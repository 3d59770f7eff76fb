//! Session - one authenticated connection lifecycle to the exchange
//!
//! [`Session`] is a synchronous state machine with no I/O of its own. The
//! gateway worker feeds it connect results, inbound frames and clock ticks,
//! and executes the [`SessionOutput`]s it queues (connect, send, close).
//! Every method takes `now` so timing behaviour is deterministic under test.

mod machine;
mod state;

pub use machine::{Session, SessionOutput};
pub use state::SessionState;

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::transport::Endpoint;

/// Login identity
#[derive(Clone, Default)]
pub struct Credentials {
    pub broker_id: String,
    pub user_id: String,
    pub password: String,
    pub app_id: String,
    pub auth_code: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("broker_id", &self.broker_id)
            .field("user_id", &self.user_id)
            .field("password", &"***")
            .field("app_id", &self.app_id)
            .field("auth_code", &"***")
            .finish()
    }
}

/// Session tuning. Built from [`AppConfig`](crate::config::AppConfig) or
/// directly in tests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Send a settlement confirm after login and wait for its ack
    pub confirm_settlement: bool,

    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    /// Wait for one heartbeat ack before counting it missed
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound of one transport receive wait
    pub receive_timeout: Duration,
    /// Upper bound of one frame write; expiry drops the connection
    pub send_timeout: Duration,
    pub reconcile_timeout: Duration,

    /// Consecutive misses that move Active to Degraded
    pub missed_before_degraded: u32,
    /// Further misses after that before reconnecting
    pub extra_missed_before_reconnect: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,

    pub max_frame_bytes: usize,
    /// Malformed frames tolerated in a row; the next one forces a reconnect
    pub max_consecutive_protocol_errors: u32,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            confirm_settlement: false,
            connect_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            receive_timeout: Duration::from_millis(500),
            send_timeout: Duration::from_secs(2),
            reconcile_timeout: Duration::from_secs(10),
            missed_before_degraded: 3,
            extra_missed_before_reconnect: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_consecutive_protocol_errors: 5,
        }
    }

    /// Misses that force a reconnect (N + 2 by default)
    pub fn missed_before_reconnect(&self) -> u32 {
        self.missed_before_degraded + self.extra_missed_before_reconnect
    }
}

/// Snapshot published to the facade after every worker step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Reconciliation burst outstanding; submissions are refused
    pub reconciling: bool,
    /// ULID of the current connection, for log correlation
    pub session_id: Option<String>,
    pub trading_day: String,
    /// Set once the session stopped for good on a fatal error
    pub fatal: Option<String>,
    pub terminated: bool,
}

impl SessionStatus {
    /// Accepting new orders
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Active && !self.reconciling
    }
}
