//! Session state machine
//!
//! # Timers
//!
//! | Timer            | Armed in        | On expiry                          |
//! |------------------|-----------------|------------------------------------|
//! | login deadline   | Authenticating  | → Reconnecting                     |
//! | heartbeat send   | Active/Degraded | send Heartbeat, re-arm one interval on |
//! | heartbeat ack    | Active/Degraded | missed += 1 (→ Degraded / → Reconnecting) |
//!
//! Heartbeats go out every interval whether or not earlier ones were acked;
//! each probe has its own ack deadline. An ack answers its probe and every
//! older one.
//! | reconcile        | Active          | give up, remaining orders stay Unknown |
//! | reconnect        | Reconnecting    | → Connecting                       |
//!
//! # Sequencing
//!
//! Outbound seq restarts at 1 on every connection (the login request).
//! Inbound seq is anchored by the login response; afterwards each message
//! must carry exactly `last + 1`. Lower values are duplicates and dropped,
//! higher values are a gap and tear the connection down so the post-login
//! reconciliation can resynchronise.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use ulid::Ulid;

use super::{SessionConfig, SessionState, SessionStatus};
use crate::codec::{DecodingError, Payload, WireCodec, WireMessage};
use crate::core_types::SeqNum;
use crate::messages::SessionEvent;
use crate::transport::TransportError;

/// Work queued by the session for the worker to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Open a new transport
    Connect,
    /// Encode and write a message on the current transport
    Send(WireMessage),
    /// Release the current transport (after pending sends)
    Close,
    Transition(SessionEvent),
    /// Login complete; `resumed` when the session went through Reconnecting
    LoggedIn { resumed: bool },
    /// Transport dropped after or during a session; order state is stale
    ConnectionLost,
    /// Reconcile timer fired before every order reported
    ReconcileExpired,
    /// Stopped for good (login rejected, reconnect attempts exhausted)
    Fatal(String),
}

enum SeqCheck {
    InOrder,
    Duplicate,
    Gap { expected: SeqNum },
}

#[derive(Debug, Default)]
struct HeartbeatTracker {
    next_id: u64,
    /// (id, sent_at) of heartbeats awaiting their ack, oldest first
    outstanding: VecDeque<(u64, Instant)>,
    missed: u32,
    next_send_at: Option<Instant>,
}

impl HeartbeatTracker {
    fn reset(&mut self, next_send_at: Option<Instant>) {
        self.outstanding.clear();
        self.missed = 0;
        self.next_send_at = next_send_at;
    }
}

pub struct Session {
    config: SessionConfig,
    codec: WireCodec,
    state: SessionState,
    session_id: Option<Ulid>,
    trading_day: String,
    terminated: bool,
    fatal: Option<String>,

    /// Last seq sent on this connection
    outbound_seq: SeqNum,
    /// Last seq accepted; `None` until the login response
    inbound_seq: Option<SeqNum>,

    heartbeat: HeartbeatTracker,
    login_deadline: Option<Instant>,
    awaiting_settlement: bool,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    /// Next login follows a Reconnecting path
    resumed: bool,
    reconcile_deadline: Option<Instant>,
    protocol_errors: u32,

    outputs: Vec<SessionOutput>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let codec = WireCodec::new(config.max_frame_bytes);
        Self {
            config,
            codec,
            state: SessionState::Disconnected,
            session_id: None,
            trading_day: String::new(),
            terminated: false,
            fatal: None,
            outbound_seq: 0,
            inbound_seq: None,
            heartbeat: HeartbeatTracker::default(),
            login_deadline: None,
            awaiting_settlement: false,
            reconnect_at: None,
            reconnect_attempt: 0,
            resumed: false,
            reconcile_deadline: None,
            protocol_errors: 0,
            outputs: Vec::new(),
        }
    }

    // ============================================================
    // ACCESSORS
    // ============================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconcile_deadline.is_some()
    }

    /// Active with no reconciliation outstanding
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Active && !self.is_reconciling()
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.heartbeat.missed
    }

    pub fn outbound_seq(&self) -> SeqNum {
        self.outbound_seq
    }

    pub fn inbound_seq(&self) -> Option<SeqNum> {
        self.inbound_seq
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            reconciling: self.is_reconciling(),
            session_id: self.session_id.map(|id| id.to_string()),
            trading_day: self.trading_day.clone(),
            fatal: self.fatal.clone(),
            terminated: self.terminated,
        }
    }

    pub fn drain_outputs(&mut self) -> Vec<SessionOutput> {
        std::mem::take(&mut self.outputs)
    }

    /// Earliest instant at which `on_tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(4);
        match self.state {
            SessionState::Authenticating => deadlines.extend(self.login_deadline),
            SessionState::Active | SessionState::Degraded => {
                if let Some(&(_, sent_at)) = self.heartbeat.outstanding.front() {
                    deadlines.push(sent_at + self.config.heartbeat_timeout);
                }
                deadlines.extend(self.heartbeat.next_send_at);
                deadlines.extend(self.reconcile_deadline);
            }
            SessionState::Reconnecting => deadlines.extend(self.reconnect_at),
            SessionState::Disconnected | SessionState::Connecting => {}
        }
        deadlines.into_iter().min()
    }

    // ============================================================
    // LIFECYCLE INPUTS
    // ============================================================

    /// Disconnected → Connecting
    pub fn start(&mut self, _now: Instant) {
        if self.terminated || self.state != SessionState::Disconnected {
            tracing::warn!(state = %self.state, terminated = self.terminated, "Session start ignored");
            return;
        }
        self.set_state(SessionState::Connecting, "start".to_string());
        self.outputs.push(SessionOutput::Connect);
    }

    /// Transport connected: Connecting → Authenticating, send login
    pub fn on_connected(&mut self, now: Instant) {
        if self.state != SessionState::Connecting {
            tracing::warn!(state = %self.state, "Unexpected connect completion");
            self.outputs.push(SessionOutput::Close);
            return;
        }
        let session_id = Ulid::new();
        self.session_id = Some(session_id);
        self.outbound_seq = 0;
        self.inbound_seq = None;
        self.protocol_errors = 0;
        self.login_deadline = Some(now + self.config.login_timeout);
        self.set_state(SessionState::Authenticating, "transport connected".to_string());

        let creds = &self.config.credentials;
        let login = Payload::LoginRequest {
            broker_id: creds.broker_id.clone(),
            user_id: creds.user_id.clone(),
            password: creds.password.clone(),
            app_id: creds.app_id.clone(),
            auth_code: creds.auth_code.clone(),
        };
        tracing::info!(
            session_id = %session_id,
            broker_id = %creds.broker_id,
            user_id = %creds.user_id,
            "Sending login"
        );
        self.send(login);
    }

    pub fn on_connect_failed(&mut self, now: Instant, err: &TransportError) {
        if self.state != SessionState::Connecting {
            return;
        }
        tracing::warn!(error = %err, attempt = self.reconnect_attempt, "Connect failed");
        self.enter_reconnecting(now, format!("connect failed: {}", err));
    }

    /// Receive or close failure on the current transport
    pub fn on_transport_error(&mut self, now: Instant, err: &TransportError) {
        if !self.state.is_connected() {
            return;
        }
        tracing::warn!(error = %err, state = %self.state, "Transport error");
        self.enter_reconnecting(now, format!("transport error: {}", err));
    }

    /// A queued send could not be written
    pub fn on_send_failed(&mut self, now: Instant, err: &TransportError) {
        if err.is_timeout() && (self.state.is_logged_in() || self.state == SessionState::Authenticating) {
            tracing::warn!(error = %err, "Send stalled, reconnecting");
            self.enter_reconnecting(now, format!("send stalled: {}", err));
            return;
        }
        match self.state {
            SessionState::Active => {
                tracing::warn!(error = %err, "Send failed, degrading session");
                self.set_state(SessionState::Degraded, format!("send failed: {}", err));
            }
            SessionState::Authenticating => {
                self.enter_reconnecting(now, format!("login send failed: {}", err));
            }
            _ => {
                tracing::debug!(error = %err, state = %self.state, "Send failed");
            }
        }
    }

    /// Explicit shutdown: logout if logged in, then terminal Disconnected
    pub fn shutdown(&mut self, _now: Instant) {
        if self.terminated {
            return;
        }
        if self.state.is_logged_in() {
            let user_id = self.config.credentials.user_id.clone();
            self.send(Payload::Logout { user_id });
        }
        self.clear_timers();
        self.terminated = true;
        self.set_state(SessionState::Disconnected, "shutdown".to_string());
        self.outputs.push(SessionOutput::Close);
    }

    // ============================================================
    // OUTBOUND
    // ============================================================

    /// Queue a message with the next outbound seq.
    ///
    /// Returns `None` when no transport is held.
    pub fn send(&mut self, payload: Payload) -> Option<SeqNum> {
        if !self.state.is_connected() {
            tracing::debug!(msg_type = payload.msg_type(), state = %self.state, "Send dropped, not connected");
            return None;
        }
        self.outbound_seq += 1;
        let seq = self.outbound_seq;
        self.outputs
            .push(SessionOutput::Send(WireMessage::new(seq, payload)));
        Some(seq)
    }

    // ============================================================
    // INBOUND
    // ============================================================

    /// Decode and sequence-check one inbound frame.
    ///
    /// Session-level messages are consumed here; application messages in
    /// sequence are returned for the ledger / market handlers.
    pub fn on_frame(&mut self, now: Instant, frame: &[u8]) -> Option<Payload> {
        if !self.state.is_connected() {
            tracing::debug!(state = %self.state, "Frame on stale transport dropped");
            return None;
        }

        let msg = match self.codec.decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.on_protocol_error(now, e);
                return None;
            }
        };
        self.protocol_errors = 0;

        match self.check_sequence(msg.seq) {
            SeqCheck::InOrder => {}
            SeqCheck::Duplicate => {
                tracing::debug!(seq = msg.seq, last = ?self.inbound_seq, msg_type = msg.msg_type(), "Duplicate message dropped");
                return None;
            }
            SeqCheck::Gap { expected } => {
                tracing::warn!(expected, got = msg.seq, msg_type = msg.msg_type(), "Inbound sequence gap");
                self.enter_reconnecting(
                    now,
                    format!("sequence gap: expected {} got {}", expected, msg.seq),
                );
                return None;
            }
        }
        if self.inbound_seq.is_some() {
            self.inbound_seq = Some(msg.seq);
        }

        if self.state == SessionState::Authenticating {
            self.on_authenticating_message(now, msg);
            return None;
        }

        match msg.payload {
            Payload::HeartbeatAck { id } => {
                self.on_heartbeat_ack(id);
                None
            }
            Payload::Heartbeat { id } => {
                // Exchange-initiated probe
                self.send(Payload::HeartbeatAck { id });
                None
            }
            Payload::Logout { .. } => {
                self.enter_reconnecting(now, "logged out by exchange".to_string());
                None
            }
            Payload::LoginResponse { .. } | Payload::SettlementConfirmAck { .. } => {
                tracing::warn!(seq = msg.seq, msg_type = msg.payload.msg_type(), "Unexpected login message while logged in");
                None
            }
            payload => Some(payload),
        }
    }

    fn check_sequence(&self, seq: SeqNum) -> SeqCheck {
        match self.inbound_seq {
            None => SeqCheck::InOrder,
            Some(last) if seq <= last => SeqCheck::Duplicate,
            Some(last) if seq == last + 1 => SeqCheck::InOrder,
            Some(last) => SeqCheck::Gap { expected: last + 1 },
        }
    }

    fn on_authenticating_message(&mut self, now: Instant, msg: WireMessage) {
        match msg.payload {
            Payload::LoginResponse {
                success,
                error_code,
                error_msg,
                trading_day,
            } => {
                if !success {
                    tracing::error!(error_code, error_msg = %error_msg, "Login rejected");
                    self.fail(format!("login rejected ({}): {}", error_code, error_msg));
                    return;
                }
                // Inbound numbering starts at the login response
                self.inbound_seq = Some(msg.seq);
                self.trading_day = trading_day;
                tracing::info!(trading_day = %self.trading_day, seq = msg.seq, "Login accepted");

                if self.config.confirm_settlement {
                    self.awaiting_settlement = true;
                    self.login_deadline = Some(now + self.config.login_timeout);
                    let creds = &self.config.credentials;
                    let confirm = Payload::SettlementConfirm {
                        broker_id: creds.broker_id.clone(),
                        investor_id: creds.user_id.clone(),
                    };
                    self.send(confirm);
                } else {
                    self.complete_login(now);
                }
            }
            Payload::SettlementConfirmAck { success, error_msg } if self.awaiting_settlement => {
                if success {
                    tracing::info!("Settlement confirmed");
                    self.complete_login(now);
                } else {
                    tracing::error!(error_msg = %error_msg, "Settlement confirm rejected");
                    self.fail(format!("settlement confirm rejected: {}", error_msg));
                }
            }
            other => {
                tracing::debug!(seq = msg.seq, msg_type = other.msg_type(), "Message before login dropped");
            }
        }
    }

    fn complete_login(&mut self, now: Instant) {
        self.login_deadline = None;
        self.awaiting_settlement = false;
        self.reconnect_attempt = 0;
        self.heartbeat
            .reset(Some(now + self.config.heartbeat_interval));
        let resumed = std::mem::take(&mut self.resumed);
        self.set_state(SessionState::Active, "login complete".to_string());
        self.outputs.push(SessionOutput::LoggedIn { resumed });
    }

    fn on_heartbeat_ack(&mut self, id: u64) {
        let before = self.heartbeat.outstanding.len();
        // An ack also answers every older probe
        self.heartbeat.outstanding.retain(|&(probe, _)| probe > id);
        if self.heartbeat.outstanding.len() == before {
            tracing::debug!(id, "Late heartbeat ack");
        }
        // Any ack proves the peer is alive
        self.heartbeat.missed = 0;
        if self.state == SessionState::Degraded {
            self.set_state(SessionState::Active, "heartbeat ack received".to_string());
        }
    }

    fn on_protocol_error(&mut self, now: Instant, err: DecodingError) {
        self.protocol_errors += 1;
        tracing::warn!(
            error = %err,
            consecutive = self.protocol_errors,
            "Malformed inbound frame dropped"
        );
        if self.protocol_errors > self.config.max_consecutive_protocol_errors {
            let reason = format!("{} consecutive protocol errors", self.protocol_errors);
            self.enter_reconnecting(now, reason);
        }
    }

    // ============================================================
    // TIMERS
    // ============================================================

    pub fn on_tick(&mut self, now: Instant) {
        match self.state {
            SessionState::Authenticating => {
                if self.login_deadline.is_some_and(|d| now >= d) {
                    tracing::warn!(awaiting_settlement = self.awaiting_settlement, "Login timed out");
                    self.enter_reconnecting(now, "login timeout".to_string());
                }
            }
            SessionState::Active | SessionState::Degraded => {
                self.tick_heartbeat(now);
                if self.state.is_logged_in() && self.reconcile_deadline.is_some_and(|d| now >= d) {
                    tracing::warn!("Reconciliation timed out");
                    self.reconcile_deadline = None;
                    self.outputs.push(SessionOutput::ReconcileExpired);
                }
            }
            SessionState::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    self.reconnect_at = None;
                    let reason = format!("reconnect attempt {}", self.reconnect_attempt);
                    tracing::info!(attempt = self.reconnect_attempt, "Reconnecting");
                    self.set_state(SessionState::Connecting, reason);
                    self.outputs.push(SessionOutput::Connect);
                }
            }
            SessionState::Disconnected | SessionState::Connecting => {}
        }
    }

    fn tick_heartbeat(&mut self, now: Instant) {
        while let Some(&(id, sent_at)) = self.heartbeat.outstanding.front() {
            if now < sent_at + self.config.heartbeat_timeout {
                break;
            }
            self.heartbeat.outstanding.pop_front();
            self.heartbeat.missed += 1;
            let missed = self.heartbeat.missed;
            tracing::warn!(id, missed, "Heartbeat ack missed");

            if missed >= self.config.missed_before_reconnect() {
                self.enter_reconnecting(now, format!("{} heartbeats missed", missed));
                return;
            }
            if missed >= self.config.missed_before_degraded && self.state == SessionState::Active {
                self.set_state(SessionState::Degraded, format!("{} heartbeats missed", missed));
            }
        }

        // Fixed cadence, independent of outstanding probes
        if let Some(at) = self.heartbeat.next_send_at.filter(|&at| now >= at) {
            self.heartbeat.next_id += 1;
            let id = self.heartbeat.next_id;
            self.heartbeat.outstanding.push_back((id, now));
            let next = at + self.config.heartbeat_interval;
            self.heartbeat.next_send_at = Some(if next > now { next } else { now + self.config.heartbeat_interval });
            self.send(Payload::Heartbeat { id });
        }
    }

    // ============================================================
    // RECONCILIATION
    // ============================================================

    /// Refuse submissions until `finish_reconciliation` or the timer fires
    pub fn begin_reconciliation(&mut self, now: Instant) {
        self.reconcile_deadline = Some(now + self.config.reconcile_timeout);
        tracing::info!("Reconciliation started");
    }

    pub fn finish_reconciliation(&mut self) {
        if self.reconcile_deadline.take().is_some() {
            tracing::info!("Reconciliation complete");
        }
    }

    // ============================================================
    // TRANSITIONS
    // ============================================================

    fn set_state(&mut self, to: SessionState, reason: String) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(
            from = %from,
            to = %to,
            reason = %reason,
            session_id = ?self.session_id.map(|id| id.to_string()),
            "Session transition"
        );
        self.outputs
            .push(SessionOutput::Transition(SessionEvent { from, to, reason }));
    }

    fn clear_timers(&mut self) {
        self.heartbeat.reset(None);
        self.login_deadline = None;
        self.awaiting_settlement = false;
        self.reconnect_at = None;
        self.reconcile_deadline = None;
    }

    /// Tear down the transport and arm the backoff timer
    fn enter_reconnecting(&mut self, now: Instant, reason: String) {
        self.clear_timers();
        self.inbound_seq = None;
        self.resumed = true;
        self.set_state(SessionState::Reconnecting, reason);
        self.outputs.push(SessionOutput::Close);
        self.outputs.push(SessionOutput::ConnectionLost);

        self.reconnect_attempt += 1;
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempt > max {
                self.fail(format!("reconnect attempts exhausted after {}", max));
                return;
            }
        }
        let delay = self.backoff(self.reconnect_attempt);
        self.reconnect_at = Some(now + delay);
        tracing::info!(attempt = self.reconnect_attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
    }

    /// initial * 2^(attempt-1), capped
    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.config.max_backoff)
    }

    fn fail(&mut self, reason: String) {
        self.clear_timers();
        self.terminated = true;
        self.fatal = Some(reason.clone());
        self.outputs.push(SessionOutput::Close);
        self.set_state(SessionState::Disconnected, reason.clone());
        self.outputs.push(SessionOutput::Fatal(reason));
    }
}

// ============================================================
// TESTS
// ============================================================
