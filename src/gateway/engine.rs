//! Engine - the single sequential consumer
//!
//! Owns the session, the order ledger and the market-data subscriptions.
//! Every input (client command, inbound frame, timer, transport result) is
//! applied here in arrival order; the resulting I/O and events come out as
//! [`Action`]s for the worker. No I/O and no locks, so the whole protocol
//! can be driven step by step in tests.
//!
//! ```text
//! Command ─┐                         ┌─▶ Connect / Send / Close
//! Frame   ─┼─▶ Session ─▶ dispatch ──┤
//! Tick    ─┘      ▲        │         └─▶ Emit(GatewayEvent)
//!                 └─ ledger outbox ◀─┘
//! ```

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{Payload, WireMessage};
use crate::core_types::ClientOrderId;
use crate::ledger::OrderLedger;
use crate::market::MarketData;
use crate::messages::{GatewayEvent, OrderEvent, RejectReason};
use crate::models::{Fill, OrderRequest, OrderStatus};
use crate::session::{Session, SessionOutput, SessionStatus};
use crate::transport::TransportError;

/// Client intent handed from the facade to the worker
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit {
        id: ClientOrderId,
        request: OrderRequest,
    },
    Cancel {
        id: ClientOrderId,
    },
    Subscribe(String),
    Unsubscribe(String),
    QueryAccount,
    Shutdown,
}

/// Work for the worker, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect,
    Send(WireMessage),
    Close,
    Emit(GatewayEvent),
}

/// Order status view read by the facade for synchronous cancel checks
pub type OrderView = Arc<DashMap<ClientOrderId, OrderStatus>>;

pub struct Engine {
    session: Session,
    ledger: OrderLedger,
    market: MarketData,
    order_view: OrderView,
    actions: Vec<Action>,
}

impl Engine {
    pub fn new(session: Session, ledger: OrderLedger, market: MarketData, order_view: OrderView) -> Self {
        Self {
            session,
            ledger,
            market,
            order_view,
            actions: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn is_terminated(&self) -> bool {
        self.session.is_terminated()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.session.next_deadline()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ============================================================
    // INPUTS
    // ============================================================

    pub fn start(&mut self, now: Instant) {
        self.session.start(now);
        self.pump(now);
    }

    pub fn handle_command(&mut self, now: Instant, command: Command) {
        match command {
            Command::Submit { id, request } => {
                if !self.session.is_ready() {
                    // State changed between the facade check and now
                    self.ledger
                        .reject_submission(id, &request, RejectReason::SessionNotReady);
                } else if let Err(reason) = self.ledger.record_submission(id, &request) {
                    if self.ledger.get(id).is_none() {
                        self.ledger.reject_submission(id, &request, reason);
                    }
                }
            }
            Command::Cancel { id } => {
                if !self.session.is_ready() {
                    self.ledger.reject_cancel(id, RejectReason::SessionNotReady);
                } else if let Err(reason) = self.ledger.cancel(id) {
                    self.ledger.reject_cancel(id, reason);
                }
            }
            Command::Subscribe(instrument) => {
                if let Some(request) = self.market.subscribe(&instrument) {
                    if self.session.state().is_logged_in() {
                        self.session.send(request);
                    } else {
                        tracing::info!(instrument = %instrument, "Subscription deferred until login");
                    }
                }
            }
            Command::Unsubscribe(instrument) => {
                if let Some(request) = self.market.unsubscribe(&instrument) {
                    if self.session.state().is_logged_in() {
                        self.session.send(request);
                    }
                }
            }
            Command::QueryAccount => {
                if self.session.state().is_logged_in() {
                    self.session.send(Payload::AccountQuery {});
                } else {
                    tracing::debug!(state = %self.session.state(), "Account query dropped");
                }
            }
            Command::Shutdown => self.session.shutdown(now),
        }
        self.pump(now);
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.session.on_connected(now);
        self.pump(now);
    }

    pub fn on_connect_failed(&mut self, now: Instant, err: &TransportError) {
        self.session.on_connect_failed(now, err);
        self.pump(now);
    }

    pub fn on_transport_error(&mut self, now: Instant, err: &TransportError) {
        self.session.on_transport_error(now, err);
        self.pump(now);
    }

    pub fn on_send_failed(&mut self, now: Instant, err: &TransportError) {
        self.session.on_send_failed(now, err);
        self.pump(now);
    }

    pub fn on_frame(&mut self, now: Instant, frame: &[u8]) {
        if let Some(payload) = self.session.on_frame(now, frame) {
            self.dispatch(payload);
        }
        self.pump(now);
    }

    pub fn on_tick(&mut self, now: Instant) {
        self.session.on_tick(now);
        for id in self.ledger.evict_expired(now) {
            self.order_view.remove(&id);
        }
        self.pump(now);
    }

    /// Route an in-sequence application message
    fn dispatch(&mut self, payload: Payload) {
        match payload {
            Payload::OrderAck {
                client_order_id,
                exchange_order_id,
                accepted,
                error_code,
                error_msg,
            } => self.ledger.on_order_ack(
                client_order_id,
                exchange_order_id,
                accepted,
                error_code,
                error_msg,
            ),
            Payload::CancelAck {
                client_order_id,
                success,
                error_code,
                error_msg,
            } => self
                .ledger
                .on_cancel_ack(client_order_id, success, error_code, error_msg),
            Payload::FillReport {
                client_order_id,
                exchange_order_id,
                trade_id,
                quantity,
                price,
                timestamp_ms,
            } => self.ledger.on_fill(Fill {
                client_order_id,
                exchange_order_id,
                trade_id,
                quantity,
                price,
                timestamp_ms,
            }),
            Payload::OrderStatusReport {
                client_order_id,
                exchange_order_id,
                status,
                filled_qty,
            } => self
                .ledger
                .on_status_report(client_order_id, exchange_order_id, status, filled_qty),
            Payload::SubscribeAck {
                instrument,
                success,
                error_msg,
            } => self.market.on_subscribe_ack(instrument, success, error_msg),
            Payload::UnsubscribeAck { instrument } => self.market.on_unsubscribe_ack(instrument),
            Payload::MarketData {
                depth,
                trading_day,
                prev_close,
                upper_limit,
                lower_limit,
            } => self
                .market
                .on_market_data(depth, trading_day, prev_close, upper_limit, lower_limit),
            Payload::AccountReport { balance } => {
                tracing::info!(
                    account_id = %balance.account_id,
                    balance = %balance.balance,
                    available = %balance.available,
                    "Account report"
                );
                self.actions.push(Action::Emit(GatewayEvent::Account(balance)));
            }
            other => {
                tracing::warn!(msg_type = other.msg_type(), "Unexpected inbound message dropped");
            }
        }
    }

    // ============================================================
    // OUTPUT PUMP
    // ============================================================

    /// Move session outputs, ledger outbox and events into `actions` until
    /// nothing is left. Ledger sends go through the session so they get
    /// sequence numbers.
    fn pump(&mut self, now: Instant) {
        loop {
            let outputs = self.session.drain_outputs();
            let outbox = self.ledger.drain_outbox();
            if outputs.is_empty() && outbox.is_empty() {
                break;
            }

            for output in outputs {
                match output {
                    SessionOutput::Connect => self.actions.push(Action::Connect),
                    SessionOutput::Send(msg) => self.actions.push(Action::Send(msg)),
                    SessionOutput::Close => self.actions.push(Action::Close),
                    SessionOutput::Transition(event) => {
                        self.flush_events();
                        self.actions.push(Action::Emit(GatewayEvent::Session(event)));
                    }
                    SessionOutput::LoggedIn { resumed } => {
                        if let Some(request) = self.market.on_login() {
                            self.session.send(request);
                        }
                        if resumed && self.ledger.begin_reconciliation() > 0 {
                            self.session.begin_reconciliation(now);
                        }
                    }
                    SessionOutput::ConnectionLost => self.ledger.mark_all_unknown(),
                    SessionOutput::ReconcileExpired => self.ledger.abandon_reconciliation(),
                    SessionOutput::Fatal(reason) => {
                        tracing::error!(reason = %reason, "Session stopped");
                    }
                }
            }

            for payload in outbox {
                let msg_type = payload.msg_type();
                if self.session.send(payload).is_none() {
                    tracing::warn!(msg_type, "Ledger message dropped, no transport");
                }
            }
        }

        if self.session.is_reconciling() && !self.ledger.is_reconciling() {
            self.session.finish_reconciliation();
        }
        self.flush_events();
    }

    fn flush_events(&mut self) {
        for event in self.ledger.drain_events() {
            self.publish_order_status(&event);
            self.actions.push(Action::Emit(GatewayEvent::Order(event)));
        }
        for event in self.market.drain_events() {
            self.actions.push(Action::Emit(GatewayEvent::Market(event)));
        }
    }

    fn publish_order_status(&self, event: &OrderEvent) {
        let id = event.client_order_id();
        if let Some(order) = self.ledger.get(id) {
            self.order_view.insert(id, order.status);
        }
    }
}

// ============================================================
// TESTS
// ============================================================
