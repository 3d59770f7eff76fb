//! Order Ledger - authoritative record of every order's lifecycle
//!
//! Owned by the gateway worker; never shared. Client intent arrives as
//! `submit` / `cancel`, exchange truth as acks, fills and status reports.
//! Each call queues its outbound messages in an outbox and its state
//! transitions as [`OrderEvent`]s, both drained by the worker in order.
//!
//! # Order Lifecycle
//!
//! ```text
//! PendingSubmit ──ack──▶ Working ──fill (remaining 0)──▶ Filled
//!       │                  │  ▲
//!       │ reject           │  └─ fill (remaining > 0)
//!       ▼                  └──cancel ack──▶ Cancelled
//!    Rejected
//!
//! any non-terminal ──reconnect──▶ Unknown ──status report / fills──▶ ...
//! ```
//!
//! A Cancelled or Rejected report claiming more executed quantity than
//! recorded leaves the order Unknown until the trade replay brings the
//! missing fills (or reconciliation is abandoned), so no execution is lost.
//!
//! # Idempotence
//!
//! Fills are keyed by trade ID per order: a replayed fill (e.g. from the
//! post-reconnect trade query) is recognised and discarded. Acks for an
//! order already past the acked state are discarded. Terminal orders stay
//! for the retention window so late duplicates still find them.

use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::codec::{Payload, ReportedStatus};
use crate::core_types::{ClientOrderId, ExchangeOrderId, Quantity};
use crate::instrument::InstrumentManager;
use crate::messages::{OrderEvent, RejectReason};
use crate::models::{Fill, Order, OrderRequest, OrderStatus};

// ============================================================
// ID GENERATOR
// ============================================================

/// Client order ID source, shared by the facade and the ledger
#[derive(Debug)]
pub struct OrderIdGenerator {
    next: AtomicU64,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn next_id(&self) -> ClientOrderId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for OrderIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// LEDGER
// ============================================================

pub struct OrderLedger {
    instruments: Arc<InstrumentManager>,
    ids: Arc<OrderIdGenerator>,
    orders: FxHashMap<ClientOrderId, Order>,
    by_exchange_id: FxHashMap<ExchangeOrderId, ClientOrderId>,
    /// Terminal orders in the order they became terminal
    terminal_since: VecDeque<(Instant, ClientOrderId)>,
    retention: Duration,
    /// Orders still owing a status report; `None` when not reconciling
    pending_reports: Option<FxHashSet<ClientOrderId>>,
    /// Terminal reports held back until the trade replay covers the
    /// executed quantity they claim
    deferred_terminal: FxHashMap<ClientOrderId, (ReportedStatus, Quantity)>,
    events: Vec<OrderEvent>,
    outbox: Vec<Payload>,
}

impl OrderLedger {
    pub fn new(
        instruments: Arc<InstrumentManager>,
        ids: Arc<OrderIdGenerator>,
        retention: Duration,
    ) -> Self {
        Self {
            instruments,
            ids,
            orders: FxHashMap::default(),
            by_exchange_id: FxHashMap::default(),
            terminal_since: VecDeque::new(),
            retention,
            pending_reports: None,
            deferred_terminal: FxHashMap::default(),
            events: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn get(&self, id: ClientOrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Orders not yet in a terminal state
    pub fn open_orders(&self) -> usize {
        self.orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    pub fn drain_events(&mut self) -> Vec<OrderEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_outbox(&mut self) -> Vec<Payload> {
        std::mem::take(&mut self.outbox)
    }

    // ============================================================
    // CLIENT INTENT
    // ============================================================

    /// Allocate an ID, record the order as PendingSubmit and queue the insert
    pub fn submit(&mut self, request: &OrderRequest) -> Result<ClientOrderId, RejectReason> {
        self.instruments.validate_order(request)?;
        let id = self.ids.next_id();
        self.record_submission(id, request)?;
        Ok(id)
    }

    /// Record an order whose ID was allocated by the facade
    pub fn record_submission(
        &mut self,
        id: ClientOrderId,
        request: &OrderRequest,
    ) -> Result<(), RejectReason> {
        let instrument_id = self.instruments.validate_order(request)?;
        if self.orders.contains_key(&id) {
            tracing::error!(client_order_id = id, "Client order ID reused");
            return Err(RejectReason::UnknownOrder);
        }

        let order = Order::new(id, instrument_id, request, Utc::now());
        self.outbox.push(Payload::OrderInsert {
            client_order_id: id,
            instrument: order.instrument.clone(),
            side: order.side,
            price_type: order.price_type,
            offset: order.offset,
            price: order.price,
            quantity: order.quantity,
        });
        tracing::info!(
            client_order_id = id,
            instrument = %order.instrument,
            side = ?order.side,
            price = %order.price,
            quantity = order.quantity,
            strategy_id = order.strategy_id,
            "Order submitted"
        );
        self.orders.insert(id, order);
        self.events.push(OrderEvent::Submitted {
            client_order_id: id,
        });
        Ok(())
    }

    /// Record an order that never reached the exchange as Rejected
    pub fn reject_submission(&mut self, id: ClientOrderId, request: &OrderRequest, reason: RejectReason) {
        let instrument_id = self.instruments.get_id(&request.instrument).unwrap_or_default();
        let mut order = Order::new(id, instrument_id, request, Utc::now());
        order.status = OrderStatus::Rejected;
        tracing::warn!(client_order_id = id, reason = %reason, "Order rejected before send");
        self.orders.insert(id, order);
        self.terminal_since.push_back((Instant::now(), id));
        self.events.push(OrderEvent::Rejected {
            client_order_id: id,
            reason,
        });
    }

    /// Queue a cancel; the order is untouched until the exchange answers
    pub fn cancel(&mut self, id: ClientOrderId) -> Result<(), RejectReason> {
        let order = self.orders.get_mut(&id).ok_or(RejectReason::UnknownOrder)?;
        if order.status.is_terminal() {
            return Err(RejectReason::OrderTerminal);
        }
        order.cancel_requested = true;
        self.outbox.push(Payload::CancelRequest {
            client_order_id: id,
            exchange_order_id: order.exchange_order_id.clone(),
        });
        tracing::info!(client_order_id = id, status = %order.status, "Cancel requested");
        Ok(())
    }

    /// A cancel that could not be sent; the order keeps its state
    pub fn reject_cancel(&mut self, id: ClientOrderId, reason: RejectReason) {
        tracing::warn!(client_order_id = id, reason = %reason, "Cancel rejected locally");
        self.events.push(OrderEvent::CancelRejected {
            client_order_id: id,
            reason,
        });
    }

    // ============================================================
    // EXCHANGE TRUTH
    // ============================================================

    pub fn on_order_ack(
        &mut self,
        id: ClientOrderId,
        exchange_order_id: Option<ExchangeOrderId>,
        accepted: bool,
        error_code: i32,
        error_msg: String,
    ) {
        let Some(order) = self.orders.get_mut(&id) else {
            tracing::debug!(client_order_id = id, "Ack for unknown order dropped");
            return;
        };
        if !matches!(order.status, OrderStatus::PendingSubmit | OrderStatus::Unknown) {
            tracing::debug!(client_order_id = id, status = %order.status, "Duplicate order ack dropped");
            return;
        }

        if accepted {
            let exchange_order_id = exchange_order_id.unwrap_or_default();
            order.status = OrderStatus::Working;
            order.exchange_order_id = Some(exchange_order_id.clone());
            self.by_exchange_id.insert(exchange_order_id.clone(), id);
            tracing::info!(client_order_id = id, exchange_order_id = %exchange_order_id, "Order accepted");
            self.events.push(OrderEvent::Accepted {
                client_order_id: id,
                exchange_order_id,
            });
        } else {
            order.status = OrderStatus::Rejected;
            let reason = RejectReason::Exchange {
                code: error_code,
                message: error_msg,
            };
            tracing::warn!(client_order_id = id, reason = %reason, "Order rejected by exchange");
            self.terminal_since.push_back((Instant::now(), id));
            self.events.push(OrderEvent::Rejected {
                client_order_id: id,
                reason,
            });
            self.report_received(id);
        }
    }

    pub fn on_fill(&mut self, fill: Fill) {
        let id = if self.orders.contains_key(&fill.client_order_id) {
            fill.client_order_id
        } else if let Some(&id) = self.by_exchange_id.get(&fill.exchange_order_id) {
            id
        } else {
            tracing::warn!(
                client_order_id = fill.client_order_id,
                exchange_order_id = %fill.exchange_order_id,
                trade_id = %fill.trade_id,
                "Fill for unknown order dropped"
            );
            return;
        };
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };

        if order.has_fill(&fill.trade_id) {
            tracing::debug!(client_order_id = id, trade_id = %fill.trade_id, "Duplicate fill dropped");
            return;
        }
        if order.status.is_terminal() {
            tracing::warn!(
                client_order_id = id,
                trade_id = %fill.trade_id,
                status = %order.status,
                "Fill for terminal order dropped"
            );
            return;
        }

        // A fill implies the ack, which may have been lost
        if order.status == OrderStatus::PendingSubmit {
            order.status = OrderStatus::Working;
            order.exchange_order_id = Some(fill.exchange_order_id.clone());
            self.by_exchange_id.insert(fill.exchange_order_id.clone(), id);
            self.events.push(OrderEvent::Accepted {
                client_order_id: id,
                exchange_order_id: fill.exchange_order_id.clone(),
            });
        } else if order.exchange_order_id.is_none() {
            order.exchange_order_id = Some(fill.exchange_order_id.clone());
            self.by_exchange_id.insert(fill.exchange_order_id.clone(), id);
        }

        let event_fill = fill.clone();
        if let Err(e) = order.apply_fill(fill) {
            tracing::warn!(client_order_id = id, trade_id = %event_fill.trade_id, error = %e, "Fill discarded");
            return;
        }
        tracing::info!(
            client_order_id = id,
            trade_id = %event_fill.trade_id,
            quantity = event_fill.quantity,
            price = %event_fill.price,
            remaining = order.remaining,
            "Fill applied"
        );

        if order.remaining == 0 {
            order.status = OrderStatus::Filled;
            order.cancel_requested = false;
            self.deferred_terminal.remove(&id);
            let avg_price = order.avg_fill_price().unwrap_or(event_fill.price);
            self.terminal_since.push_back((Instant::now(), id));
            self.events.push(OrderEvent::Filled {
                client_order_id: id,
                fill: event_fill,
                avg_price,
            });
            self.report_received(id);
        } else {
            let filled = order.filled_qty();
            self.events.push(OrderEvent::PartiallyFilled {
                client_order_id: id,
                fill: event_fill,
                remaining: order.remaining,
            });
            if self
                .deferred_terminal
                .get(&id)
                .is_some_and(|&(_, reported)| filled >= reported)
            {
                self.settle_deferred(id);
            }
        }
    }

    pub fn on_cancel_ack(&mut self, id: ClientOrderId, success: bool, error_code: i32, error_msg: String) {
        let Some(order) = self.orders.get_mut(&id) else {
            tracing::debug!(client_order_id = id, "Cancel ack for unknown order dropped");
            return;
        };
        if order.status.is_terminal() {
            tracing::debug!(client_order_id = id, status = %order.status, "Cancel ack for terminal order dropped");
            return;
        }
        order.cancel_requested = false;

        if success {
            order.status = OrderStatus::Cancelled;
            let unfilled_qty = order.remaining;
            tracing::info!(client_order_id = id, unfilled_qty, "Order cancelled");
            self.terminal_since.push_back((Instant::now(), id));
            self.events.push(OrderEvent::Cancelled {
                client_order_id: id,
                unfilled_qty,
            });
            self.report_received(id);
        } else {
            let reason = RejectReason::Exchange {
                code: error_code,
                message: error_msg,
            };
            tracing::warn!(client_order_id = id, reason = %reason, "Cancel rejected");
            self.events.push(OrderEvent::CancelRejected {
                client_order_id: id,
                reason,
            });
        }
    }

    /// Status report answering a reconciliation query.
    ///
    /// Remaining quantity is only ever reduced by fills; a report claiming
    /// more executions than recorded waits for the trade replay.
    pub fn on_status_report(
        &mut self,
        id: ClientOrderId,
        exchange_order_id: Option<ExchangeOrderId>,
        status: ReportedStatus,
        filled_qty: Quantity,
    ) {
        let Some(order) = self.orders.get_mut(&id) else {
            tracing::debug!(client_order_id = id, "Status report for unknown order dropped");
            return;
        };
        if order.status.is_terminal() {
            tracing::debug!(client_order_id = id, status = %order.status, "Status report for terminal order dropped");
            self.report_received(id);
            return;
        }

        if let Some(ex_id) = exchange_order_id.filter(|s| !s.is_empty()) {
            if order.exchange_order_id.is_none() {
                self.by_exchange_id.insert(ex_id.clone(), id);
                order.exchange_order_id = Some(ex_id);
            }
        }
        if filled_qty > order.filled_qty() {
            tracing::warn!(
                client_order_id = id,
                reported = filled_qty,
                recorded = order.filled_qty(),
                "Exchange reports unrecorded fills, awaiting trade replay"
            );
            if matches!(
                status,
                ReportedStatus::Cancelled | ReportedStatus::Rejected | ReportedStatus::NotFound
            ) {
                self.deferred_terminal.insert(id, (status, filled_qty));
                return;
            }
        }
        self.apply_reported(id, status);
        self.report_received(id);
    }

    /// Move an order to the status the exchange reported
    fn apply_reported(&mut self, id: ClientOrderId, status: ReportedStatus) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        match status {
            ReportedStatus::Working | ReportedStatus::Filled => {
                if order.status != OrderStatus::Working {
                    order.status = OrderStatus::Working;
                    tracing::info!(client_order_id = id, remaining = order.remaining, "Order reconciled as working");
                    self.events.push(OrderEvent::Reconciled {
                        client_order_id: id,
                        status: OrderStatus::Working,
                        remaining: order.remaining,
                    });
                }
            }
            ReportedStatus::Cancelled => {
                order.status = OrderStatus::Cancelled;
                order.cancel_requested = false;
                let unfilled_qty = order.remaining;
                tracing::info!(client_order_id = id, unfilled_qty, "Order reconciled as cancelled");
                self.terminal_since.push_back((Instant::now(), id));
                self.events.push(OrderEvent::Cancelled {
                    client_order_id: id,
                    unfilled_qty,
                });
            }
            ReportedStatus::Rejected | ReportedStatus::NotFound => {
                order.status = OrderStatus::Rejected;
                let reason = if status == ReportedStatus::NotFound {
                    RejectReason::NotFoundAtExchange
                } else {
                    RejectReason::Exchange {
                        code: 0,
                        message: "reported rejected on reconciliation".to_string(),
                    }
                };
                tracing::warn!(client_order_id = id, reason = %reason, "Order reconciled as rejected");
                self.terminal_since.push_back((Instant::now(), id));
                self.events.push(OrderEvent::Rejected {
                    client_order_id: id,
                    reason,
                });
            }
        }
    }

    /// Apply a held-back terminal report once its fills are recorded
    fn settle_deferred(&mut self, id: ClientOrderId) {
        if let Some((status, _)) = self.deferred_terminal.remove(&id) {
            self.apply_reported(id, status);
            self.report_received(id);
        }
    }

    // ============================================================
    // RECONNECT / RECONCILIATION
    // ============================================================

    /// Connection lost: every open order becomes Unknown
    pub fn mark_all_unknown(&mut self) {
        self.pending_reports = None;
        self.deferred_terminal.clear();
        let mut ids: Vec<ClientOrderId> = self
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && o.status != OrderStatus::Unknown)
            .map(|o| o.client_order_id)
            .collect();
        ids.sort_unstable();

        for id in ids {
            if let Some(order) = self.orders.get_mut(&id) {
                let previous = order.status;
                order.status = OrderStatus::Unknown;
                order.cancel_requested = false;
                self.events.push(OrderEvent::StatusUnknown {
                    client_order_id: id,
                    previous,
                });
            }
        }
        tracing::info!(unknown = self.unknown_orders().len(), "Open orders marked unknown");
    }

    fn unknown_orders(&self) -> Vec<ClientOrderId> {
        let mut ids: Vec<ClientOrderId> = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Unknown)
            .map(|o| o.client_order_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Queue one status query per Unknown order plus a trade replay.
    ///
    /// Returns the number of orders queried; zero means nothing to reconcile.
    pub fn begin_reconciliation(&mut self) -> usize {
        let ids = self.unknown_orders();
        if ids.is_empty() {
            self.pending_reports = None;
            return 0;
        }
        for &id in &ids {
            let exchange_order_id = self.orders.get(&id).and_then(|o| o.exchange_order_id.clone());
            self.outbox.push(Payload::OrderStatusQuery {
                client_order_id: id,
                exchange_order_id,
            });
        }
        self.outbox.push(Payload::TradeQuery {});
        tracing::info!(orders = ids.len(), "Reconciliation queries queued");
        let count = ids.len();
        self.pending_reports = Some(ids.into_iter().collect());
        count
    }

    pub fn is_reconciling(&self) -> bool {
        self.pending_reports.is_some()
    }

    /// Stop waiting for reports; unreported orders stay Unknown.
    ///
    /// Held-back terminal reports are applied with the fills recorded so far.
    pub fn abandon_reconciliation(&mut self) {
        let mut deferred: Vec<(ClientOrderId, (ReportedStatus, Quantity))> =
            self.deferred_terminal.drain().collect();
        deferred.sort_unstable_by_key(|&(id, _)| id);
        for (id, (status, reported)) in deferred {
            let recorded = self.orders.get(&id).map(|o| o.filled_qty()).unwrap_or_default();
            tracing::error!(
                client_order_id = id,
                reported,
                recorded,
                "Trade replay missing executions, applying reported status"
            );
            self.apply_reported(id, status);
        }
        if let Some(pending) = self.pending_reports.take() {
            tracing::warn!(unreported = pending.len(), "Reconciliation abandoned");
        }
    }

    fn report_received(&mut self, id: ClientOrderId) {
        let done = match self.pending_reports.as_mut() {
            Some(pending) => {
                pending.remove(&id);
                pending.is_empty()
            }
            None => false,
        };
        if done {
            self.pending_reports = None;
            tracing::info!("All reconciliation reports received");
        }
    }

    // ============================================================
    // RETENTION
    // ============================================================

    /// Drop terminal orders older than the retention window
    pub fn evict_expired(&mut self, now: Instant) -> Vec<ClientOrderId> {
        let mut evicted = Vec::new();
        while let Some(&(since, id)) = self.terminal_since.front() {
            if since + self.retention > now {
                break;
            }
            self.terminal_since.pop_front();
            if let Some(order) = self.orders.remove(&id) {
                if let Some(ex_id) = &order.exchange_order_id {
                    self.by_exchange_id.remove(ex_id);
                }
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), remaining = self.orders.len(), "Evicted terminal orders");
        }
        evicted
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Exchange, Instrument};
    use crate::models::Side;
    use rust_decimal::Decimal;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn ledger() -> OrderLedger {
        let instruments = InstrumentManager::from_instruments([Instrument {
            name: "rb2410".to_string(),
            exchange: Exchange::Shfe,
            tick_size: px("1"),
            lot_size: 1,
            multiplier: 10,
        }])
        .unwrap();
        OrderLedger::new(
            Arc::new(instruments),
            Arc::new(OrderIdGenerator::new()),
            Duration::from_secs(60),
        )
    }

    fn request(qty: Quantity) -> OrderRequest {
        OrderRequest::limit("rb2410", Side::Buy, px("3500"), qty)
    }

    fn fill(id: ClientOrderId, trade_id: &str, qty: Quantity) -> Fill {
        Fill {
            client_order_id: id,
            exchange_order_id: "E1".to_string(),
            trade_id: trade_id.to_string(),
            quantity: qty,
            price: px("3500"),
            timestamp_ms: 0,
        }
    }

    fn accept(l: &mut OrderLedger, id: ClientOrderId) {
        l.on_order_ack(id, Some("E1".to_string()), true, 0, String::new());
    }

    fn check_remaining(l: &OrderLedger, id: ClientOrderId) {
        let o = l.get(id).unwrap();
        assert_eq!(o.remaining, o.quantity - o.filled_qty());
    }

    #[test]
    fn test_submit_queues_insert() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        assert_eq!(id, 1);
        assert_eq!(l.get(id).unwrap().status, OrderStatus::PendingSubmit);
        assert!(matches!(
            l.drain_outbox().as_slice(),
            [Payload::OrderInsert { client_order_id: 1, quantity: 10, .. }]
        ));
        assert_eq!(
            l.drain_events(),
            vec![OrderEvent::Submitted { client_order_id: 1 }]
        );

        assert_eq!(l.submit(&request(0)), Err(RejectReason::InvalidQuantity));
        let unknown = OrderRequest::limit("cu2410", Side::Buy, px("70000"), 1);
        assert_eq!(l.submit(&unknown), Err(RejectReason::UnknownInstrument));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn test_fill_to_completion() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        accept(&mut l, id);
        l.on_fill(fill(id, "T1", 4));
        check_remaining(&l, id);
        l.on_fill(fill(id, "T2", 6));
        check_remaining(&l, id);

        let o = l.get(id).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.remaining, 0);
        assert_eq!(o.fills().len(), 2);

        let events = l.drain_events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[2], OrderEvent::PartiallyFilled { remaining: 6, .. }));
        assert!(matches!(events[3], OrderEvent::Filled { .. }));
    }

    #[test]
    fn test_duplicate_deliveries_are_noops() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        accept(&mut l, id);
        accept(&mut l, id);
        l.on_fill(fill(id, "T1", 4));
        l.on_fill(fill(id, "T1", 4));
        l.on_fill(fill(id, "T1", 4));
        assert_eq!(l.get(id).unwrap().remaining, 6);
        assert_eq!(l.get(id).unwrap().fills().len(), 1);
        // Submitted, Accepted, PartiallyFilled
        assert_eq!(l.drain_events().len(), 3);

        l.on_fill(fill(id, "T2", 6));
        l.drain_events();
        l.on_fill(fill(id, "T2", 6));
        accept(&mut l, id);
        l.on_cancel_ack(id, true, 0, String::new());
        assert!(l.drain_events().is_empty());
        assert_eq!(l.get(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_overfill_discarded() {
        let mut l = ledger();
        let id = l.submit(&request(5)).unwrap();
        accept(&mut l, id);
        l.drain_events();
        l.on_fill(fill(id, "T1", 6));
        assert_eq!(l.get(id).unwrap().remaining, 5);
        assert!(l.drain_events().is_empty());
    }

    #[test]
    fn test_cancel_rules() {
        let mut l = ledger();
        assert_eq!(l.cancel(42), Err(RejectReason::UnknownOrder));

        let id = l.submit(&request(3)).unwrap();
        accept(&mut l, id);
        l.on_fill(fill(id, "T1", 3));
        l.drain_outbox();
        let before = l.get(id).unwrap().clone();
        assert_eq!(l.cancel(id), Err(RejectReason::OrderTerminal));
        let after = l.get(id).unwrap();
        assert_eq!(after.status, before.status);
        assert!(!after.cancel_requested);
        assert!(l.drain_outbox().is_empty());
    }

    #[test]
    fn test_cancel_ack_and_reject() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        accept(&mut l, id);
        l.on_fill(fill(id, "T1", 4));
        l.cancel(id).unwrap();
        assert!(matches!(
            l.drain_outbox().last(),
            Some(Payload::CancelRequest { exchange_order_id: Some(_), .. })
        ));
        l.drain_events();

        l.on_cancel_ack(id, false, 26, "too late".to_string());
        assert_eq!(l.get(id).unwrap().status, OrderStatus::Working);
        assert!(matches!(l.drain_events()[0], OrderEvent::CancelRejected { .. }));

        l.cancel(id).unwrap();
        l.on_cancel_ack(id, true, 0, String::new());
        assert_eq!(
            l.drain_events(),
            vec![OrderEvent::Cancelled {
                client_order_id: id,
                unfilled_qty: 6
            }]
        );
    }

    #[test]
    fn test_exchange_reject() {
        let mut l = ledger();
        let id = l.submit(&request(1)).unwrap();
        l.on_order_ack(id, None, false, 31, "insufficient margin".to_string());
        let o = l.get(id).unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(matches!(
            l.drain_events().last(),
            Some(OrderEvent::Rejected {
                reason: RejectReason::Exchange { code: 31, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_fill_without_ack_implies_accept() {
        let mut l = ledger();
        let id = l.submit(&request(2)).unwrap();
        l.drain_events();
        l.on_fill(fill(id, "T1", 1));
        let events = l.drain_events();
        assert!(matches!(events[0], OrderEvent::Accepted { .. }));
        assert!(matches!(events[1], OrderEvent::PartiallyFilled { .. }));
        assert_eq!(l.get(id).unwrap().exchange_order_id.as_deref(), Some("E1"));
    }

    #[test]
    fn test_reconciliation() {
        let mut l = ledger();
        let working = l.submit(&request(10)).unwrap();
        accept(&mut l, working);
        l.on_fill(fill(working, "T1", 4));
        let pending = l.submit(&request(1)).unwrap();
        let done = l.submit(&request(1)).unwrap();
        l.on_order_ack(done, Some("E9".to_string()), true, 0, String::new());
        l.on_fill(Fill {
            exchange_order_id: "E9".to_string(),
            ..fill(done, "T9", 1)
        });
        l.drain_events();
        l.drain_outbox();

        l.mark_all_unknown();
        assert_eq!(l.get(working).unwrap().status, OrderStatus::Unknown);
        assert_eq!(l.get(pending).unwrap().status, OrderStatus::Unknown);
        assert_eq!(l.get(done).unwrap().status, OrderStatus::Filled);
        assert_eq!(
            l.drain_events(),
            vec![
                OrderEvent::StatusUnknown {
                    client_order_id: working,
                    previous: OrderStatus::Working
                },
                OrderEvent::StatusUnknown {
                    client_order_id: pending,
                    previous: OrderStatus::PendingSubmit
                },
            ]
        );

        assert_eq!(l.begin_reconciliation(), 2);
        let outbox = l.drain_outbox();
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox[2], Payload::TradeQuery {});
        assert!(l.is_reconciling());

        // Trade replay repeats T1, then brings a new fill
        l.on_fill(fill(working, "T1", 4));
        l.on_fill(fill(working, "T2", 2));
        l.on_status_report(working, Some("E1".to_string()), ReportedStatus::Working, 6);
        assert!(l.is_reconciling());
        l.on_status_report(pending, None, ReportedStatus::NotFound, 0);
        assert!(!l.is_reconciling());

        let w = l.get(working).unwrap();
        assert_eq!(w.status, OrderStatus::Working);
        assert_eq!(w.remaining, 4);
        check_remaining(&l, working);
        assert_eq!(l.get(pending).unwrap().status, OrderStatus::Rejected);
        assert!(l.drain_events().contains(&OrderEvent::Rejected {
            client_order_id: pending,
            reason: RejectReason::NotFoundAtExchange
        }));
    }

    #[test]
    fn test_terminal_report_waits_for_trade_replay() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        accept(&mut l, id);
        l.mark_all_unknown();
        l.begin_reconciliation();
        l.drain_events();

        // Cancelled at the exchange after 4 lots traded while we were away
        l.on_status_report(id, Some("E1".to_string()), ReportedStatus::Cancelled, 4);
        assert_eq!(l.get(id).unwrap().status, OrderStatus::Unknown);
        assert!(l.is_reconciling());
        assert!(l.drain_events().is_empty());

        l.on_fill(fill(id, "T1", 4));
        let o = l.get(id).unwrap();
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert_eq!(o.fills().len(), 1);
        assert_eq!(o.remaining, 6);
        check_remaining(&l, id);
        assert!(!l.is_reconciling());
        let events = l.drain_events();
        assert!(matches!(events[0], OrderEvent::PartiallyFilled { remaining: 6, .. }));
        assert_eq!(
            events[1],
            OrderEvent::Cancelled {
                client_order_id: id,
                unfilled_qty: 6
            }
        );
    }

    #[test]
    fn test_terminal_report_applied_when_replay_never_comes() {
        let mut l = ledger();
        let id = l.submit(&request(10)).unwrap();
        accept(&mut l, id);
        l.mark_all_unknown();
        l.begin_reconciliation();
        l.on_status_report(id, None, ReportedStatus::Rejected, 2);
        l.drain_events();

        l.abandon_reconciliation();
        assert_eq!(l.get(id).unwrap().status, OrderStatus::Rejected);
        assert!(matches!(l.drain_events()[..], [OrderEvent::Rejected { .. }]));
        // Replay arriving afterwards finds a terminal order
        l.on_fill(fill(id, "T1", 2));
        assert_eq!(l.get(id).unwrap().remaining, 10);
    }

    #[test]
    fn test_reconciliation_nothing_open() {
        let mut l = ledger();
        l.mark_all_unknown();
        assert_eq!(l.begin_reconciliation(), 0);
        assert!(!l.is_reconciling());
        assert!(l.drain_outbox().is_empty());
    }

    #[test]
    fn test_abandon_leaves_unknown() {
        let mut l = ledger();
        let id = l.submit(&request(1)).unwrap();
        l.mark_all_unknown();
        l.begin_reconciliation();
        l.abandon_reconciliation();
        assert!(!l.is_reconciling());
        assert_eq!(l.get(id).unwrap().status, OrderStatus::Unknown);
        // Unknown orders can still be cancelled
        assert!(l.cancel(id).is_ok());
    }

    #[test]
    fn test_eviction_after_retention() {
        let mut l = ledger();
        let id = l.submit(&request(1)).unwrap();
        l.reject_submission(99, &request(1), RejectReason::SessionNotReady);
        accept(&mut l, id);
        l.on_fill(fill(id, "T1", 1));

        assert!(l.evict_expired(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(l.evict_expired(later), vec![99, id]);
        assert!(l.is_empty());

        // Late duplicate after eviction is dropped quietly
        l.on_fill(fill(id, "T1", 1));
        assert!(l.drain_events().iter().all(|e| !matches!(e, OrderEvent::PartiallyFilled { .. })));
    }
}
