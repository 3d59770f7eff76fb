//! Messages - events surfaced to trading logic
//!
//! Everything exchange-driven reaches the application through one ordered
//! stream of [`GatewayEvent`]s.
//!
//! # Event Flow
//!
//! ```text
//! Transport → Codec → Session ─┬─▶ OrderLedger → OrderEvent ──┐
//!                              ├─▶ MarketEvent ───────────────┼─▶ event stream
//!                              └─▶ SessionEvent / Account ────┘
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{ClientOrderId, ExchangeOrderId, InstrumentId, Quantity};
use crate::models::{Fill, OrderStatus};
use crate::session::SessionState;

// ============================================================
// REJECT REASON
// ============================================================

/// Reason for order or cancel rejection
///
/// Local variants are returned synchronously by the facade; `Exchange`
/// arrives asynchronously as a terminal order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Quantity is zero or not a multiple of the lot size
    InvalidQuantity,
    /// Limit price is not positive or not on the tick grid
    InvalidPrice,
    /// Instrument not present in reference data
    UnknownInstrument,
    /// Client order ID not in the ledger
    UnknownOrder,
    /// Order already Filled, Cancelled or Rejected
    OrderTerminal,
    /// Session left Active before the request reached the exchange
    SessionNotReady,
    /// Exchange never saw the order (reported during reconciliation)
    NotFoundAtExchange,
    /// Business rejection reported by the exchange
    Exchange { code: i32, message: String },
}

impl RejectReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidQuantity => "Invalid quantity",
            Self::InvalidPrice => "Invalid price",
            Self::UnknownInstrument => "Unknown instrument",
            Self::UnknownOrder => "Unknown order",
            Self::OrderTerminal => "Order already in terminal state",
            Self::SessionNotReady => "Session not ready",
            Self::NotFoundAtExchange => "Order not found at exchange",
            Self::Exchange { message, .. } => message,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exchange { code, message } => write!(f, "Exchange rejected ({}): {}", code, message),
            other => f.write_str(other.as_str()),
        }
    }
}

// ============================================================
// ORDER EVENT (状态变更事件)
// ============================================================

/// Order event - one per ledger state transition
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Recorded locally and forwarded to the exchange
    Submitted { client_order_id: ClientOrderId },

    /// Exchange acknowledged the order
    Accepted {
        client_order_id: ClientOrderId,
        exchange_order_id: ExchangeOrderId,
    },

    /// Fill with quantity still open
    PartiallyFilled {
        client_order_id: ClientOrderId,
        fill: Fill,
        remaining: Quantity,
    },

    /// Fill that brought remaining to zero
    Filled {
        client_order_id: ClientOrderId,
        fill: Fill,
        avg_price: Decimal,
    },

    /// Cancel acknowledged
    Cancelled {
        client_order_id: ClientOrderId,
        unfilled_qty: Quantity,
    },

    /// Submit rejected by the exchange or dropped before sending
    Rejected {
        client_order_id: ClientOrderId,
        reason: RejectReason,
    },

    /// Cancel refused; the order keeps its state
    CancelRejected {
        client_order_id: ClientOrderId,
        reason: RejectReason,
    },

    /// Connection was lost; state must be reconciled
    StatusUnknown {
        client_order_id: ClientOrderId,
        previous: OrderStatus,
    },

    /// Reconciliation restored an authoritative status
    Reconciled {
        client_order_id: ClientOrderId,
        status: OrderStatus,
        remaining: Quantity,
    },
}

impl OrderEvent {
    pub fn client_order_id(&self) -> ClientOrderId {
        match self {
            Self::Submitted { client_order_id }
            | Self::Accepted { client_order_id, .. }
            | Self::PartiallyFilled { client_order_id, .. }
            | Self::Filled { client_order_id, .. }
            | Self::Cancelled { client_order_id, .. }
            | Self::Rejected { client_order_id, .. }
            | Self::CancelRejected { client_order_id, .. }
            | Self::StatusUnknown { client_order_id, .. }
            | Self::Reconciled { client_order_id, .. } => *client_order_id,
        }
    }
}

// ============================================================
// MARKET DATA
// ============================================================

/// Number of book levels carried by a depth snapshot
pub const DEPTH_LEVELS: usize = 5;

/// Depth snapshot for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub instrument: String,
    pub update_time_ms: i64,
    pub last: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: u64,
    pub turnover: Decimal,
    pub open_interest: u64,
    /// (price, volume), best first
    pub bids: Vec<(Decimal, u64)>,
    pub asks: Vec<(Decimal, u64)>,
}

/// Per-session static data (first snapshot of the trading day)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticInfo {
    pub instrument: String,
    pub trading_day: String,
    pub prev_close: Decimal,
    pub upper_limit: Decimal,
    pub lower_limit: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Static {
        instrument_id: InstrumentId,
        info: StaticInfo,
    },
    Depth {
        instrument_id: InstrumentId,
        depth: Depth,
    },
    Subscribed {
        instrument: String,
    },
    SubscribeFailed {
        instrument: String,
        reason: String,
    },
    Unsubscribed {
        instrument: String,
    },
}

// ============================================================
// ACCOUNT
// ============================================================

/// Trading account funds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub balance: Decimal,
    pub available: Decimal,
    pub margin: Decimal,
    pub frozen_margin: Decimal,
}

// ============================================================
// SESSION EVENT
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
}

// ============================================================
// GATEWAY EVENT
// ============================================================

/// Single tagged event type delivered on the gateway's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Session(SessionEvent),
    Order(OrderEvent),
    Market(MarketEvent),
    Account(Balance),
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_str() {
        assert_eq!(RejectReason::InvalidQuantity.as_str(), "Invalid quantity");
        assert_eq!(RejectReason::SessionNotReady.to_string(), "Session not ready");
        let ex = RejectReason::Exchange {
            code: 22,
            message: "duplicate order ref".to_string(),
        };
        assert_eq!(ex.as_str(), "duplicate order ref");
        assert_eq!(ex.to_string(), "Exchange rejected (22): duplicate order ref");
    }

    #[test]
    fn test_order_event_id() {
        let ev = OrderEvent::Cancelled {
            client_order_id: 7,
            unfilled_qty: 3,
        };
        assert_eq!(ev.client_order_id(), 7);
    }
}
