// models.rs - Core order and fill types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{
    ClientOrderId, ExchangeOrderId, InstrumentId, Quantity, StrategyId, TradeId,
};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// Price type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Limit,  // Limit order: must specify price
    Market, // Market order: price ignored by the exchange
}

/// Futures open/close flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offset {
    #[default]
    Open,
    Close,
    /// SHFE/INE distinguish closing today's position
    CloseToday,
}

/// Order status
///
/// `Working` covers partially filled orders as well; the distinction is
/// carried by `remaining` (see [`Order::is_partially_filled`]).
///
/// Terminal states: Filled, Cancelled, Rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingSubmit, // Recorded locally, not yet acknowledged
    Working,       // Acknowledged by the exchange, resting
    Filled,        // remaining == 0
    Cancelled,     // Cancel acknowledged
    Rejected,      // Submit acknowledged with failure
    Unknown,       // Reconnect happened; awaiting reconciliation
}

impl OrderStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingSubmit => "PENDING_SUBMIT",
            OrderStatus::Working => "WORKING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================
// ORDER REQUEST (client intent)
// ============================================================

/// Order request as handed over by trading logic
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub price_type: PriceType,
    pub offset: Offset,
    pub price: Decimal,
    pub quantity: Quantity,
    pub strategy_id: StrategyId,
}

impl OrderRequest {
    /// Create a limit order request (opening a position)
    pub fn limit(instrument: &str, side: Side, price: Decimal, quantity: Quantity) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            price_type: PriceType::Limit,
            offset: Offset::Open,
            price,
            quantity,
            strategy_id: 0,
        }
    }

    /// Create a market order request (opening a position)
    pub fn market(instrument: &str, side: Side, quantity: Quantity) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            price_type: PriceType::Market,
            offset: Offset::Open,
            price: Decimal::ZERO,
            quantity,
            strategy_id: 0,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_strategy(mut self, strategy_id: StrategyId) -> Self {
        self.strategy_id = strategy_id;
        self
    }
}

// ============================================================
// FILL
// ============================================================

/// Immutable execution report, append-only on its order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: ExchangeOrderId,
    pub trade_id: TradeId,
    pub quantity: Quantity,
    pub price: Decimal,
    pub timestamp_ms: i64,
}

// ============================================================
// ORDER
// ============================================================

/// One trading intent, owned by the order ledger
#[derive(Debug, Clone)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub instrument_id: InstrumentId,
    pub instrument: String,
    pub side: Side,
    pub price_type: PriceType,
    pub offset: Offset,
    pub price: Decimal,
    pub quantity: Quantity,
    pub remaining: Quantity,
    pub status: OrderStatus,
    pub strategy_id: StrategyId,
    pub submitted_at: DateTime<Utc>,
    /// A cancel was sent and not yet answered
    pub cancel_requested: bool,
    fills: Vec<Fill>,
}

impl Order {
    pub fn new(
        client_order_id: ClientOrderId,
        instrument_id: InstrumentId,
        request: &OrderRequest,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            instrument_id,
            instrument: request.instrument.clone(),
            side: request.side,
            price_type: request.price_type,
            offset: request.offset,
            price: request.price,
            quantity: request.quantity,
            remaining: request.quantity,
            status: OrderStatus::PendingSubmit,
            strategy_id: request.strategy_id,
            submitted_at,
            cancel_requested: false,
            fills: Vec::new(),
        }
    }

    /// Quantity executed so far (sum of all fills)
    #[inline]
    pub fn filled_qty(&self) -> Quantity {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Working with at least one fill
    #[inline]
    pub fn is_partially_filled(&self) -> bool {
        self.status == OrderStatus::Working && self.remaining < self.quantity
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    /// Whether a fill with this trade ID was already recorded
    pub fn has_fill(&self, trade_id: &str) -> bool {
        self.fills.iter().any(|f| f.trade_id == trade_id)
    }

    /// Volume-weighted average fill price, `None` before the first fill
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        let filled = self.filled_qty();
        if filled == 0 {
            return None;
        }
        let notional: Decimal = self
            .fills
            .iter()
            .map(|f| f.price * Decimal::from(f.quantity))
            .sum();
        Some(notional / Decimal::from(filled))
    }

    /// Append a fill and reduce `remaining`.
    ///
    /// # Errors
    /// Returns `FillError::Overfill` if the fill exceeds the remaining quantity;
    /// the order is left untouched.
    pub fn apply_fill(&mut self, fill: Fill) -> Result<(), FillError> {
        if fill.quantity == 0 || fill.quantity > self.remaining {
            return Err(FillError::Overfill {
                remaining: self.remaining,
                fill_qty: fill.quantity,
            });
        }
        self.remaining -= fill.quantity;
        self.fills.push(fill);
        Ok(())
    }
}

/// Fill application error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FillError {
    #[error("Fill of {fill_qty} exceeds remaining {remaining}")]
    Overfill { remaining: Quantity, fill_qty: Quantity },
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn order(qty: Quantity) -> Order {
        let req = OrderRequest::limit("rb2410", Side::Buy, px("3500"), qty);
        Order::new(1, 0, &req, Utc::now())
    }

    fn fill(trade_id: &str, qty: Quantity, price: Decimal) -> Fill {
        Fill {
            client_order_id: 1,
            exchange_order_id: "E1".to_string(),
            trade_id: trade_id.to_string(),
            quantity: qty,
            price,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());

        assert!(!OrderStatus::PendingSubmit.is_terminal());
        assert!(!OrderStatus::Working.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_remaining_tracks_fills() {
        let mut o = order(10);
        o.apply_fill(fill("T1", 4, px("3500"))).unwrap();
        assert_eq!(o.remaining, 6);
        assert_eq!(o.filled_qty(), 4);
        o.apply_fill(fill("T2", 6, px("3502"))).unwrap();
        assert_eq!(o.remaining, 0);
        assert_eq!(o.quantity - o.filled_qty(), o.remaining);
        assert_eq!(o.avg_fill_price(), Some(px("3501.2")));
    }

    #[test]
    fn test_overfill_leaves_order_untouched() {
        let mut o = order(5);
        let err = o.apply_fill(fill("T1", 6, px("3500"))).unwrap_err();
        assert_eq!(
            err,
            FillError::Overfill {
                remaining: 5,
                fill_qty: 6
            }
        );
        assert_eq!(o.remaining, 5);
        assert!(o.fills().is_empty());
    }

    #[test]
    fn test_partially_filled_is_working() {
        let mut o = order(10);
        o.status = OrderStatus::Working;
        assert!(!o.is_partially_filled());
        o.apply_fill(fill("T1", 3, px("3500"))).unwrap();
        assert!(o.is_partially_filled());
        assert!(o.has_fill("T1"));
        assert!(!o.has_fill("T2"));
    }

    #[test]
    fn test_display() {
        assert_eq!(OrderStatus::PendingSubmit.to_string(), "PENDING_SUBMIT");
        assert_eq!(OrderStatus::Unknown.to_string(), "UNKNOWN");
    }
}
