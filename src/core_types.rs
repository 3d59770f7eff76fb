//! Core types used throughout the gateway
//!
//! Type aliases that give semantic meaning to raw integers flowing between
//! the codec, the session and the order ledger.

/// Client order ID - generated locally, unique for the lifetime of a gateway.
///
/// # Constraints:
/// - **Monotonic**: allocated from a single atomic counter, starts at 1
/// - **Never reused**: eviction from the ledger does not recycle IDs
pub type ClientOrderId = u64;

/// Exchange order ID - assigned by the exchange, arrives asynchronously
/// with the order acknowledgement (the OrderSysID of a CTP front).
pub type ExchangeOrderId = String;

/// Exchange trade ID - unique per execution report on one exchange.
pub type TradeId = String;

/// Instrument ID - dense index into the [`InstrumentManager`](crate::instrument::InstrumentManager).
pub type InstrumentId = u32;

/// Wire sequence number (per session direction)
pub type SeqNum = u64;

/// Order quantity in lots
pub type Quantity = u64;

/// Strategy tag carried on orders, opaque to the gateway
pub type StrategyId = u32;
