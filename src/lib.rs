//! ctp_gateway - Futures Exchange Trading Gateway
//!
//! One authenticated session to an exchange front, an order ledger that
//! tracks every order against exchange acknowledgements, and a
//! non-blocking facade for trading logic.
//!
//! # Modules
//!
//! - [`core_types`] - ID and quantity aliases
//! - [`instrument`] - Instrument reference data and local order validation
//! - [`models`] - Order, fill and order-request types
//! - [`messages`] - Events delivered to trading logic
//! - [`codec`] - Wire message schema and length/CRC framing
//! - [`transport`] - TCP and WebSocket frame channels
//! - [`session`] - Login / heartbeat / reconnect state machine
//! - [`ledger`] - Order lifecycle and reconciliation
//! - [`market`] - Market data subscriptions
//! - [`gateway`] - Public facade and the worker loop
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

// Core types - must be first!
pub mod core_types;

pub mod instrument;
pub mod messages;
pub mod models;

// Protocol
pub mod codec;
pub mod session;
pub mod transport;

// Order and market state
pub mod ledger;
pub mod market;

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;

#[cfg(feature = "sim-exchange")]
pub mod sim;

// Convenient re-exports at crate root
pub use codec::{DecodingError, EncodingError, Payload, WireCodec, WireMessage};
pub use config::{AppConfig, ConfigError};
pub use core_types::{ClientOrderId, ExchangeOrderId, InstrumentId, Quantity, SeqNum, TradeId};
pub use error::GatewayError;
pub use gateway::{EventReceiver, Gateway, GatewayOptions};
pub use instrument::{Exchange, Instrument, InstrumentManager};
pub use ledger::OrderLedger;
pub use messages::{GatewayEvent, MarketEvent, OrderEvent, RejectReason, SessionEvent};
pub use models::{Fill, Offset, Order, OrderRequest, OrderStatus, PriceType, Side};
pub use session::{Credentials, Session, SessionConfig, SessionState, SessionStatus};
pub use transport::{Connector, DefaultConnector, Endpoint, Transport, TransportError};
