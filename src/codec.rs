//! Wire Codec - exchange protocol frames
//!
//! A length-prefixed, checksummed frame carrying one JSON-encoded
//! [`WireMessage`].
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────┬─────────┬──────────────────────────────────┐
//! │ payload_len │ 4 bytes │ u32 LE, bounded by max_frame     │
//! │ checksum    │ 4 bytes │ u32 LE, CRC32 of payload         │
//! │ payload     │ N bytes │ JSON {"seq": n, "payload": {..}} │
//! └─────────────┴─────────┴──────────────────────────────────┘
//! ```
//!
//! Decoding is side-effect free. Unknown JSON fields are ignored so newer
//! fronts can add fields without breaking older gateways; unknown message
//! types and missing required fields are errors.

use crc32fast::Hasher;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{ClientOrderId, ExchangeOrderId, Quantity, SeqNum, TradeId};
use crate::messages::{Balance, Depth};
use crate::models::{Offset, PriceType, Side};

// ============================================================
// CONSTANTS
// ============================================================

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default upper bound for a frame payload (64 KiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

// ============================================================
// ERRORS
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Required field missing or empty: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Encoded payload of {len} bytes exceeds max {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Serialization failed: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodingError {
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Frame of {len} bytes exceeds max {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Trailing {0} bytes after frame")]
    TrailingBytes(usize),

    #[error("Checksum mismatch")]
    Checksum,

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Schema violation: {0}")]
    Schema(String),
}

// ============================================================
// WIRE MESSAGE
// ============================================================

/// Status of an order as reported by the exchange on query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Working,
    Filled,
    Cancelled,
    Rejected,
    NotFound,
}

/// One protocol-level unit exchanged with the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub seq: SeqNum,
    pub payload: Payload,
}

impl WireMessage {
    pub fn new(seq: SeqNum, payload: Payload) -> Self {
        Self { seq, payload }
    }

    pub fn msg_type(&self) -> &'static str {
        self.payload.msg_type()
    }
}

/// Typed payload, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    LoginRequest {
        broker_id: String,
        user_id: String,
        password: String,
        #[serde(default)]
        app_id: String,
        #[serde(default)]
        auth_code: String,
    },
    LoginResponse {
        success: bool,
        #[serde(default)]
        error_code: i32,
        #[serde(default)]
        error_msg: String,
        #[serde(default)]
        trading_day: String,
    },
    SettlementConfirm {
        broker_id: String,
        investor_id: String,
    },
    SettlementConfirmAck {
        success: bool,
        #[serde(default)]
        error_msg: String,
    },
    Logout {
        user_id: String,
    },
    Heartbeat {
        id: u64,
    },
    HeartbeatAck {
        id: u64,
    },
    OrderInsert {
        client_order_id: ClientOrderId,
        instrument: String,
        side: Side,
        price_type: PriceType,
        #[serde(default)]
        offset: Offset,
        price: Decimal,
        quantity: Quantity,
    },
    OrderAck {
        client_order_id: ClientOrderId,
        #[serde(default)]
        exchange_order_id: Option<ExchangeOrderId>,
        accepted: bool,
        #[serde(default)]
        error_code: i32,
        #[serde(default)]
        error_msg: String,
    },
    CancelRequest {
        client_order_id: ClientOrderId,
        #[serde(default)]
        exchange_order_id: Option<ExchangeOrderId>,
    },
    CancelAck {
        client_order_id: ClientOrderId,
        success: bool,
        #[serde(default)]
        error_code: i32,
        #[serde(default)]
        error_msg: String,
    },
    FillReport {
        client_order_id: ClientOrderId,
        exchange_order_id: ExchangeOrderId,
        trade_id: TradeId,
        quantity: Quantity,
        price: Decimal,
        #[serde(default)]
        timestamp_ms: i64,
    },
    OrderStatusQuery {
        client_order_id: ClientOrderId,
        #[serde(default)]
        exchange_order_id: Option<ExchangeOrderId>,
    },
    OrderStatusReport {
        client_order_id: ClientOrderId,
        #[serde(default)]
        exchange_order_id: Option<ExchangeOrderId>,
        status: ReportedStatus,
        #[serde(default)]
        filled_qty: Quantity,
    },
    /// Replay of all executions of the trading day (reconciliation)
    TradeQuery {},
    SubscribeRequest {
        instruments: Vec<String>,
    },
    SubscribeAck {
        instrument: String,
        success: bool,
        #[serde(default)]
        error_msg: String,
    },
    UnsubscribeRequest {
        instruments: Vec<String>,
    },
    UnsubscribeAck {
        instrument: String,
    },
    MarketData {
        depth: Depth,
        #[serde(default)]
        trading_day: String,
        #[serde(default)]
        prev_close: Decimal,
        #[serde(default)]
        upper_limit: Decimal,
        #[serde(default)]
        lower_limit: Decimal,
    },
    AccountQuery {},
    AccountReport {
        balance: Balance,
    },
}

impl Payload {
    pub fn msg_type(&self) -> &'static str {
        match self {
            Payload::LoginRequest { .. } => "login_request",
            Payload::LoginResponse { .. } => "login_response",
            Payload::SettlementConfirm { .. } => "settlement_confirm",
            Payload::SettlementConfirmAck { .. } => "settlement_confirm_ack",
            Payload::Logout { .. } => "logout",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::HeartbeatAck { .. } => "heartbeat_ack",
            Payload::OrderInsert { .. } => "order_insert",
            Payload::OrderAck { .. } => "order_ack",
            Payload::CancelRequest { .. } => "cancel_request",
            Payload::CancelAck { .. } => "cancel_ack",
            Payload::FillReport { .. } => "fill_report",
            Payload::OrderStatusQuery { .. } => "order_status_query",
            Payload::OrderStatusReport { .. } => "order_status_report",
            Payload::TradeQuery {} => "trade_query",
            Payload::SubscribeRequest { .. } => "subscribe_request",
            Payload::SubscribeAck { .. } => "subscribe_ack",
            Payload::UnsubscribeRequest { .. } => "unsubscribe_request",
            Payload::UnsubscribeAck { .. } => "unsubscribe_ack",
            Payload::MarketData { .. } => "market_data",
            Payload::AccountQuery {} => "account_query",
            Payload::AccountReport { .. } => "account_report",
        }
    }

    /// Schema rules serde cannot express (non-empty strings, positive sizes)
    fn validate(&self) -> Result<(), EncodingError> {
        fn non_empty(value: &str, field: &'static str) -> Result<(), EncodingError> {
            if value.is_empty() {
                Err(EncodingError::MissingField(field))
            } else {
                Ok(())
            }
        }

        match self {
            Payload::LoginRequest {
                broker_id,
                user_id,
                password,
                ..
            } => {
                non_empty(broker_id, "broker_id")?;
                non_empty(user_id, "user_id")?;
                non_empty(password, "password")
            }
            Payload::SettlementConfirm {
                broker_id,
                investor_id,
            } => {
                non_empty(broker_id, "broker_id")?;
                non_empty(investor_id, "investor_id")
            }
            Payload::Logout { user_id } => non_empty(user_id, "user_id"),
            Payload::OrderInsert {
                instrument,
                quantity,
                ..
            } => {
                non_empty(instrument, "instrument")?;
                if *quantity == 0 {
                    return Err(EncodingError::InvalidField {
                        field: "quantity",
                        reason: "must be positive".to_string(),
                    });
                }
                Ok(())
            }
            Payload::OrderAck {
                accepted,
                exchange_order_id,
                ..
            } => {
                if *accepted && exchange_order_id.as_deref().is_none_or(str::is_empty) {
                    return Err(EncodingError::MissingField("exchange_order_id"));
                }
                Ok(())
            }
            Payload::FillReport {
                exchange_order_id,
                trade_id,
                quantity,
                ..
            } => {
                non_empty(exchange_order_id, "exchange_order_id")?;
                non_empty(trade_id, "trade_id")?;
                if *quantity == 0 {
                    return Err(EncodingError::InvalidField {
                        field: "quantity",
                        reason: "must be positive".to_string(),
                    });
                }
                Ok(())
            }
            Payload::SubscribeRequest { instruments }
            | Payload::UnsubscribeRequest { instruments } => {
                if instruments.is_empty() || instruments.iter().any(String::is_empty) {
                    return Err(EncodingError::MissingField("instruments"));
                }
                Ok(())
            }
            Payload::SubscribeAck { instrument, .. } | Payload::UnsubscribeAck { instrument } => {
                non_empty(instrument, "instrument")
            }
            Payload::MarketData { depth, .. } => non_empty(&depth.instrument, "depth.instrument"),
            _ => Ok(()),
        }
    }
}

// ============================================================
// CRC32 HELPER
// ============================================================

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================
// CODEC
// ============================================================

/// Stateless encoder/decoder with a frame size bound
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a message into one complete frame
    pub fn encode(&self, msg: &WireMessage) -> Result<Vec<u8>, EncodingError> {
        msg.payload.validate()?;

        let payload =
            serde_json::to_vec(msg).map_err(|e| EncodingError::Serialize(e.to_string()))?;
        if payload.len() > self.max_frame_bytes {
            return Err(EncodingError::TooLarge {
                len: payload.len(),
                max: self.max_frame_bytes,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32_checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Read the payload length from a header and enforce the size bound.
    ///
    /// Stream transports call this before allocating the payload buffer.
    pub fn payload_len(&self, header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize, DecodingError> {
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(DecodingError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(len)
    }

    /// Decode exactly one complete frame
    pub fn decode(&self, frame: &[u8]) -> Result<WireMessage, DecodingError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(DecodingError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: frame.len(),
            });
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let len = self.payload_len(&header)?;
        let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let body = &frame[FRAME_HEADER_SIZE..];
        if body.len() < len {
            return Err(DecodingError::Truncated {
                expected: FRAME_HEADER_SIZE + len,
                actual: frame.len(),
            });
        }
        if body.len() > len {
            return Err(DecodingError::TrailingBytes(body.len() - len));
        }
        if crc32_checksum(body) != checksum {
            return Err(DecodingError::Checksum);
        }

        let msg: WireMessage =
            serde_json::from_slice(body).map_err(|e| DecodingError::Malformed(e.to_string()))?;
        msg.payload
            .validate()
            .map_err(|e| DecodingError::Schema(e.to_string()))?;
        Ok(msg)
    }
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

    fn samples() -> Vec<WireMessage> {
        vec![
            WireMessage::new(
                1,
                Payload::LoginRequest {
                    broker_id: "9999".into(),
                    user_id: "u1".into(),
                    password: "pw".into(),
                    app_id: "app".into(),
                    auth_code: "code".into(),
                },
            ),
            WireMessage::new(2, Payload::Heartbeat { id: 7 }),
            WireMessage::new(
                3,
                Payload::OrderInsert {
                    client_order_id: 42,
                    instrument: "rb2410".into(),
                    side: Side::Sell,
                    price_type: PriceType::Limit,
                    offset: Offset::CloseToday,
                    price: px("3521.0"),
                    quantity: 3,
                },
            ),
            WireMessage::new(
                4,
                Payload::FillReport {
                    client_order_id: 42,
                    exchange_order_id: "  100023".into(),
                    trade_id: "T9".into(),
                    quantity: 1,
                    price: px("3521"),
                    timestamp_ms: 1_700_000_000_000,
                },
            ),
            WireMessage::new(
                5,
                Payload::OrderStatusReport {
                    client_order_id: 42,
                    exchange_order_id: None,
                    status: ReportedStatus::NotFound,
                    filled_qty: 0,
                },
            ),
            WireMessage::new(6, Payload::TradeQuery {}),
        ]
    }

    #[test]
    fn test_roundtrip() {
        let codec = WireCodec::default();
        for msg in samples() {
            let frame = codec.encode(&msg).unwrap();
            assert_eq!(codec.decode(&frame).unwrap(), msg, "{}", msg.msg_type());
        }
    }

    #[test]
    fn test_encode_rejects_missing_field() {
        let codec = WireCodec::default();
        let msg = WireMessage::new(
            1,
            Payload::LoginRequest {
                broker_id: "9999".into(),
                user_id: String::new(),
                password: "pw".into(),
                app_id: String::new(),
                auth_code: String::new(),
            },
        );
        assert_eq!(
            codec.encode(&msg),
            Err(EncodingError::MissingField("user_id"))
        );

        let accepted_without_id = WireMessage::new(
            2,
            Payload::OrderAck {
                client_order_id: 1,
                exchange_order_id: None,
                accepted: true,
                error_code: 0,
                error_msg: String::new(),
            },
        );
        assert_eq!(
            codec.encode(&accepted_without_id),
            Err(EncodingError::MissingField("exchange_order_id"))
        );
    }

    #[test]
    fn test_truncated_frame() {
        let codec = WireCodec::default();
        let frame = codec.encode(&samples()[2]).unwrap();

        let err = codec.decode(&frame[..frame.len() - 3]).unwrap_err();
        assert!(matches!(err, DecodingError::Truncated { .. }));

        let err = codec.decode(&frame[..5]).unwrap_err();
        assert_eq!(
            err,
            DecodingError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: 5
            }
        );
    }

    #[test]
    fn test_oversized_length_rejected_before_reading_body() {
        let codec = WireCodec::new(128);
        let mut frame = vec![0u8; FRAME_HEADER_SIZE];
        frame[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert_eq!(
            codec.decode(&frame),
            Err(DecodingError::TooLarge {
                len: u32::MAX as usize,
                max: 128
            })
        );
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = WireCodec::default();
        let mut frame = codec.encode(&samples()[1]).unwrap();
        let last = frame.len() - 2;
        frame[last] ^= 0x01;
        assert_eq!(codec.decode(&frame), Err(DecodingError::Checksum));
    }

    fn frame_json(json: &str) -> Vec<u8> {
        let body = json.as_bytes();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32_checksum(body).to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let codec = WireCodec::default();
        let frame = frame_json(
            r#"{"seq":9,"front_id":3,"payload":{"type":"heartbeat_ack","id":5,"lag_us":12}}"#,
        );
        assert_eq!(
            codec.decode(&frame).unwrap(),
            WireMessage::new(9, Payload::HeartbeatAck { id: 5 })
        );
    }

    #[test]
    fn test_invalid_tag_and_type_mismatch() {
        let codec = WireCodec::default();
        let bad_tag = frame_json(r#"{"seq":1,"payload":{"type":"teleport"}}"#);
        assert!(matches!(
            codec.decode(&bad_tag),
            Err(DecodingError::Malformed(_))
        ));

        let bad_type = frame_json(r#"{"seq":"one","payload":{"type":"heartbeat","id":1}}"#);
        assert!(matches!(
            codec.decode(&bad_type),
            Err(DecodingError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_enforces_schema() {
        let codec = WireCodec::default();
        let zero_fill = frame_json(
            r#"{"seq":1,"payload":{"type":"fill_report","client_order_id":1,"exchange_order_id":"E","trade_id":"T","quantity":0,"price":"1"}}"#,
        );
        assert!(matches!(
            codec.decode(&zero_fill),
            Err(DecodingError::Schema(_))
        ));
    }
}
