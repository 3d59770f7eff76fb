//! Simulated exchange for development and integration tests
//!
//! Speaks the gateway wire protocol over TCP on a local port. Behaviour is
//! switched at runtime through the control methods: reject logins, stop
//! answering heartbeats, swallow order acks, split orders into partial
//! fills, sever the connection, skip sequence numbers or inject raw bytes.
//!
//! Order and trade state survives reconnects so the gateway's
//! reconciliation queries get meaningful answers.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{DEFAULT_MAX_FRAME_BYTES, Payload, ReportedStatus, WireCodec, WireMessage};
use crate::core_types::{ClientOrderId, ExchangeOrderId, Quantity, SeqNum};
use crate::messages::{Balance, DEPTH_LEVELS, Depth};
use crate::transport::tcp::TcpTransport;
use crate::transport::{Endpoint, Transport, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const TRADING_DAY: &str = "20240612";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct SimOrder {
    exchange_order_id: ExchangeOrderId,
    instrument: String,
    price: Decimal,
    quantity: Quantity,
    filled: Quantity,
    status: ReportedStatus,
}

enum Control {
    Send(Payload),
    SkipSeq(SeqNum),
    Raw(Vec<u8>),
    Sever,
}

#[derive(Default)]
struct SimShared {
    reject_login: AtomicBool,
    /// Answer gateway heartbeats (default on)
    ack_heartbeats: AtomicBool,
    swallow_order_acks: AtomicBool,
    reject_orders: AtomicBool,
    /// Partial fill sizes applied to each new order; empty rests the order
    fill_plan: Mutex<Vec<Quantity>>,
    orders: Mutex<BTreeMap<ClientOrderId, SimOrder>>,
    /// Every fill ever reported, replayed on trade query
    trades: Mutex<Vec<Payload>>,
    received: Mutex<Vec<Payload>>,
    connection: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    next_exchange_id: AtomicU64,
    next_trade_id: AtomicU64,
    connections: AtomicU64,
    logins: AtomicU64,
}

impl SimShared {
    fn next_exchange_order_id(&self) -> ExchangeOrderId {
        format!("SIM{:08}", self.next_exchange_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Apply a fill to the book and return the report to send
    fn fill(&self, id: ClientOrderId, quantity: Quantity) -> Option<Payload> {
        let mut orders = lock(&self.orders);
        let order = orders.get_mut(&id)?;
        if order.status != ReportedStatus::Working {
            return None;
        }
        let quantity = quantity.min(order.quantity - order.filled);
        if quantity == 0 {
            return None;
        }
        order.filled += quantity;
        if order.filled == order.quantity {
            order.status = ReportedStatus::Filled;
        }
        let trade_no = self.next_trade_id.fetch_add(1, Ordering::SeqCst) + 1;
        let report = Payload::FillReport {
            client_order_id: id,
            exchange_order_id: order.exchange_order_id.clone(),
            trade_id: format!("T{:08}", trade_no),
            quantity,
            price: order.price,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        lock(&self.trades).push(report.clone());
        Some(report)
    }

    fn control(&self, control: Control) -> bool {
        match lock(&self.connection).as_ref() {
            Some(tx) => tx.send(control).is_ok(),
            None => false,
        }
    }
}

// ============================================================
// SIM EXCHANGE
// ============================================================

pub struct SimExchange {
    addr: SocketAddr,
    shared: Arc<SimShared>,
    accept: JoinHandle<()>,
}

impl SimExchange {
    /// Bind on an ephemeral localhost port and start accepting
    pub async fn start() -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0").await
    }

    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(SimShared::default());
        shared.ack_heartbeats.store(true, Ordering::SeqCst);

        let accept = tokio::spawn(accept_loop(listener, shared.clone()));
        tracing::info!(addr = %addr, "Simulated exchange listening");
        Ok(Self {
            addr,
            shared,
            accept,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.addr.to_string())
    }

    // --- behaviour ---

    pub fn set_reject_login(&self, reject: bool) {
        self.shared.reject_login.store(reject, Ordering::SeqCst);
    }

    pub fn set_ack_heartbeats(&self, ack: bool) {
        self.shared.ack_heartbeats.store(ack, Ordering::SeqCst);
    }

    /// Accept orders silently: no ack, no fills
    pub fn set_swallow_order_acks(&self, swallow: bool) {
        self.shared.swallow_order_acks.store(swallow, Ordering::SeqCst);
    }

    pub fn set_reject_orders(&self, reject: bool) {
        self.shared.reject_orders.store(reject, Ordering::SeqCst);
    }

    /// Fill sizes applied right after each order ack, e.g. `[4, 6]`
    pub fn set_fill_plan(&self, plan: Vec<Quantity>) {
        *lock(&self.shared.fill_plan) = plan;
    }

    // --- live connection ---

    /// Fill a resting order now; false if it cannot be filled or no
    /// connection is up
    pub fn fill(&self, id: ClientOrderId, quantity: Quantity) -> bool {
        match self.shared.fill(id, quantity) {
            Some(report) => self.shared.control(Control::Send(report)),
            None => false,
        }
    }

    /// Send an arbitrary message with the next sequence number
    pub fn send(&self, payload: Payload) -> bool {
        self.shared.control(Control::Send(payload))
    }

    /// Skip `n` sequence numbers before the next message
    pub fn skip_seq(&self, n: SeqNum) -> bool {
        self.shared.control(Control::SkipSeq(n))
    }

    /// Write bytes verbatim, bypassing the codec
    pub fn inject_raw(&self, bytes: Vec<u8>) -> bool {
        self.shared.control(Control::Raw(bytes))
    }

    /// Drop the current connection without a logout
    pub fn sever(&self) -> bool {
        self.shared.control(Control::Sever)
    }

    // --- inspection ---

    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> u64 {
        self.shared.logins.load(Ordering::SeqCst)
    }

    /// Every payload received from the gateway, in order
    pub fn received(&self) -> Vec<Payload> {
        lock(&self.shared.received).clone()
    }

    pub fn order_status(&self, id: ClientOrderId) -> Option<(ReportedStatus, Quantity)> {
        lock(&self.shared.orders)
            .get(&id)
            .map(|o| (o.status, o.filled))
    }
}

impl Drop for SimExchange {
    fn drop(&mut self) {
        self.accept.abort();
        self.shared.control(Control::Sever);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<SimShared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Simulated exchange accept failed");
                continue;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // Replacing the sender ends the previous connection's control stream
        *lock(&shared.connection) = Some(tx);
        shared.connections.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(peer = %peer, "Simulated exchange accepted connection");

        let transport = TcpTransport::from_stream(stream, peer.to_string(), DEFAULT_MAX_FRAME_BYTES);
        tokio::spawn(serve(transport, shared.clone(), rx));
    }
}

// ============================================================
// CONNECTION
// ============================================================

enum Step {
    Frame(Result<Vec<u8>, TransportError>),
    Control(Option<Control>),
}

struct SimConnection {
    shared: Arc<SimShared>,
    codec: WireCodec,
    seq: SeqNum,
    outbox: Vec<Payload>,
    closing: bool,
}

async fn serve(mut transport: TcpTransport, shared: Arc<SimShared>, mut control: mpsc::UnboundedReceiver<Control>) {
    let mut conn = SimConnection {
        shared,
        codec: WireCodec::default(),
        seq: 0,
        outbox: Vec::new(),
        closing: false,
    };

    loop {
        let step = tokio::select! {
            frame = transport.receive(POLL_INTERVAL) => Step::Frame(frame),
            command = control.recv() => Step::Control(command),
        };

        match step {
            Step::Frame(Ok(frame)) => match conn.codec.decode(&frame) {
                Ok(msg) => conn.handle(msg.payload),
                Err(e) => tracing::warn!(error = %e, "Simulated exchange got a malformed frame"),
            },
            Step::Frame(Err(e)) if e.is_timeout() => {}
            Step::Frame(Err(_)) => break,
            Step::Control(Some(Control::Send(payload))) => conn.outbox.push(payload),
            Step::Control(Some(Control::SkipSeq(n))) => conn.seq += n,
            Step::Control(Some(Control::Raw(bytes))) => {
                if transport.send(&bytes, SEND_TIMEOUT).await.is_err() {
                    break;
                }
            }
            Step::Control(Some(Control::Sever)) | Step::Control(None) => break,
        }

        if conn.flush(&mut transport).await.is_err() || conn.closing {
            break;
        }
    }
    transport.close().await;
    tracing::debug!("Simulated exchange connection closed");
}

impl SimConnection {
    async fn flush(&mut self, transport: &mut TcpTransport) -> Result<(), TransportError> {
        for payload in std::mem::take(&mut self.outbox) {
            self.seq += 1;
            let msg = WireMessage::new(self.seq, payload);
            match self.codec.encode(&msg) {
                Ok(frame) => transport.send(&frame, SEND_TIMEOUT).await?,
                Err(e) => tracing::warn!(error = %e, msg_type = msg.msg_type(), "Simulated exchange could not encode"),
            }
        }
        Ok(())
    }

    fn handle(&mut self, payload: Payload) {
        lock(&self.shared.received).push(payload.clone());
        match payload {
            Payload::LoginRequest { .. } => {
                if self.shared.reject_login.load(Ordering::SeqCst) {
                    self.outbox.push(Payload::LoginResponse {
                        success: false,
                        error_code: 3,
                        error_msg: "invalid login".to_string(),
                        trading_day: String::new(),
                    });
                } else {
                    self.shared.logins.fetch_add(1, Ordering::SeqCst);
                    self.outbox.push(Payload::LoginResponse {
                        success: true,
                        error_code: 0,
                        error_msg: String::new(),
                        trading_day: TRADING_DAY.to_string(),
                    });
                }
            }
            Payload::SettlementConfirm { .. } => self.outbox.push(Payload::SettlementConfirmAck {
                success: true,
                error_msg: String::new(),
            }),
            Payload::Heartbeat { id } => {
                if self.shared.ack_heartbeats.load(Ordering::SeqCst) {
                    self.outbox.push(Payload::HeartbeatAck { id });
                }
            }
            Payload::Logout { .. } => self.closing = true,
            Payload::OrderInsert {
                client_order_id,
                instrument,
                price,
                quantity,
                ..
            } => self.on_order_insert(client_order_id, instrument, price, quantity),
            Payload::CancelRequest { client_order_id, .. } => self.on_cancel(client_order_id),
            Payload::OrderStatusQuery { client_order_id, .. } => {
                let report = match lock(&self.shared.orders).get(&client_order_id) {
                    Some(order) => Payload::OrderStatusReport {
                        client_order_id,
                        exchange_order_id: Some(order.exchange_order_id.clone()),
                        status: order.status,
                        filled_qty: order.filled,
                    },
                    None => Payload::OrderStatusReport {
                        client_order_id,
                        exchange_order_id: None,
                        status: ReportedStatus::NotFound,
                        filled_qty: 0,
                    },
                };
                self.outbox.push(report);
            }
            Payload::TradeQuery {} => {
                let trades = lock(&self.shared.trades).clone();
                self.outbox.extend(trades);
            }
            Payload::SubscribeRequest { instruments } => {
                for instrument in instruments {
                    self.outbox.push(Payload::SubscribeAck {
                        instrument: instrument.clone(),
                        success: true,
                        error_msg: String::new(),
                    });
                    self.outbox.push(snapshot(&instrument));
                }
            }
            Payload::UnsubscribeRequest { instruments } => {
                for instrument in instruments {
                    self.outbox.push(Payload::UnsubscribeAck { instrument });
                }
            }
            Payload::AccountQuery {} => self.outbox.push(Payload::AccountReport {
                balance: Balance {
                    account_id: "SIM001".to_string(),
                    balance: Decimal::from(1_000_000),
                    available: Decimal::from(800_000),
                    margin: Decimal::from(200_000),
                    frozen_margin: Decimal::ZERO,
                },
            }),
            other => tracing::debug!(msg_type = other.msg_type(), "Simulated exchange ignored message"),
        }
    }

    fn on_order_insert(&mut self, id: ClientOrderId, instrument: String, price: Decimal, quantity: Quantity) {
        if self.shared.reject_orders.load(Ordering::SeqCst) {
            self.outbox.push(Payload::OrderAck {
                client_order_id: id,
                exchange_order_id: None,
                accepted: false,
                error_code: 31,
                error_msg: "insufficient margin".to_string(),
            });
            return;
        }

        let exchange_order_id = self.shared.next_exchange_order_id();
        lock(&self.shared.orders).insert(
            id,
            SimOrder {
                exchange_order_id: exchange_order_id.clone(),
                instrument,
                price,
                quantity,
                filled: 0,
                status: ReportedStatus::Working,
            },
        );
        if self.shared.swallow_order_acks.load(Ordering::SeqCst) {
            return;
        }

        self.outbox.push(Payload::OrderAck {
            client_order_id: id,
            exchange_order_id: Some(exchange_order_id),
            accepted: true,
            error_code: 0,
            error_msg: String::new(),
        });
        let plan = lock(&self.shared.fill_plan).clone();
        for quantity in plan {
            if let Some(report) = self.shared.fill(id, quantity) {
                self.outbox.push(report);
            }
        }
    }

    fn on_cancel(&mut self, id: ClientOrderId) {
        let mut orders = lock(&self.shared.orders);
        let ack = match orders.get_mut(&id) {
            Some(order) if order.status == ReportedStatus::Working => {
                order.status = ReportedStatus::Cancelled;
                tracing::debug!(client_order_id = id, instrument = %order.instrument, "Simulated cancel");
                Payload::CancelAck {
                    client_order_id: id,
                    success: true,
                    error_code: 0,
                    error_msg: String::new(),
                }
            }
            Some(_) => Payload::CancelAck {
                client_order_id: id,
                success: false,
                error_code: 26,
                error_msg: "order already completed".to_string(),
            },
            None => Payload::CancelAck {
                client_order_id: id,
                success: false,
                error_code: 25,
                error_msg: "order not found".to_string(),
            },
        };
        drop(orders);
        self.outbox.push(ack);
    }
}

/// Depth snapshot around a fixed reference price
fn snapshot(instrument: &str) -> Payload {
    let last = Decimal::from(3500);
    let level = |i: usize| Decimal::from(i as u64 + 1);
    let depth = Depth {
        instrument: instrument.to_string(),
        update_time_ms: chrono::Utc::now().timestamp_millis(),
        last,
        open: Decimal::from(3480),
        high: Decimal::from(3520),
        low: Decimal::from(3470),
        volume: 125_000,
        turnover: Decimal::from(4_375_000_000u64),
        open_interest: 1_800_000,
        bids: (0..DEPTH_LEVELS).map(|i| (last - level(i), 10 * (i as u64 + 1))).collect(),
        asks: (0..DEPTH_LEVELS).map(|i| (last + level(i), 10 * (i as u64 + 1))).collect(),
    };
    Payload::MarketData {
        depth,
        trading_day: TRADING_DAY.to_string(),
        prev_close: Decimal::from(3490),
        upper_limit: Decimal::from(3770),
        lower_limit: Decimal::from(3210),
    }
}
