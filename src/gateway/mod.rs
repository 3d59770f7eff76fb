//! Gateway facade - the API trading logic calls
//!
//! ```text
//! caller ──submit/cancel/subscribe──▶ validate ──try_send──▶ [command queue]
//!                                                                 │
//!                                                          worker (Engine)
//!                                                                 │
//! caller ◀──────────────── event stream ◀─────────────────────────┘
//! ```
//!
//! Calls never wait on the network. They validate what can be known
//! synchronously (instrument, price, quantity, session readiness, order
//! existence) and hand the intent to the worker through a bounded queue.
//! Every exchange-driven outcome arrives on the [`EventReceiver`].

pub mod engine;
mod worker;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core_types::ClientOrderId;
use crate::error::GatewayError;
use crate::instrument::InstrumentManager;
use crate::ledger::{OrderIdGenerator, OrderLedger};
use crate::market::MarketData;
use crate::messages::{GatewayEvent, RejectReason};
use crate::models::{OrderRequest, OrderStatus};
use crate::session::{Session, SessionState, SessionStatus};
use crate::transport::{Connector, DefaultConnector};
use engine::{Command, Engine, OrderView};
use worker::Worker;

/// Ordered stream of everything the exchange tells us
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Bounded hand-off queue between callers and the worker
    pub command_queue_size: usize,
    /// How long terminal orders are kept for late duplicates
    pub retention: Duration,
    /// Bound on waiting for the worker during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            command_queue_size: 4096,
            retention: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Gateway {
    instruments: Arc<InstrumentManager>,
    ids: Arc<OrderIdGenerator>,
    order_view: OrderView,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    shutdown_timeout: Duration,
    /// Built in `new`, spawned by `start`
    worker: Option<Worker>,
    handle: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Gateway over the default TCP / WebSocket connector
    pub fn new(
        session: Session,
        instruments: Arc<InstrumentManager>,
        options: GatewayOptions,
    ) -> (Self, EventReceiver) {
        Self::with_connector(session, instruments, Arc::new(DefaultConnector), options)
    }

    pub fn with_connector(
        session: Session,
        instruments: Arc<InstrumentManager>,
        connector: Arc<dyn Connector>,
        options: GatewayOptions,
    ) -> (Self, EventReceiver) {
        let ids = Arc::new(OrderIdGenerator::new());
        let order_view: OrderView = Arc::new(DashMap::new());
        let ledger = OrderLedger::new(instruments.clone(), ids.clone(), options.retention);
        let market = MarketData::new(instruments.clone());
        let status = session.status();
        let engine = Engine::new(session, ledger, market, order_view.clone());

        let (command_tx, command_rx) = mpsc::channel(options.command_queue_size.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(status);
        let worker = Worker::new(engine, connector, command_rx, event_tx, status_tx);

        let gateway = Self {
            instruments,
            ids,
            order_view,
            commands: command_tx,
            status: status_rx,
            shutdown_timeout: options.shutdown_timeout,
            worker: Some(worker),
            handle: None,
        };
        (gateway, event_rx)
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Spawn the worker; it connects and logs in on its own.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), GatewayError> {
        let worker = self.worker.take().ok_or(GatewayError::AlreadyStarted)?;
        self.handle = Some(tokio::spawn(worker.run()));
        tracing::info!("Gateway started");
        Ok(())
    }

    /// Drain queued commands, log out, close the transport and wait for
    /// the worker (bounded by the shutdown timeout).
    pub async fn shutdown(&mut self) -> Result<(), GatewayError> {
        self.worker = None;
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // Worker may already be gone after a fatal error
        let _ = self.commands.send(Command::Shutdown).await;

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => {
                tracing::info!("Gateway shut down");
                Ok(())
            }
            Ok(Err(e)) => Err(GatewayError::Fatal(format!("worker failed: {}", e))),
            Err(_) => {
                abort.abort();
                tracing::warn!(timeout_ms = self.shutdown_timeout.as_millis() as u64, "Worker did not stop in time");
                Err(GatewayError::Timeout("worker shutdown"))
            }
        }
    }

    // ============================================================
    // ORDERS
    // ============================================================

    /// Validate and enqueue a new order.
    ///
    /// The returned ID is final; acceptance, fills or rejection by the
    /// exchange arrive as events carrying it.
    pub fn submit_order(&self, request: OrderRequest) -> Result<ClientOrderId, GatewayError> {
        self.instruments
            .validate_order(&request)
            .map_err(GatewayError::Validation)?;
        self.ensure_ready()?;

        let id = self.ids.next_id();
        self.order_view.insert(id, OrderStatus::PendingSubmit);
        if let Err(e) = self.enqueue(Command::Submit { id, request }) {
            self.order_view.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn cancel_order(&self, id: ClientOrderId) -> Result<(), GatewayError> {
        let status = self
            .order_view
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or(GatewayError::Validation(RejectReason::UnknownOrder))?;
        if status.is_terminal() {
            return Err(GatewayError::Validation(RejectReason::OrderTerminal));
        }
        self.ensure_ready()?;
        self.enqueue(Command::Cancel { id })
    }

    /// Last status published by the worker; `None` once evicted
    pub fn order_status(&self, id: ClientOrderId) -> Option<OrderStatus> {
        self.order_view.get(&id).map(|entry| *entry.value())
    }

    // ============================================================
    // MARKET DATA / ACCOUNT
    // ============================================================

    /// Subscriptions survive reconnects; one made before login is sent
    /// once the session is up.
    pub fn subscribe_market_data(&self, instrument: &str) -> Result<(), GatewayError> {
        self.check_instrument(instrument)?;
        self.enqueue(Command::Subscribe(instrument.to_string()))
    }

    pub fn unsubscribe_market_data(&self, instrument: &str) -> Result<(), GatewayError> {
        self.check_instrument(instrument)?;
        self.enqueue(Command::Unsubscribe(instrument.to_string()))
    }

    pub fn query_account(&self) -> Result<(), GatewayError> {
        self.ensure_ready()?;
        self.enqueue(Command::QueryAccount)
    }

    // ============================================================
    // STATUS
    // ============================================================

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Watch channel of status snapshots
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until a status snapshot satisfies `pred`
    pub async fn wait_for_status<F>(&self, timeout: Duration, pred: F) -> Result<SessionStatus, GatewayError>
    where
        F: Fn(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if pred(&status) {
                        return Ok(status.clone());
                    }
                    if status.terminated {
                        return Err(Self::terminated_error(&status));
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(GatewayError::Stopped);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| GatewayError::Timeout("session status"))?
    }

    /// Wait until Active with no reconciliation outstanding
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), GatewayError> {
        self.wait_for_status(timeout, SessionStatus::is_ready).await.map(|_| ())
    }

    // ============================================================
    // HELPERS
    // ============================================================

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        let status = self.status.borrow();
        if status.terminated {
            return Err(Self::terminated_error(&status));
        }
        if !status.is_ready() {
            return Err(GatewayError::SessionNotReady(status.state));
        }
        Ok(())
    }

    fn terminated_error(status: &SessionStatus) -> GatewayError {
        match &status.fatal {
            Some(reason) => GatewayError::Fatal(reason.clone()),
            None => GatewayError::Stopped,
        }
    }

    fn check_instrument(&self, instrument: &str) -> Result<(), GatewayError> {
        if self.instruments.get_id(instrument).is_none() {
            return Err(GatewayError::Validation(RejectReason::UnknownInstrument));
        }
        if self.status.borrow().terminated {
            return Err(GatewayError::Stopped);
        }
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<(), GatewayError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::QueueFull,
            TrySendError::Closed(_) => GatewayError::Stopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Payload, WireCodec, WireMessage};
    use crate::instrument::{Exchange, Instrument};
    use crate::models::Side;
    use crate::session::{Credentials, SessionConfig};
    use crate::transport::{Endpoint, Transport, TransportError, send_within};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instruments() -> Arc<InstrumentManager> {
        let instruments = InstrumentManager::from_instruments([Instrument {
            name: "rb2410".to_string(),
            exchange: Exchange::Shfe,
            tick_size: "1".parse().unwrap(),
            lot_size: 1,
            multiplier: 10,
        }])
        .unwrap();
        Arc::new(instruments)
    }

    fn session_config() -> SessionConfig {
        let credentials = Credentials {
            broker_id: "9999".to_string(),
            user_id: "trader01".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        SessionConfig::new(Endpoint::Tcp("127.0.0.1:1".to_string()), credentials)
    }

    fn unstarted(command_queue_size: usize) -> (Gateway, EventReceiver) {
        let options = GatewayOptions {
            command_queue_size,
            ..Default::default()
        };
        Gateway::new(Session::new(session_config()), instruments(), options)
    }

    /// Answers the login, then never accepts another byte
    struct StalledPeer {
        codec: WireCodec,
        inbound: VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl Transport for StalledPeer {
        async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), TransportError> {
            let login = matches!(
                self.codec.decode(frame).map(|m| m.payload),
                Ok(Payload::LoginRequest { .. })
            );
            if !login {
                return send_within(timeout, std::future::pending::<Result<(), TransportError>>()).await;
            }
            let response = WireMessage::new(
                1,
                Payload::LoginResponse {
                    success: true,
                    error_code: 0,
                    error_msg: String::new(),
                    trading_day: "20240612".to_string(),
                },
            );
            self.inbound.push_back(self.codec.encode(&response).unwrap());
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            if let Some(frame) = self.inbound.pop_front() {
                return Ok(frame);
            }
            tokio::time::sleep(timeout).await;
            Err(TransportError::Timeout(timeout))
        }

        async fn close(&mut self) {}

        fn peer(&self) -> &str {
            "stalled-peer"
        }
    }

    #[derive(Default)]
    struct StalledConnector {
        connections: AtomicUsize,
    }

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
            _timeout: Duration,
            max_frame_bytes: usize,
        ) -> Result<Box<dyn Transport>, TransportError> {
            self.connections.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StalledPeer {
                codec: WireCodec::new(max_frame_bytes),
                inbound: VecDeque::new(),
            }))
        }
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (gw, _events) = unstarted(1);
        gw.subscribe_market_data("rb2410").unwrap();
        assert_eq!(gw.unsubscribe_market_data("rb2410"), Err(GatewayError::QueueFull));
        assert!(GatewayError::QueueFull.is_retryable());
    }

    #[test]
    fn test_not_ready_before_start() {
        let (gw, _events) = unstarted(8);
        let request = OrderRequest::limit("rb2410", Side::Buy, "3500".parse().unwrap(), 1);
        assert_eq!(
            gw.submit_order(request),
            Err(GatewayError::SessionNotReady(SessionState::Disconnected))
        );
        assert_eq!(gw.query_account(), Err(GatewayError::SessionNotReady(SessionState::Disconnected)));
        assert_eq!(gw.order_status(1), None);
        assert_eq!(gw.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stalled_send_reconnects_and_shutdown_completes() {
        let mut config = session_config();
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Duration::from_secs(10);
        config.send_timeout = Duration::from_millis(50);
        config.receive_timeout = Duration::from_millis(20);
        config.initial_backoff = Duration::from_millis(50);
        config.max_backoff = Duration::from_millis(100);

        let connector = Arc::new(StalledConnector::default());
        let (mut gw, _events) = Gateway::with_connector(
            Session::new(config),
            instruments(),
            connector.clone(),
            GatewayOptions::default(),
        );
        gw.start().unwrap();
        gw.wait_ready(Duration::from_secs(2)).await.unwrap();

        // The first heartbeat write stalls; the worker drops the link
        gw.wait_for_status(Duration::from_secs(2), |s| s.state == SessionState::Reconnecting)
            .await
            .unwrap();
        gw.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert!(connector.connections.load(Ordering::SeqCst) >= 2);

        // Logout stalls as well, yet shutdown is observed and bounded
        assert_eq!(gw.shutdown().await, Ok(()));
        assert_eq!(gw.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let (mut gw, _events) = unstarted(8);
        assert_eq!(
            gw.wait_ready(Duration::from_millis(20)).await,
            Err(GatewayError::Timeout("session status"))
        );
        // Never started, nothing to stop
        assert_eq!(gw.shutdown().await, Ok(()));
    }
}
