//! Gateway worker - the async loop around [`Engine`]
//!
//! One task per gateway. Each iteration executes pending actions, publishes
//! the session status, then waits on whichever comes first: a client
//! command, an inbound frame, or the session's next timer deadline.
//!
//! Actions run strictly in order, so a `Close` queued after sends is only
//! executed once those sends were written (or failed). A new transport is
//! never opened while the old one is still held.
//!
//! Every write is bounded by the send timeout. A write that times out
//! drops the transport on the spot, so the rest of the batch fails fast
//! and the loop gets back to its timers and commands.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use super::engine::{Action, Command, Engine};
use crate::codec::WireCodec;
use crate::logging::WIRE_TARGET;
use crate::messages::GatewayEvent;
use crate::session::SessionStatus;
use crate::transport::{Connector, Endpoint, Transport, TransportError};

enum Step {
    Command(Option<Command>),
    Frame(Result<Vec<u8>, TransportError>),
    Tick,
}

pub(crate) struct Worker {
    engine: Engine,
    connector: Arc<dyn Connector>,
    codec: WireCodec,
    endpoint: Endpoint,
    connect_timeout: Duration,
    receive_timeout: Duration,
    send_timeout: Duration,
    transport: Option<Box<dyn Transport>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    status: watch::Sender<SessionStatus>,
}

impl Worker {
    pub(crate) fn new(
        engine: Engine,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<GatewayEvent>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let config = engine.session().config();
        let codec = WireCodec::new(config.max_frame_bytes);
        let endpoint = config.endpoint.clone();
        let connect_timeout = config.connect_timeout;
        let receive_timeout = config.receive_timeout;
        let send_timeout = config.send_timeout;
        Self {
            engine,
            connector,
            codec,
            endpoint,
            connect_timeout,
            receive_timeout,
            send_timeout,
            transport: None,
            commands,
            events,
            status,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(endpoint = %self.endpoint, "Gateway worker started");
        self.engine.start(Instant::now());

        loop {
            self.execute().await;
            self.publish_status();
            if self.engine.is_terminated() {
                break;
            }

            let deadline = self.engine.next_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                frame = recv_frame(&mut self.transport, self.receive_timeout) => Step::Frame(frame),
                _ = sleep_until(deadline) => Step::Tick,
            };

            let now = Instant::now();
            match step {
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                    self.drain_commands(now);
                    self.engine.handle_command(now, Command::Shutdown);
                }
                Step::Command(Some(command)) => self.engine.handle_command(now, command),
                Step::Frame(Ok(frame)) => {
                    tracing::trace!(target: WIRE_TARGET, len = frame.len(), "Inbound frame");
                    self.engine.on_frame(now, &frame);
                }
                Step::Frame(Err(e)) if e.is_timeout() => self.engine.on_tick(now),
                Step::Frame(Err(e)) => self.engine.on_transport_error(now, &e),
                Step::Tick => self.engine.on_tick(now),
            }
        }

        // Sends queued by the shutdown step, then release
        self.execute().await;
        self.close_transport().await;
        self.publish_status();
        tracing::info!("Gateway worker stopped");
    }

    /// Apply queued commands before shutting down
    fn drain_commands(&mut self, now: Instant) {
        let mut drained = 0;
        while let Ok(command) = self.commands.try_recv() {
            if command != Command::Shutdown {
                self.engine.handle_command(now, command);
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::info!(drained, "Drained queued commands before shutdown");
        }
    }

    /// Run actions until the engine has none left
    async fn execute(&mut self) {
        loop {
            let actions = self.engine.drain_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    Action::Connect => self.connect().await,
                    Action::Send(msg) => {
                        let frame = match self.codec.encode(&msg) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!(seq = msg.seq, msg_type = msg.msg_type(), error = %e, "Outbound message failed to encode");
                                continue;
                            }
                        };
                        tracing::trace!(target: WIRE_TARGET, seq = msg.seq, msg_type = msg.msg_type(), len = frame.len(), "Outbound frame");
                        let result = match self.transport.as_mut() {
                            Some(transport) => transport.send(&frame, self.send_timeout).await,
                            None => Err(TransportError::Closed),
                        };
                        if let Err(e) = result {
                            if e.is_timeout() {
                                tracing::warn!(seq = msg.seq, msg_type = msg.msg_type(), error = %e, "Send stalled, dropping transport");
                                self.close_transport().await;
                            }
                            self.engine.on_send_failed(Instant::now(), &e);
                        }
                    }
                    Action::Close => self.close_transport().await,
                    Action::Emit(event) => {
                        // Receiver gone means nobody is listening
                        let _ = self.events.send(event);
                    }
                }
            }
        }
    }

    async fn connect(&mut self) {
        self.close_transport().await;
        let result = self
            .connector
            .connect(&self.endpoint, self.connect_timeout, self.codec.max_frame_bytes())
            .await;
        let now = Instant::now();
        match result {
            Ok(transport) => {
                tracing::info!(peer = transport.peer(), "Transport connected");
                self.transport = Some(transport);
                self.engine.on_connected(now);
            }
            Err(e) => self.engine.on_connect_failed(now, &e),
        }
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn publish_status(&self) {
        let status = self.engine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn recv_frame(
    transport: &mut Option<Box<dyn Transport>>,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    match transport {
        Some(transport) => transport.receive(timeout).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
