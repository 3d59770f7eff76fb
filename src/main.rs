//! ctp_gateway - trading gateway runner
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Gateway  │───▶│ Session  │───▶│ Exchange │
//! │  (YAML)  │    │ (facade) │    │ (worker) │    │  front   │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `ctp_gateway [--env dev] [--sim]`
//!
//! `--sim` starts the in-process simulated exchange and points the session
//! at it instead of the configured endpoint.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use ctp_gateway::config::AppConfig;
use ctp_gateway::gateway::{EventReceiver, Gateway};
use ctp_gateway::messages::{GatewayEvent, MarketEvent, OrderEvent};
use ctp_gateway::session::Session;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_sim_mode() -> bool {
    std::env::args().any(|a| a == "--sim")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading config for env '{}'", env))?;
    let _log_guard = ctp_gateway::logging::init_logging(&app_config);

    tracing::info!(env = %env, version = env!("GIT_HASH"), "Starting ctp_gateway");

    let mut session_config = app_config.session_config()?;

    #[cfg(feature = "sim-exchange")]
    let _sim = if use_sim_mode() {
        let sim = ctp_gateway::sim::SimExchange::start()
            .await
            .context("starting simulated exchange")?;
        session_config.endpoint = sim.endpoint();
        Some(sim)
    } else {
        None
    };
    #[cfg(not(feature = "sim-exchange"))]
    let _sim: Option<()> = if use_sim_mode() {
        anyhow::bail!("--sim requires the sim-exchange feature");
    } else {
        None
    };

    tracing::info!(endpoint = %session_config.endpoint, user_id = %session_config.credentials.user_id, "Session configured");

    let instruments = Arc::new(app_config.instrument_manager()?);
    let (mut gateway, events) = Gateway::new(
        Session::new(session_config),
        instruments,
        app_config.gateway_options(),
    );
    gateway.start()?;

    for instrument in &app_config.subscriptions {
        gateway.subscribe_market_data(instrument)?;
    }

    let login_wait = Duration::from_millis(app_config.timeouts.connect_ms + app_config.timeouts.login_ms);
    match gateway.wait_ready(login_wait).await {
        Ok(()) => {
            let status = gateway.status();
            tracing::info!(trading_day = %status.trading_day, session_id = ?status.session_id, "Gateway ready");
            if let Err(e) = gateway.query_account() {
                tracing::warn!(error = %e, "Account query not sent");
            }
        }
        Err(e) => tracing::warn!(error = %e, code = e.code(), "Gateway not ready yet"),
    }

    let log_task = tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Ctrl-C received, shutting down");

    let result = gateway.shutdown().await;
    drop(gateway);
    // Sender side is gone once the worker exits
    let _ = log_task.await;
    result?;
    Ok(())
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Session(ev) => {
                tracing::info!(from = %ev.from, to = %ev.to, reason = %ev.reason, "Session event");
            }
            GatewayEvent::Order(OrderEvent::Rejected {
                client_order_id,
                reason,
            }) => {
                tracing::warn!(client_order_id, reason = %reason, "Order rejected");
            }
            GatewayEvent::Order(ev) => {
                tracing::info!(client_order_id = ev.client_order_id(), event = ?ev, "Order event");
            }
            GatewayEvent::Market(MarketEvent::Depth { depth, .. }) => {
                tracing::debug!(
                    instrument = %depth.instrument,
                    last = %depth.last,
                    bid = ?depth.bids.first(),
                    ask = ?depth.asks.first(),
                    "Depth"
                );
            }
            GatewayEvent::Market(ev) => tracing::info!(event = ?ev, "Market event"),
            GatewayEvent::Account(balance) => {
                tracing::info!(
                    account_id = %balance.account_id,
                    balance = %balance.balance,
                    available = %balance.available,
                    margin = %balance.margin,
                    "Account"
                );
            }
        }
    }
}
