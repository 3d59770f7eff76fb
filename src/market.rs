//! Market data subscriptions
//!
//! Subscriptions outlive connections: the set is re-sent after every login.
//! The first snapshot per instrument in a session also carries the day's
//! static data (previous close, price limits) and yields a
//! [`MarketEvent::Static`] ahead of the depth event.

use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::Payload;
use crate::core_types::InstrumentId;
use crate::instrument::InstrumentManager;
use crate::messages::{DEPTH_LEVELS, Depth, MarketEvent, StaticInfo};

pub struct MarketData {
    instruments: Arc<InstrumentManager>,
    subscriptions: BTreeSet<String>,
    /// Instruments whose static data was emitted this session
    static_sent: FxHashSet<InstrumentId>,
    events: Vec<MarketEvent>,
}

impl MarketData {
    pub fn new(instruments: Arc<InstrumentManager>) -> Self {
        Self {
            instruments,
            subscriptions: BTreeSet::new(),
            static_sent: FxHashSet::default(),
            events: Vec::new(),
        }
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.subscriptions.contains(instrument)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    pub fn drain_events(&mut self) -> Vec<MarketEvent> {
        std::mem::take(&mut self.events)
    }

    /// Remember a subscription; returns the request to send if it is new
    pub fn subscribe(&mut self, instrument: &str) -> Option<Payload> {
        if !self.subscriptions.insert(instrument.to_string()) {
            return None;
        }
        Some(Payload::SubscribeRequest {
            instruments: vec![instrument.to_string()],
        })
    }

    pub fn unsubscribe(&mut self, instrument: &str) -> Option<Payload> {
        if !self.subscriptions.remove(instrument) {
            return None;
        }
        if let Some(id) = self.instruments.get_id(instrument) {
            self.static_sent.remove(&id);
        }
        Some(Payload::UnsubscribeRequest {
            instruments: vec![instrument.to_string()],
        })
    }

    /// New session: static data is due again, every subscription is re-sent
    pub fn on_login(&mut self) -> Option<Payload> {
        self.static_sent.clear();
        if self.subscriptions.is_empty() {
            return None;
        }
        tracing::info!(count = self.subscriptions.len(), "Re-subscribing market data");
        Some(Payload::SubscribeRequest {
            instruments: self.subscriptions.iter().cloned().collect(),
        })
    }

    pub fn on_subscribe_ack(&mut self, instrument: String, success: bool, error_msg: String) {
        if success {
            tracing::info!(instrument = %instrument, "Market data subscribed");
            self.events.push(MarketEvent::Subscribed { instrument });
        } else {
            tracing::warn!(instrument = %instrument, error = %error_msg, "Market data subscription failed");
            self.subscriptions.remove(&instrument);
            self.events.push(MarketEvent::SubscribeFailed {
                instrument,
                reason: error_msg,
            });
        }
    }

    pub fn on_unsubscribe_ack(&mut self, instrument: String) {
        self.events.push(MarketEvent::Unsubscribed { instrument });
    }

    pub fn on_market_data(
        &mut self,
        mut depth: Depth,
        trading_day: String,
        prev_close: Decimal,
        upper_limit: Decimal,
        lower_limit: Decimal,
    ) {
        let Some(instrument_id) = self.instruments.get_id(&depth.instrument) else {
            tracing::debug!(instrument = %depth.instrument, "Market data for unknown instrument dropped");
            return;
        };
        if !self.subscriptions.contains(&depth.instrument) {
            tracing::debug!(instrument = %depth.instrument, "Unsolicited market data dropped");
            return;
        }

        if self.static_sent.insert(instrument_id) {
            self.events.push(MarketEvent::Static {
                instrument_id,
                info: StaticInfo {
                    instrument: depth.instrument.clone(),
                    trading_day,
                    prev_close,
                    upper_limit,
                    lower_limit,
                },
            });
        }
        depth.bids.truncate(DEPTH_LEVELS);
        depth.asks.truncate(DEPTH_LEVELS);
        self.events.push(MarketEvent::Depth {
            instrument_id,
            depth,
        });
    }
}
