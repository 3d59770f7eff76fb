//! Instrument reference data
//!
//! Immutable after construction; shared read-only between the facade (for
//! synchronous validation) and the session worker.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{InstrumentId, Quantity};
use crate::messages::RejectReason;
use crate::models::{OrderRequest, PriceType};

/// Listing exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    /// Shanghai Stock Exchange
    Xshg,
    /// Shenzhen Stock Exchange
    Xshe,
    /// Shanghai Futures Exchange
    Shfe,
    /// Dalian Commodity Exchange
    Dce,
    /// Zhengzhou Commodity Exchange
    Czce,
    /// China Financial Futures Exchange
    Cffex,
    /// Shanghai International Energy Exchange
    Ine,
    /// Guangzhou Futures Exchange
    Gfex,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Xshg => "XSHG",
            Exchange::Xshe => "XSHE",
            Exchange::Shfe => "SHFE",
            Exchange::Dce => "DCE",
            Exchange::Czce => "CZCE",
            Exchange::Cffex => "CFFEX",
            Exchange::Ine => "INE",
            Exchange::Gfex => "GFEX",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "XSHG" => Ok(Exchange::Xshg),
            "XSHE" => Ok(Exchange::Xshe),
            "SHFE" => Ok(Exchange::Shfe),
            "DCE" => Ok(Exchange::Dce),
            "CZCE" => Ok(Exchange::Czce),
            // FFEX is the legacy spelling
            "CFFEX" | "FFEX" => Ok(Exchange::Cffex),
            "INE" => Ok(Exchange::Ine),
            "GFEX" => Ok(Exchange::Gfex),
            other => Err(format!("Unknown exchange: {}", other)),
        }
    }
}

/// Tradable contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub exchange: Exchange,
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Minimum order size in lots
    #[serde(default = "default_lot_size")]
    pub lot_size: Quantity,
    /// Contract multiplier (units per lot)
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

fn default_lot_size() -> Quantity {
    1
}

fn default_multiplier() -> u32 {
    1
}

/// Manages instrument name <-> ID mappings
#[derive(Debug, Clone, Default)]
pub struct InstrumentManager {
    name_to_id: FxHashMap<String, InstrumentId>,
    instruments: Vec<Instrument>,
}

impl InstrumentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, assigning dense IDs in order
    pub fn from_instruments(list: impl IntoIterator<Item = Instrument>) -> Result<Self, String> {
        let mut mgr = Self::new();
        for instrument in list {
            mgr.insert(instrument)?;
        }
        Ok(mgr)
    }

    pub fn insert(&mut self, instrument: Instrument) -> Result<InstrumentId, String> {
        if self.name_to_id.contains_key(&instrument.name) {
            return Err(format!("Duplicate instrument: {}", instrument.name));
        }
        if instrument.tick_size <= Decimal::ZERO {
            return Err(format!("Instrument {} has non-positive tick size", instrument.name));
        }
        if instrument.lot_size == 0 {
            return Err(format!("Instrument {} has zero lot size", instrument.name));
        }
        let id = self.instruments.len() as InstrumentId;
        self.name_to_id.insert(instrument.name.clone(), id);
        self.instruments.push(instrument);
        Ok(id)
    }

    pub fn get_id(&self, name: &str) -> Option<InstrumentId> {
        self.name_to_id.get(name).copied()
    }

    pub fn get(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.get(id as usize)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Instrument> {
        self.get(self.get_id(name)?)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstrumentId, &Instrument)> {
        self.instruments
            .iter()
            .enumerate()
            .map(|(i, inst)| (i as InstrumentId, inst))
    }

    /// Local validation of an order request.
    ///
    /// Returns the instrument ID on success. Market orders skip the price check.
    pub fn validate_order(&self, request: &OrderRequest) -> Result<InstrumentId, RejectReason> {
        let id = self
            .get_id(&request.instrument)
            .ok_or(RejectReason::UnknownInstrument)?;
        let instrument = &self.instruments[id as usize];

        if request.quantity == 0 || request.quantity % instrument.lot_size != 0 {
            return Err(RejectReason::InvalidQuantity);
        }

        if request.price_type == PriceType::Limit {
            if request.price <= Decimal::ZERO {
                return Err(RejectReason::InvalidPrice);
            }
            if !(request.price % instrument.tick_size).is_zero() {
                return Err(RejectReason::InvalidPrice);
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn manager() -> InstrumentManager {
        InstrumentManager::from_instruments([
            Instrument {
                name: "rb2410".to_string(),
                exchange: Exchange::Shfe,
                tick_size: px("1"),
                lot_size: 1,
                multiplier: 10,
            },
            Instrument {
                name: "IF2409".to_string(),
                exchange: Exchange::Cffex,
                tick_size: px("0.2"),
                lot_size: 1,
                multiplier: 300,
            },
            Instrument {
                name: "sc2411".to_string(),
                exchange: Exchange::Ine,
                tick_size: px("0.1"),
                lot_size: 5,
                multiplier: 1000,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_dense_ids() {
        let mgr = manager();
        assert_eq!(mgr.len(), 3);
        assert_eq!(mgr.get_id("rb2410"), Some(0));
        assert_eq!(mgr.get_id("IF2409"), Some(1));
        assert_eq!(mgr.get(2).unwrap().name, "sc2411");
        assert!(mgr.get_id("nope").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut mgr = manager();
        let dup = mgr.get_by_name("rb2410").unwrap().clone();
        assert!(mgr.insert(dup).is_err());
    }

    #[test]
    fn test_validate_order() {
        let mgr = manager();
        let ok = OrderRequest::limit("IF2409", Side::Buy, px("3500.4"), 2);
        assert_eq!(mgr.validate_order(&ok), Ok(1));

        let off_tick = OrderRequest::limit("IF2409", Side::Buy, px("3500.3"), 2);
        assert_eq!(mgr.validate_order(&off_tick), Err(RejectReason::InvalidPrice));

        let zero_px = OrderRequest::limit("rb2410", Side::Sell, Decimal::ZERO, 1);
        assert_eq!(mgr.validate_order(&zero_px), Err(RejectReason::InvalidPrice));

        let zero_qty = OrderRequest::limit("rb2410", Side::Sell, px("3600"), 0);
        assert_eq!(mgr.validate_order(&zero_qty), Err(RejectReason::InvalidQuantity));

        let odd_lot = OrderRequest::limit("sc2411", Side::Buy, px("560.1"), 3);
        assert_eq!(mgr.validate_order(&odd_lot), Err(RejectReason::InvalidQuantity));

        let unknown = OrderRequest::market("ag2412", Side::Buy, 1);
        assert_eq!(mgr.validate_order(&unknown), Err(RejectReason::UnknownInstrument));

        // Market orders carry no price
        let market = OrderRequest::market("rb2410", Side::Buy, 1);
        assert_eq!(mgr.validate_order(&market), Ok(0));
    }

    #[test]
    fn test_exchange_parse() {
        assert_eq!("shfe".parse::<Exchange>(), Ok(Exchange::Shfe));
        assert_eq!("FFEX".parse::<Exchange>(), Ok(Exchange::Cffex));
        assert!("LME".parse::<Exchange>().is_err());
        assert_eq!(Exchange::Gfex.to_string(), "GFEX");
    }
}
