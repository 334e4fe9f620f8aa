// =============================================================================
// Broker Adapter — order gateway trait and wire types
// =============================================================================
//
// The dispatcher depends on `OrderGateway`, not on the concrete REST client,
// so tests (and a future second broker) can stand in a mock. The concrete
// client lives in `client.rs`; token management in `session.rs`.
// =============================================================================

pub mod client;
pub mod session;

pub use client::BrokerClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::OrderSide;

/// A buy order is sized by money, a sell order by share quantity.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub stock: String,
    pub exchange: String,
    pub side: OrderSide,
    pub money: Option<f64>,
    pub quantity: Option<i64>,
}

/// Terminal result of a placed order, shaped for the task-output table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub status: String,
    pub side: OrderSide,
    pub stock: String,
    pub exchange: String,
    /// Shares bought (buy) or sold (sell).
    pub shares: i64,
    pub price_per_share: f64,
    pub total_amount: f64,
    /// Buy only: the money the task supplied.
    pub money_provided: Option<f64>,
    /// Buy only: money left after rounding down to whole shares.
    pub money_remaining: Option<f64>,
    pub order_timestamp: Option<String>,
    pub exchange_timestamp: Option<String>,
}

/// Full quote snapshot for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub stock: String,
    pub exchange: String,
    pub last_price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub tradingsymbol: String,
    pub instrument_token: i64,
    pub exchange: String,
}

/// GTT trigger shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GttKind {
    Single,
    Oco,
}

impl GttKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Oco => "two-leg",
        }
    }
}

/// One order leg attached to a GTT trigger.
#[derive(Debug, Clone)]
pub struct GttLeg {
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: f64,
}

/// The order surface the dispatcher consumes.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place a market order and block until it is terminal or times out.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError>;

    /// Last traded price.
    async fn get_ltp(&self, stock: &str, exchange: &str) -> Result<f64, BrokerError>;

    /// Full quote snapshot.
    async fn get_quote(&self, stock: &str, exchange: &str) -> Result<Quote, BrokerError>;
}
