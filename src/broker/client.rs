// =============================================================================
// Broker REST Client — quotes, market orders, GTT triggers
// =============================================================================
//
// Kite-style surface: every response wraps its payload in a `data` envelope,
// authentication rides in an `Authorization: token api_key:access_token`
// header, and orders are asynchronous — placement returns an order id which
// must be polled until it reaches a terminal status.
//
// A 401 triggers exactly one session renewal followed by one retry of the
// failed request; renewal exchanges the configured request token using the
// SHA-256 checksum from `session.rs`.
// =============================================================================

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::types::OrderSide;

use super::session::Session;
use super::{GttKind, GttLeg, Instrument, OrderGateway, OrderReceipt, OrderRequest, Quote};

/// Order statuses after which the broker will not change an order again.
const TERMINAL_STATUSES: &[&str] = &["COMPLETE", "REJECTED", "CANCELLED"];

/// Broker REST client. Cheap to clone via `Arc` at the composition root.
pub struct BrokerClient {
    settings: BrokerSettings,
    session: Session,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(settings: BrokerSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .expect("failed to build reqwest client");
        let session = Session::new(
            settings.api_key.clone(),
            settings.api_secret.clone(),
            settings.request_token.clone(),
        );
        debug!(base_url = %settings.base_url, "broker client initialised");
        Self {
            settings,
            session,
            http,
        }
    }

    // -------------------------------------------------------------------------
    // Session renewal
    // -------------------------------------------------------------------------

    /// Exchange the request token for a fresh access token.
    async fn renew_session(&self) -> Result<(), BrokerError> {
        let url = format!("{}/session/token", self.settings.base_url);
        let checksum = self.session.checksum();
        let response = self
            .http
            .post(&url)
            .form(&[
                ("api_key", self.session.api_key()),
                ("request_token", self.session.request_token()),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(BrokerError::Auth(format!(
                "token exchange returned {}: {}",
                status,
                body["message"].as_str().unwrap_or("unknown error")
            )));
        }
        let token = body["data"]["access_token"]
            .as_str()
            .ok_or_else(|| BrokerError::Auth("token exchange response missing access_token".into()))?;
        self.session.set_access_token(token.to_string());
        info!("broker session renewed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send one authorised request described by `build`; on a 401 renew the
    /// session once and retry once.
    async fn send_authorised(
        &self,
        build: impl Fn(&reqwest::Client, Option<String>) -> reqwest::RequestBuilder,
    ) -> Result<Value, BrokerError> {
        if self.session.auth_header().is_none() {
            self.renew_session().await?;
        }

        let response = build(&self.http, self.session.auth_header()).send().await?;
        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("broker returned 401 — renewing session and retrying once");
            self.renew_session().await?;
            build(&self.http, self.session.auth_header()).send().await?
        } else {
            response
        };

        let status = response.status();
        let body: Value = response.json().await?;
        unwrap_envelope(status.as_u16(), body)
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::get_ltp")]
    pub async fn ltp(&self, stock: &str, exchange: &str) -> Result<f64, BrokerError> {
        let key = format!("{exchange}:{stock}");
        let url = format!("{}/quote/ltp", self.settings.base_url);
        let data = self
            .send_authorised(|http, auth| {
                authorise(http.get(&url).query(&[("i", key.as_str())]), auth)
            })
            .await?;
        data[&key]["last_price"]
            .as_f64()
            .ok_or_else(|| BrokerError::Malformed(format!("no ltp data for {key}")))
    }

    #[instrument(skip(self), name = "broker::get_quote")]
    pub async fn quote(&self, stock: &str, exchange: &str) -> Result<Quote, BrokerError> {
        let key = format!("{exchange}:{stock}");
        let url = format!("{}/quote", self.settings.base_url);
        let data = self
            .send_authorised(|http, auth| {
                authorise(http.get(&url).query(&[("i", key.as_str())]), auth)
            })
            .await?;
        let entry = data
            .get(&key)
            .ok_or_else(|| BrokerError::Malformed(format!("no quote data for {key}")))?;

        Ok(Quote {
            stock: stock.to_string(),
            exchange: exchange.to_string(),
            last_price: entry["last_price"]
                .as_f64()
                .ok_or_else(|| BrokerError::Malformed(format!("quote for {key} has no last_price")))?,
            open: entry["ohlc"]["open"].as_f64(),
            high: entry["ohlc"]["high"].as_f64(),
            low: entry["ohlc"]["low"].as_f64(),
            close: entry["ohlc"]["close"].as_f64(),
            volume: entry["volume"].as_i64(),
            bid: entry["depth"]["buy"][0]["price"].as_f64(),
            ask: entry["depth"]["sell"][0]["price"].as_f64(),
            timestamp: entry["timestamp"].as_str().map(str::to_string),
        })
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::list_instruments")]
    pub async fn list_instruments(&self, exchange: &str) -> Result<Vec<Instrument>, BrokerError> {
        let url = format!("{}/instruments/{exchange}", self.settings.base_url);
        let data = self
            .send_authorised(|http, auth| authorise(http.get(&url), auth))
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| BrokerError::Malformed("instruments response is not an array".into()))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Instrument {
                    tradingsymbol: row["tradingsymbol"].as_str()?.to_string(),
                    instrument_token: row["instrument_token"].as_i64()?,
                    exchange: row["exchange"].as_str()?.to_string(),
                })
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a market order and poll it to a terminal status.
    #[instrument(skip(self, request), name = "broker::place_order",
                 fields(stock = %request.stock, side = %request.side))]
    pub async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderReceipt, BrokerError> {
        let ltp = self.ltp(&request.stock, &request.exchange).await?;

        let (quantity, money_provided) = match request.side {
            OrderSide::Buy => {
                let money = request.money.filter(|m| *m > 0.0).ok_or_else(|| {
                    BrokerError::OrderFailed {
                        order_id: None,
                        status: "INVALID".into(),
                        message: "buy orders require money > 0".into(),
                    }
                })?;
                let shares = shares_for_money(money, ltp)?;
                (shares, Some(money))
            }
            OrderSide::Sell => {
                let quantity = request.quantity.filter(|q| *q > 0).ok_or_else(|| {
                    BrokerError::OrderFailed {
                        order_id: None,
                        status: "INVALID".into(),
                        message: "sell orders require quantity > 0".into(),
                    }
                })?;
                (quantity, None)
            }
        };

        let transaction_type = match request.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let url = format!("{}/orders/{}", self.settings.base_url, self.settings.variety);
        let quantity_str = quantity.to_string();
        let data = self
            .send_authorised(|http, auth| {
                authorise(
                    http.post(&url).form(&[
                        ("tradingsymbol", request.stock.as_str()),
                        ("exchange", request.exchange.as_str()),
                        ("transaction_type", transaction_type),
                        ("quantity", quantity_str.as_str()),
                        ("order_type", self.settings.order_type.as_str()),
                        ("product", self.settings.product.as_str()),
                    ]),
                    auth,
                )
            })
            .await?;

        let order_id = data["order_id"]
            .as_str()
            .ok_or_else(|| BrokerError::Malformed("order response missing order_id".into()))?
            .to_string();
        info!(order_id = %order_id, quantity, "order placed — waiting for completion");

        let order = self.wait_for_completion(&order_id).await?;
        Ok(build_receipt(request, &order_id, &order, ltp, money_provided))
    }

    /// Poll the order book until `order_id` is terminal or the configured
    /// timeout elapses.
    async fn wait_for_completion(&self, order_id: &str) -> Result<Value, BrokerError> {
        let url = format!("{}/orders", self.settings.base_url);
        let deadline = tokio::time::Instant::now() + self.settings.order_timeout;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::OrderFailed {
                    order_id: Some(order_id.to_string()),
                    status: "TIMEOUT".into(),
                    message: format!(
                        "order {order_id} not terminal after {:?}",
                        self.settings.order_timeout
                    ),
                });
            }

            match self
                .send_authorised(|http, auth| authorise(http.get(&url), auth))
                .await
            {
                Ok(data) => {
                    if let Some(order) = find_order(&data, order_id) {
                        let status = order["status"].as_str().unwrap_or("");
                        if TERMINAL_STATUSES.contains(&status) {
                            if status == "COMPLETE" {
                                return Ok(order.clone());
                            }
                            return Err(BrokerError::OrderFailed {
                                order_id: Some(order_id.to_string()),
                                status: status.to_string(),
                                message: order["status_message"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string(),
                            });
                        }
                        debug!(order_id, status, "order still pending");
                    }
                }
                Err(err) => warn!(order_id, error = %err, "order status poll failed"),
            }

            tokio::time::sleep(self.settings.order_poll_interval).await;
        }
    }

    // -------------------------------------------------------------------------
    // GTT triggers
    // -------------------------------------------------------------------------

    /// Place a GTT trigger. OCO triggers must bracket the last price:
    /// stop-loss below it, target above it.
    #[instrument(skip(self, legs), name = "broker::place_gtt", fields(stock = %stock))]
    pub async fn place_gtt(
        &self,
        kind: GttKind,
        stock: &str,
        exchange: &str,
        trigger_values: &[f64],
        last_price: f64,
        legs: &[GttLeg],
    ) -> Result<i64, BrokerError> {
        validate_gtt(kind, trigger_values, last_price, legs)?;

        let condition = serde_json::json!({
            "exchange": exchange,
            "tradingsymbol": stock,
            "trigger_values": trigger_values,
            "last_price": last_price,
        });
        let orders: Vec<Value> = legs
            .iter()
            .map(|leg| {
                serde_json::json!({
                    "exchange": exchange,
                    "tradingsymbol": stock,
                    "transaction_type": match leg.side {
                        OrderSide::Buy => "BUY",
                        OrderSide::Sell => "SELL",
                    },
                    "quantity": leg.quantity,
                    "order_type": "LIMIT",
                    "product": self.settings.product,
                    "price": leg.limit_price,
                })
            })
            .collect();

        let url = format!("{}/gtt/triggers", self.settings.base_url);
        let condition_str = condition.to_string();
        let orders_str = Value::Array(orders).to_string();
        let data = self
            .send_authorised(|http, auth| {
                authorise(
                    http.post(&url).form(&[
                        ("type", kind.as_str()),
                        ("condition", condition_str.as_str()),
                        ("orders", orders_str.as_str()),
                    ]),
                    auth,
                )
            })
            .await?;

        data["trigger_id"]
            .as_i64()
            .ok_or_else(|| BrokerError::Malformed("gtt response missing trigger_id".into()))
    }
}

#[async_trait]
impl OrderGateway for BrokerClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError> {
        self.place_market_order(request).await
    }

    async fn get_ltp(&self, stock: &str, exchange: &str) -> Result<f64, BrokerError> {
        self.ltp(stock, exchange).await
    }

    async fn get_quote(&self, stock: &str, exchange: &str) -> Result<Quote, BrokerError> {
        self.quote(stock, exchange).await
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.settings.base_url)
            .field("session", &self.session)
            .finish()
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

fn authorise(
    builder: reqwest::RequestBuilder,
    auth: Option<String>,
) -> reqwest::RequestBuilder {
    match auth {
        Some(header) => builder.header("Authorization", header),
        None => builder,
    }
}

/// Strip the `data` envelope, mapping HTTP failures to `BrokerError::Api`.
fn unwrap_envelope(status: u16, body: Value) -> Result<Value, BrokerError> {
    if !(200..300).contains(&status) {
        return Err(BrokerError::Api {
            status,
            message: body["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string()),
        });
    }
    body.get("data")
        .cloned()
        .ok_or_else(|| BrokerError::Malformed("response missing data envelope".into()))
}

/// Whole shares affordable at `price`; zero shares is a terminal failure.
fn shares_for_money(money: f64, price: f64) -> Result<i64, BrokerError> {
    let shares = (money / price).floor() as i64;
    if shares <= 0 {
        return Err(BrokerError::OrderFailed {
            order_id: None,
            status: "REJECTED".into(),
            message: format!("insufficient funds: {money:.2} buys no shares at {price:.2}"),
        });
    }
    Ok(shares)
}

fn find_order<'a>(orders: &'a Value, order_id: &str) -> Option<&'a Value> {
    orders
        .as_array()?
        .iter()
        .find(|order| order["order_id"].as_str() == Some(order_id))
}

/// Shape a COMPLETE order record into a receipt. The executed price falls
/// back to the pre-order LTP when the broker omits average_price.
fn build_receipt(
    request: &OrderRequest,
    order_id: &str,
    order: &Value,
    ltp: f64,
    money_provided: Option<f64>,
) -> OrderReceipt {
    let price = order["average_price"].as_f64().filter(|p| *p > 0.0).unwrap_or(ltp);
    let shares = order["filled_quantity"].as_i64().unwrap_or(0);
    let total_amount = shares as f64 * price;

    OrderReceipt {
        order_id: order_id.to_string(),
        status: "COMPLETE".into(),
        side: request.side,
        stock: request.stock.clone(),
        exchange: request.exchange.clone(),
        shares,
        price_per_share: price,
        total_amount,
        money_remaining: money_provided.map(|money| money - total_amount),
        money_provided,
        order_timestamp: order["order_timestamp"].as_str().map(str::to_string),
        exchange_timestamp: order["exchange_timestamp"].as_str().map(str::to_string),
    }
}

/// Trigger-leg validation. Single triggers need one value and one leg; OCO
/// triggers need ascending [stop_loss, target] bracketing the last price and
/// two sell legs.
fn validate_gtt(
    kind: GttKind,
    trigger_values: &[f64],
    last_price: f64,
    legs: &[GttLeg],
) -> Result<(), BrokerError> {
    match kind {
        GttKind::Single => {
            if trigger_values.len() != 1 || legs.len() != 1 {
                return Err(BrokerError::InvalidTrigger(
                    "single gtt requires exactly one trigger value and one leg".into(),
                ));
            }
        }
        GttKind::Oco => {
            if trigger_values.len() != 2 || legs.len() != 2 {
                return Err(BrokerError::InvalidTrigger(
                    "oco gtt requires exactly two trigger values and two legs".into(),
                ));
            }
            let (stop_loss, target) = (trigger_values[0], trigger_values[1]);
            if stop_loss >= last_price {
                return Err(BrokerError::InvalidTrigger(format!(
                    "stop-loss {stop_loss} must be below last price {last_price}"
                )));
            }
            if target <= last_price {
                return Err(BrokerError::InvalidTrigger(format!(
                    "target {target} must be above last price {last_price}"
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_unwraps_data() {
        let body = serde_json::json!({"status": "success", "data": {"order_id": "1"}});
        let data = unwrap_envelope(200, body).unwrap();
        assert_eq!(data["order_id"], "1");
    }

    #[test]
    fn envelope_surfaces_api_errors() {
        let body = serde_json::json!({"status": "error", "message": "Invalid session"});
        match unwrap_envelope(403, body) {
            Err(BrokerError::Api { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "Invalid session");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn shares_round_down_to_whole_units() {
        assert_eq!(shares_for_money(30_000.0, 100.0).unwrap(), 300);
        assert_eq!(shares_for_money(30_050.0, 100.0).unwrap(), 300);
        assert!(shares_for_money(50.0, 100.0).is_err());
    }

    #[test]
    fn receipt_tracks_money_for_buys() {
        let request = OrderRequest {
            stock: "RELIANCE".into(),
            exchange: "NSE".into(),
            side: OrderSide::Buy,
            money: Some(30_050.0),
            quantity: None,
        };
        let order = serde_json::json!({
            "order_id": "X1",
            "status": "COMPLETE",
            "filled_quantity": 300,
            "average_price": 100.0,
            "order_timestamp": "2026-01-20 09:15:02",
        });
        let receipt = build_receipt(&request, "X1", &order, 99.5, Some(30_050.0));
        assert_eq!(receipt.shares, 300);
        assert!((receipt.total_amount - 30_000.0).abs() < 1e-9);
        assert_eq!(receipt.money_provided, Some(30_050.0));
        assert!((receipt.money_remaining.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn receipt_falls_back_to_ltp_without_average_price() {
        let request = OrderRequest {
            stock: "TCS".into(),
            exchange: "NSE".into(),
            side: OrderSide::Sell,
            money: None,
            quantity: Some(10),
        };
        let order = serde_json::json!({
            "order_id": "X2",
            "status": "COMPLETE",
            "filled_quantity": 10,
            "average_price": 0.0,
        });
        let receipt = build_receipt(&request, "X2", &order, 102.0, None);
        assert!((receipt.price_per_share - 102.0).abs() < 1e-9);
        assert!((receipt.total_amount - 1020.0).abs() < 1e-9);
        assert!(receipt.money_provided.is_none());
    }

    #[test]
    fn oco_triggers_must_bracket_last_price() {
        let legs = vec![
            GttLeg { side: OrderSide::Sell, quantity: 10, limit_price: 95.0 },
            GttLeg { side: OrderSide::Sell, quantity: 10, limit_price: 110.0 },
        ];
        assert!(validate_gtt(GttKind::Oco, &[95.0, 110.0], 100.0, &legs).is_ok());
        // Stop-loss above last price.
        assert!(validate_gtt(GttKind::Oco, &[101.0, 110.0], 100.0, &legs).is_err());
        // Target below last price.
        assert!(validate_gtt(GttKind::Oco, &[95.0, 99.0], 100.0, &legs).is_err());
        // Wrong arity.
        assert!(validate_gtt(GttKind::Oco, &[95.0], 100.0, &legs).is_err());
    }

    #[test]
    fn single_trigger_arity() {
        let leg = vec![GttLeg { side: OrderSide::Sell, quantity: 10, limit_price: 95.0 }];
        assert!(validate_gtt(GttKind::Single, &[95.0], 100.0, &leg).is_ok());
        assert!(validate_gtt(GttKind::Single, &[95.0, 96.0], 100.0, &leg).is_err());
    }

    #[test]
    fn order_lookup_by_id() {
        let orders = serde_json::json!([
            {"order_id": "A", "status": "OPEN"},
            {"order_id": "B", "status": "COMPLETE"},
        ]);
        assert_eq!(find_order(&orders, "B").unwrap()["status"], "COMPLETE");
        assert!(find_order(&orders, "C").is_none());
    }
}
