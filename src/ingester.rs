// =============================================================================
// Ingester Client — historical-bar sync and discovery endpoints
// =============================================================================
//
// The ingester owns symbol discovery and historical bar fetches upstream.
// `sync` is retried up to three times with a widening pause because the
// upstream fetch can ride through broker rate limits; discovery calls are
// single-shot.
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::IngesterSettings;
use crate::error::IngesterError;

/// Sync attempts before the error surfaces to the caller.
const SYNC_ATTEMPTS: u32 = 3;
/// Base pause between attempts; doubles each retry.
const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// One bar row as returned by the ingester.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRow {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: i64,
}

/// Synced bars for one (symbol, exchange, granularity) series.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncItem {
    #[serde(alias = "symbol")]
    pub stock: String,
    pub exchange: String,
    pub granularity: String,
    #[serde(default)]
    pub rows: Vec<SyncRow>,
}

/// The ingester surface the run worker consumes.
#[async_trait]
pub trait MarketDataSync: Send + Sync {
    /// Trigger a historical sync and return the fetched rows.
    async fn sync(
        &self,
        stocks: &[String],
        exchanges: &[String],
        granularity: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<SyncItem>, IngesterError>;

    /// Known symbols, optionally restricted to one exchange.
    async fn get_symbols(&self, exchange: Option<&str>) -> Result<Vec<String>, IngesterError>;
}

/// HTTP client for the ingester service.
pub struct IngesterClient {
    settings: IngesterSettings,
    http: reqwest::Client,
}

impl IngesterClient {
    pub fn new(settings: IngesterSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .expect("failed to build reqwest client");
        debug!(base_url = %settings.base_url, "ingester client initialised");
        Self { settings, http }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, IngesterError> {
        let url = format!("{}{path}", self.settings.base_url);
        let response = self.http.get(&url).query(query).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(IngesterError::Api {
                status: status.as_u16(),
                message: body["error"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string()),
            });
        }
        Ok(body)
    }

    async fn sync_once(
        &self,
        stocks: &[String],
        exchanges: &[String],
        granularity: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<SyncItem>, IngesterError> {
        let url = format!("{}/sync", self.settings.base_url);
        let payload = serde_json::json!({
            "payload": {
                "stocks": stocks,
                "exchanges": exchanges,
                "granularity": granularity,
                "start_date": start_date,
                "end_date": end_date,
            }
        });

        let response = self.http.post(&url).json(&payload).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(IngesterError::Api {
                status: status.as_u16(),
                message: body["error"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string()),
            });
        }

        let items = body
            .get("items")
            .cloned()
            .ok_or_else(|| IngesterError::Malformed("sync response missing items".into()))?;
        serde_json::from_value(items)
            .map_err(|e| IngesterError::Malformed(format!("bad sync items: {e}")))
    }

    #[instrument(skip(self), name = "ingester::get_exchanges")]
    pub async fn get_exchanges(&self) -> Result<Vec<String>, IngesterError> {
        let body = self.get_json("/exchanges", &[]).await?;
        parse_string_array(&body, "exchanges")
    }

    #[instrument(skip(self), name = "ingester::get_granularities")]
    pub async fn get_granularities(&self) -> Result<Vec<String>, IngesterError> {
        let body = self.get_json("/granularities", &[]).await?;
        parse_string_array(&body, "granularities")
    }
}

#[async_trait]
impl MarketDataSync for IngesterClient {
    #[instrument(skip(self, stocks), name = "ingester::sync",
                 fields(count = stocks.len(), granularity))]
    async fn sync(
        &self,
        stocks: &[String],
        exchanges: &[String],
        granularity: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<SyncItem>, IngesterError> {
        let mut last_error = None;
        for attempt in 1..=SYNC_ATTEMPTS {
            match self
                .sync_once(stocks, exchanges, granularity, start_date, end_date)
                .await
            {
                Ok(items) => {
                    info!(attempt, items = items.len(), "sync completed");
                    return Ok(items);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "sync attempt failed");
                    last_error = Some(err);
                    if attempt < SYNC_ATTEMPTS {
                        tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_error.expect("at least one sync attempt ran"))
    }

    #[instrument(skip(self), name = "ingester::get_symbols")]
    async fn get_symbols(&self, exchange: Option<&str>) -> Result<Vec<String>, IngesterError> {
        let query: Vec<(&str, &str)> = exchange.map(|e| ("exchange", e)).into_iter().collect();
        let body = self.get_json("/symbols", &query).await?;
        parse_string_array(&body, "symbols")
    }
}

fn parse_string_array(body: &Value, field: &str) -> Result<Vec<String>, IngesterError> {
    body[field]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| IngesterError::Malformed(format!("response missing '{field}' array")))
}

impl std::fmt::Debug for IngesterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngesterClient")
            .field("base_url", &self.settings.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_array_parsing() {
        let body = serde_json::json!({"symbols": ["RELIANCE", "TCS", 42]});
        assert_eq!(parse_string_array(&body, "symbols").unwrap(), vec!["RELIANCE", "TCS"]);
        assert!(parse_string_array(&body, "exchanges").is_err());
    }

    #[test]
    fn sync_items_deserialise_with_symbol_alias() {
        let items = serde_json::json!([
            {
                "symbol": "RELIANCE",
                "exchange": "NSE",
                "granularity": "3minute",
                "rows": [
                    {"date": "2026-01-20 09:15:00", "open": 100.0, "high": 101.0,
                     "low": 99.0, "close": 100.5, "volume": 1200}
                ]
            }
        ]);
        let parsed: Vec<SyncItem> = serde_json::from_value(items).unwrap();
        assert_eq!(parsed[0].stock, "RELIANCE");
        assert_eq!(parsed[0].rows.len(), 1);
        assert!((parsed[0].rows[0].open - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sync_items_tolerate_missing_rows() {
        let items = serde_json::json!([
            {"stock": "TCS", "exchange": "NSE", "granularity": "day"}
        ]);
        let parsed: Vec<SyncItem> = serde_json::from_value(items).unwrap();
        assert!(parsed[0].rows.is_empty());
    }
}
