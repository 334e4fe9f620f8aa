// =============================================================================
// Bar Store Adapter — OHLCV reads and the ingester-facing upsert
// =============================================================================
//
// Bars are read-only for the workflow; the only write path is the upsert of
// rows returned by an ingester sync, keyed on the full
// (stock, exchange, granularity, record_time) quadruple so replays converge.
// Timestamps are normalised to exchange-local time at this boundary.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use sqlx::Row;

use super::{format_datetime, parse_datetime, Store};

/// One OHLCV candle as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub stock: String,
    pub exchange: String,
    pub granularity: String,
    /// Exchange-local timestamp of the bar open.
    pub record_time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// IST offset — both supported exchanges trade in UTC+05:30.
const EXCHANGE_OFFSET_SECS: i32 = 5 * 3600 + 1800;

/// Normalise an upstream timestamp to exchange-local naive time.
///
/// Accepts RFC 2822 ("Mon, 20 Jan 2025 03:45:00 GMT"), RFC 3339 / ISO with an
/// offset, and already-local "YYYY-MM-DD HH:MM:SS" / "YYYY-MM-DDTHH:MM:SS"
/// strings. Offset-carrying inputs are shifted into IST before the offset is
/// dropped.
pub fn normalise_record_time(raw: &str) -> Result<NaiveDateTime> {
    let ist = FixedOffset::east_opt(EXCHANGE_OFFSET_SECS).expect("static offset");

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Ok(dt.with_timezone(&ist).naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&ist).naive_local());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .with_context(|| format!("unrecognised record_time '{raw}'"))
}

impl Store {
    /// Upsert a batch of bars in a single transaction.
    pub async fn upsert_bars(&self, bars: &[Bar]) -> Result<u64> {
        let mut tx = self.pool().begin().await.context("begin bar upsert")?;
        for bar in bars {
            sqlx::query(
                "INSERT OR REPLACE INTO bars \
                 (stock, exchange, granularity, record_time, open, high, low, close, volume) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&bar.stock)
            .bind(&bar.exchange)
            .bind(&bar.granularity)
            .bind(format_datetime(bar.record_time))
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await
            .context("upsert bar")?;
        }
        tx.commit().await.context("commit bar upsert")?;
        Ok(bars.len() as u64)
    }

    /// Bars for one series, ascending by record_time, bounds inclusive.
    /// An empty result is legitimate and propagates as such.
    pub async fn get_bars(
        &self,
        stock: &str,
        exchange: &str,
        granularity: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
        limit: Option<i64>,
    ) -> Result<Vec<Bar>> {
        let mut sql = String::from(
            "SELECT stock, exchange, granularity, record_time, open, high, low, close, volume \
             FROM bars \
             WHERE stock = ? AND exchange = ? AND granularity = ? \
               AND record_time >= ? AND record_time <= ? \
             ORDER BY record_time ASC",
        );
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let rows = sqlx::query(&sql)
            .bind(stock)
            .bind(exchange)
            .bind(granularity)
            .bind(format_datetime(from))
            .bind(format_datetime(to))
            .fetch_all(self.pool())
            .await
            .context("query bars")?;

        rows.into_iter()
            .map(|row| {
                Ok(Bar {
                    stock: row.get("stock"),
                    exchange: row.get("exchange"),
                    granularity: row.get("granularity"),
                    record_time: parse_datetime(row.get("record_time"))?,
                    open: row.get("open"),
                    high: row.get("high"),
                    low: row.get("low"),
                    close: row.get("close"),
                    volume: row.get("volume"),
                })
            })
            .collect()
    }
}
