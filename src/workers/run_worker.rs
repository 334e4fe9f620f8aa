// =============================================================================
// Strategy-Run Worker — drives queued runs through the pattern miner
// =============================================================================
//
// Single-consumer polling loop: claim a queued run via CAS, resolve its
// symbol universe, sync and load each symbol's bars, mine one candidate per
// (symbol, continuous_days), and persist candidates in batches of ten. A run
// that throws anywhere ends `failed`; the loop itself never dies.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingester::MarketDataSync;
use crate::miner::{build_day_grid, mine_symbol, prune_inconsistent_days, Candidate, DayGrid};
use crate::pacing::Pacer;
use crate::store::bars::{normalise_record_time, Bar};
use crate::store::runs::StrategyRun;
use crate::store::Store;
use crate::types::{JobStatus, RunConfig};

/// Results are flushed to the store every this many candidates.
const RESULT_BATCH_SIZE: usize = 10;

/// Fixed allow-list used when a run asks for "all NSE" symbols.
pub const TOP_100_NSE_STOCKS: [&str; 100] = [
    "RELIANCE", "TCS", "HDFCBANK", "ICICIBANK", "BHARTIARTL", "INFY", "SBIN", "ITC",
    "HINDUNILVR", "LT", "BAJFINANCE", "HCLTECH", "MARUTI", "AXISBANK", "SUNPHARMA",
    "KOTAKBANK", "TITAN", "ONGC", "TATAMOTORS", "ADANIENT", "NTPC", "ASIANPAINT",
    "POWERGRID", "M&M", "ULTRACEMCO", "TATASTEEL", "BAJAJFINSV", "COALINDIA", "HINDALCO",
    "WIPRO", "JSWSTEEL", "IOC", "ADANIPORTS", "NESTLEIND", "GRASIM", "TECHM", "BPCL",
    "DRREDDY", "DIVISLAB", "BRITANNIA", "CIPLA", "EICHERMOT", "APOLLOHOSP", "HEROMOTOCO",
    "TATACONSUM", "SBILIFE", "BAJAJ-AUTO", "HDFCLIFE", "INDUSINDBK", "GODREJCP", "DABUR",
    "ADANIGREEN", "VEDL", "PIDILITIND", "SIEMENS", "HAVELLS", "DLF", "BANKBARODA",
    "AMBUJACEM", "GAIL", "SHREECEM", "ICICIPRULI", "ICICIGI", "TRENT", "TORNTPHARM",
    "JINDALSTEL", "PFC", "RECLTD", "CHOLAFIN", "INDIGO", "BHEL", "ABB", "CANBK",
    "TATAPOWER", "HAL", "IRFC", "ADANIPOWER", "BEL", "MARICO", "PNB", "ZOMATO",
    "UNIONBANK", "IOB", "IDBI", "NHPC", "IRCTC", "POLYCAB", "PERSISTENT", "MAXHEALTH",
    "MPHASIS", "COLPAL", "NAUKRI", "BERGEPAINT", "AUROPHARMA", "LUPIN", "BOSCHLTD",
    "HDFCAMC", "MUTHOOTFIN", "SBICARD", "COFORGE",
];

/// The polling worker for strategy runs.
pub struct RunWorker {
    store: Store,
    ingester: Arc<dyn MarketDataSync>,
    pacer: Arc<Pacer>,
    poll_interval: Duration,
}

impl RunWorker {
    pub fn new(
        store: Store,
        ingester: Arc<dyn MarketDataSync>,
        pacer: Arc<Pacer>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            ingester,
            pacer,
            poll_interval,
        }
    }

    /// Main polling loop. Runtime errors are logged and the loop continues;
    /// only cancellation stops it.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "strategy-run worker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("strategy-run worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "strategy-run tick failed");
                    }
                }
            }
        }
    }

    /// One poll: claim and process every queued run in FIFO order.
    pub async fn tick(&self) -> Result<()> {
        let queued = self.store.queued_runs().await?;
        if queued.is_empty() {
            debug!("no queued strategy runs");
            return Ok(());
        }
        info!(count = queued.len(), "found queued strategy runs");

        for run in queued {
            if !self
                .store
                .transition_run(&run.id, JobStatus::Queued, JobStatus::Running)
                .await?
            {
                // Another replica claimed it between the read and the CAS.
                continue;
            }

            info!(run_id = %run.id, "processing strategy run");
            match self.process_run(&run).await {
                Ok(saved) => {
                    self.store
                        .transition_run(&run.id, JobStatus::Running, JobStatus::Completed)
                        .await?;
                    info!(run_id = %run.id, results = saved, "strategy run completed");
                }
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "strategy run failed");
                    self.store
                        .transition_run(&run.id, JobStatus::Running, JobStatus::Failed)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Mine every (symbol, continuous_days) of the run's universe. Returns
    /// the number of persisted results.
    async fn process_run(&self, run: &StrategyRun) -> Result<usize> {
        let config: RunConfig =
            serde_json::from_str(&run.config).context("invalid run config blob")?;
        let today = Local::now().date_naive();
        let (start, end) = config.date_range(today);

        let mut saved = 0;
        for (exchange, stocks) in self.resolve_universe(&config).await? {
            saved += self
                .process_exchange(&run.id, &exchange, &stocks, &config, start, end)
                .await?;
        }
        Ok(saved)
    }

    /// Resolve per-exchange symbol lists from the config's explicit lists or
    /// include-all flags.
    async fn resolve_universe(&self, config: &RunConfig) -> Result<Vec<(String, Vec<String>)>> {
        let mut universe = Vec::new();

        let nse = if config.include_all_nse {
            info!("include_all_nse set — using the fixed top-100 allow-list");
            TOP_100_NSE_STOCKS.iter().map(|s| s.to_string()).collect()
        } else {
            config.nse_stocks.clone()
        };
        if !nse.is_empty() {
            universe.push(("NSE".to_string(), nse));
        }

        let bse = if config.include_all_bse {
            info!("include_all_bse set — fetching the BSE universe from the ingester");
            self.ingester
                .get_symbols(Some("BSE"))
                .await
                .context("failed to fetch BSE symbols")?
        } else {
            config.bse_stocks.clone()
        };
        if !bse.is_empty() {
            universe.push(("BSE".to_string(), bse));
        }

        Ok(universe)
    }

    async fn process_exchange(
        &self,
        run_id: &str,
        exchange: &str,
        stocks: &[String],
        config: &RunConfig,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize> {
        let total = stocks.len() * config.continuous_days.len();
        let mut processed = 0;
        let mut saved = 0;
        let mut batch: Vec<Candidate> = Vec::new();

        for stock in stocks {
            let stock = stock.as_str();
            self.pacer.admit().await;

            info!(stock, exchange, "processing symbol");
            let mut grid = self
                .load_symbol_grid(stock, exchange, config, start, end)
                .await?;
            if grid.is_empty() {
                info!(stock, exchange, "no bars for symbol — no signal");
                processed += config.continuous_days.len();
                continue;
            }
            prune_inconsistent_days(&mut grid);

            for &continuous_days in &config.continuous_days {
                processed += 1;
                info!(
                    stock,
                    exchange,
                    continuous_days,
                    processed,
                    total,
                    "evaluating symbol"
                );

                if let Some(candidate) = mine_symbol(
                    &grid,
                    stock,
                    exchange,
                    config.threshold_prob,
                    &config.horizontal_gaps,
                    continuous_days,
                    config.price_sample,
                ) {
                    batch.push(candidate);
                }

                if batch.len() >= RESULT_BATCH_SIZE {
                    info!(count = batch.len(), "persisting result batch");
                    self.store.insert_results(run_id, &batch).await?;
                    saved += batch.len();
                    batch.clear();
                }
            }
        }

        if !batch.is_empty() {
            info!(count = batch.len(), exchange, "persisting remaining results");
            self.store.insert_results(run_id, &batch).await?;
            saved += batch.len();
        }
        Ok(saved)
    }

    /// Sync one symbol through the ingester, upsert the returned rows, and
    /// load the stored series into a day grid.
    async fn load_symbol_grid(
        &self,
        stock: &str,
        exchange: &str,
        config: &RunConfig,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DayGrid> {
        let start_s = start.format("%Y-%m-%d").to_string();
        let end_s = end.format("%Y-%m-%d").to_string();

        let items = self
            .ingester
            .sync(
                &[stock.to_string()],
                &[exchange.to_string()],
                &config.granularity,
                &start_s,
                &end_s,
            )
            .await
            .with_context(|| format!("sync failed for {exchange}:{stock}"))?;

        let mut bars = Vec::new();
        for item in items {
            for row in &item.rows {
                match normalise_record_time(&row.date) {
                    Ok(record_time) => bars.push(Bar {
                        stock: item.stock.clone(),
                        exchange: item.exchange.clone(),
                        granularity: item.granularity.clone(),
                        record_time,
                        open: row.open,
                        high: row.high,
                        low: row.low,
                        close: row.close,
                        volume: row.volume,
                    }),
                    Err(err) => warn!(stock, date = %row.date, error = %err, "skipping bad bar row"),
                }
            }
        }
        self.store.upsert_bars(&bars).await?;

        let from = start.and_hms_opt(0, 0, 0).expect("midnight is valid");
        let to = end.and_hms_opt(23, 59, 59).expect("end of day is valid");
        let stored = self
            .store
            .get_bars(stock, exchange, &config.granularity, from, to, None)
            .await?;
        Ok(build_day_grid(&stored))
    }
}
