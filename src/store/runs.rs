// =============================================================================
// Strategy Runs & Results — persistence for the mining workflow
// =============================================================================
//
// A run is created `queued` by the API façade with its config blob attached;
// only the run worker advances it. Results are append-only while the parent
// run is running and are inserted in batches, one transaction per batch.
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::Row;

use super::{format_datetime, parse_datetime, Store};
use crate::miner::Candidate;
use crate::types::JobStatus;

/// One persisted strategy run.
#[derive(Debug, Clone)]
pub struct StrategyRun {
    pub id: String,
    /// Raw config blob; parsed into `RunConfig` by the worker.
    pub config: String,
    pub status: JobStatus,
    pub created_at: NaiveDateTime,
}

/// One mined result row.
#[derive(Debug, Clone)]
pub struct StrategyResult {
    pub id: i64,
    pub run_id: String,
    pub stock: String,
    pub exchange: String,
    /// Buy time-of-day, "HH:MM".
    pub x: String,
    /// Sell time-of-day, "HH:MM".
    pub y: String,
    pub exceed_prob: f64,
    pub profit_days: i64,
    pub average: f64,
    pub total_count: i64,
    pub highest: f64,
    pub p5: f64,
    pub p10: f64,
    pub p20: f64,
    pub p40: f64,
    pub p50: f64,
    pub vertical_gap: f64,
    pub horizontal_gap: i64,
    pub continuous_days: i64,
}

fn result_from_row(row: &sqlx::sqlite::SqliteRow) -> StrategyResult {
    StrategyResult {
        id: row.get("id"),
        run_id: row.get("run_id"),
        stock: row.get("stock"),
        exchange: row.get("exchange"),
        x: row.get("x"),
        y: row.get("y"),
        exceed_prob: row.get("exceed_prob"),
        profit_days: row.get("profit_days"),
        average: row.get("average"),
        total_count: row.get("total_count"),
        highest: row.get("highest"),
        p5: row.get("p5"),
        p10: row.get("p10"),
        p20: row.get("p20"),
        p40: row.get("p40"),
        p50: row.get("p50"),
        vertical_gap: row.get("vertical_gap"),
        horizontal_gap: row.get("horizontal_gap"),
        continuous_days: row.get("continuous_days"),
    }
}

impl Store {
    /// Create a run in `queued`. Called by the API façade only.
    pub async fn create_run(
        &self,
        id: &str,
        config_json: &str,
        created_at: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO strategy_runs (id, config, status, created_at) VALUES (?, ?, 'queued', ?)",
        )
        .bind(id)
        .bind(config_json)
        .bind(format_datetime(created_at))
        .execute(self.pool())
        .await
        .context("insert strategy run")?;
        Ok(())
    }

    /// Queued runs in FIFO order by creation time.
    pub async fn queued_runs(&self) -> Result<Vec<StrategyRun>> {
        let rows = sqlx::query(
            "SELECT id, config, status, created_at FROM strategy_runs \
             WHERE status = 'queued' ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("query queued runs")?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StrategyRun {
                    id: row.get("id"),
                    config: row.get("config"),
                    status: JobStatus::parse(&status)
                        .with_context(|| format!("unknown run status '{status}'"))?,
                    created_at: parse_datetime(row.get("created_at"))?,
                })
            })
            .collect()
    }

    /// Compare-and-set a run's status. Returns false when another worker won
    /// the transition.
    pub async fn transition_run(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        let done = sqlx::query("UPDATE strategy_runs SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(self.pool())
            .await
            .context("transition run status")?;
        Ok(done.rows_affected() == 1)
    }

    /// List runs newest-first for the API façade.
    pub async fn list_runs(&self, limit: i64, offset: i64) -> Result<Vec<StrategyRun>> {
        let rows = sqlx::query(
            "SELECT id, config, status, created_at FROM strategy_runs \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .context("list runs")?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StrategyRun {
                    id: row.get("id"),
                    config: row.get("config"),
                    status: JobStatus::parse(&status)
                        .with_context(|| format!("unknown run status '{status}'"))?,
                    created_at: parse_datetime(row.get("created_at"))?,
                })
            })
            .collect()
    }

    /// Append a batch of mined candidates for `run_id` in one transaction.
    pub async fn insert_results(&self, run_id: &str, batch: &[Candidate]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await.context("begin result batch")?;
        for candidate in batch {
            let p = &candidate.point;
            sqlx::query(
                "INSERT INTO strategy_results \
                 (run_id, stock, exchange, x, y, exceed_prob, profit_days, average, \
                  total_count, highest, p5, p10, p20, p40, p50, \
                  vertical_gap, horizontal_gap, continuous_days) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(&candidate.stock)
            .bind(&candidate.exchange)
            .bind(p.x.format("%H:%M").to_string())
            .bind(p.y.format("%H:%M").to_string())
            .bind(p.exceed_prob)
            .bind(p.profit_days as i64)
            .bind(p.average)
            .bind(p.total_count as i64)
            .bind(p.highest)
            .bind(p.p5)
            .bind(p.p10)
            .bind(p.p20)
            .bind(p.p40)
            .bind(p.p50)
            .bind(candidate.vertical_gap)
            .bind(candidate.horizontal_gap)
            .bind(candidate.continuous_days)
            .execute(&mut *tx)
            .await
            .context("insert strategy result")?;
        }
        tx.commit().await.context("commit result batch")?;
        Ok(())
    }

    /// Results for a run, sorted descending by (exceed_prob, average).
    pub async fn run_results(
        &self,
        run_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StrategyResult>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_results WHERE run_id = ? \
             ORDER BY exceed_prob DESC, average DESC LIMIT ? OFFSET ?",
        )
        .bind(run_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .context("query run results")?;
        Ok(rows.iter().map(result_from_row).collect())
    }

    /// The single best result per (stock, exchange) for a run.
    pub async fn best_results_per_stock(&self, run_id: &str) -> Result<Vec<StrategyResult>> {
        let rows = sqlx::query(
            "SELECT * FROM (\
                 SELECT *, ROW_NUMBER() OVER (\
                     PARTITION BY stock, exchange ORDER BY exceed_prob DESC, average DESC\
                 ) AS rn \
                 FROM strategy_results WHERE run_id = ?\
             ) WHERE rn = 1 ORDER BY exceed_prob DESC, average DESC",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await
        .context("query best results per stock")?;
        Ok(rows.iter().map(result_from_row).collect())
    }

    pub async fn get_result(&self, id: i64) -> Result<Option<StrategyResult>> {
        let row = sqlx::query("SELECT * FROM strategy_results WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("query strategy result")?;
        Ok(row.as_ref().map(result_from_row))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::{Candidate, ScorePoint};
    use chrono::{NaiveDate, NaiveTime};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 20)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn candidate(stock: &str, exceed_prob: f64, average: f64) -> Candidate {
        Candidate {
            stock: stock.into(),
            exchange: "NSE".into(),
            vertical_gap: 1.5,
            horizontal_gap: 2,
            continuous_days: 5,
            point: ScorePoint {
                x: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                y: NaiveTime::from_hms_opt(9, 45, 0).unwrap(),
                exceeded: 12,
                profit_days: 14,
                total_count: 16,
                exceed_prob,
                profit_prob: 14.0 / 16.0,
                average,
                highest: 11.0,
                lowest: -2.0,
                p5: -1.0,
                p10: 0.0,
                p20: 1.0,
                p40: 2.0,
                p50: 3.0,
            },
        }
    }

    #[tokio::test]
    async fn run_claim_is_single_winner() {
        let store = Store::memory().await;
        store.create_run("run-1", "{}", now()).await.unwrap();

        let queued = store.queued_runs().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, JobStatus::Queued);

        assert!(store
            .transition_run("run-1", JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap());
        // A second claimant loses the CAS.
        assert!(!store
            .transition_run("run-1", JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap());
        assert!(store.queued_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_runs_are_fifo() {
        let store = Store::memory().await;
        let later = now() + chrono::Duration::seconds(30);
        store.create_run("run-b", "{}", later).await.unwrap();
        store.create_run("run-a", "{}", now()).await.unwrap();

        let queued = store.queued_runs().await.unwrap();
        assert_eq!(
            queued.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["run-a", "run-b"]
        );
    }

    #[tokio::test]
    async fn results_batch_roundtrip() {
        let store = Store::memory().await;
        store.create_run("run-1", "{}", now()).await.unwrap();
        store
            .insert_results(
                "run-1",
                &[candidate("RELIANCE", 0.9, 4.0), candidate("TCS", 0.8, 6.0)],
            )
            .await
            .unwrap();

        let results = store.run_results("run-1", 50, 0).await.unwrap();
        assert_eq!(results.len(), 2);
        // Descending by exceed_prob.
        assert_eq!(results[0].stock, "RELIANCE");
        assert_eq!(results[0].x, "09:15");
        assert_eq!(results[0].y, "09:45");
        assert_eq!(results[0].continuous_days, 5);

        let one = store.get_result(results[1].id).await.unwrap().unwrap();
        assert_eq!(one.stock, "TCS");
        assert!(store.get_result(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn best_per_stock_keeps_one_row_each() {
        let store = Store::memory().await;
        store.create_run("run-1", "{}", now()).await.unwrap();
        store
            .insert_results(
                "run-1",
                &[
                    candidate("RELIANCE", 0.85, 4.0),
                    candidate("RELIANCE", 0.95, 3.0),
                    candidate("TCS", 0.8, 6.0),
                ],
            )
            .await
            .unwrap();

        let best = store.best_results_per_stock("run-1").await.unwrap();
        assert_eq!(best.len(), 2);
        let reliance = best.iter().find(|r| r.stock == "RELIANCE").unwrap();
        assert!((reliance.exceed_prob - 0.95).abs() < 1e-12);
    }
}
