// =============================================================================
// Execution Orchestrator — turns a submitted execution into root task chains
// =============================================================================
//
// One execution at a time: while any execution is `running` the orchestrator
// sits out the tick. Claiming an execution moves it `queued -> running`;
// each child detail then gets its capital slice and one root buy task
// anchored to the next business day after tomorrow. The dispatcher grows the
// chain from there.
// =============================================================================

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::calendar::{next_business_day, seconds_since_midnight};
use crate::store::executions::{Execution, NewTask};
use crate::store::Store;
use crate::types::{JobStatus, OrderSide, TradeMode};

pub struct ExecutionOrchestrator {
    store: Store,
    poll_interval: Duration,
}

impl ExecutionOrchestrator {
    pub fn new(store: Store, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "execution orchestrator started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("execution orchestrator stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Local::now().naive_local();
                    if let Err(err) = self.tick(now).await {
                        error!(error = %err, "orchestrator tick failed");
                    }
                }
            }
        }
    }

    /// One poll: claim the oldest queued execution unless one is already in
    /// flight, and materialise its root tasks.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<()> {
        let running = self.store.executions_with_status(JobStatus::Running).await?;
        if !running.is_empty() {
            debug!(count = running.len(), "executions still running — skipping new claims");
            return Ok(());
        }

        let queued = self.store.executions_with_status(JobStatus::Queued).await?;
        let Some(execution) = queued.into_iter().next() else {
            debug!("no queued executions");
            return Ok(());
        };

        if !self
            .store
            .transition_execution(execution.id, JobStatus::Queued, JobStatus::Running, now)
            .await?
        {
            return Ok(());
        }

        info!(execution_id = execution.id, mode = %execution.mode, "materialising execution");
        if let Err(err) = self.materialise(&execution, now).await {
            error!(execution_id = execution.id, error = %err, "execution materialisation failed");
            self.store
                .fail_execution_subtree(execution.id, &err.to_string(), now)
                .await?;
        }
        Ok(())
    }

    /// Create the root buy task for every detail of `execution`.
    async fn materialise(&self, execution: &Execution, now: NaiveDateTime) -> Result<()> {
        let details = self.store.execution_details(execution.id).await?;
        if details.is_empty() {
            return Err(anyhow!("execution {} has no details", execution.id));
        }

        let total_money = execution.total_money.unwrap_or(0.0);
        let simulate = execution.mode == TradeMode::Simulate;

        for detail in details {
            self.store
                .transition_detail(detail.id, JobStatus::Queued, JobStatus::Running)
                .await?;

            let result = self
                .store
                .get_result(detail.result_id)
                .await?
                .with_context(|| format!("detail {} references missing result", detail.id))?;

            let money_for_detail = total_money * detail.weight_percent / 100.0;
            let x_secs = i64::from(seconds_since_midnight(&result.x)?);
            let y_secs = i64::from(seconds_since_midnight(&result.y)?);
            // The root task goes to the first trading day strictly after
            // tomorrow, leaving a full day for operator review.
            let tomorrow = now.date() + chrono::Duration::days(1);
            let day_of_execution = next_business_day(tomorrow, &result.exchange)?;

            let task_id = self
                .store
                .insert_task(
                    &NewTask {
                        execution_detail_id: detail.id,
                        previous_task_id: -1,
                        order_type: OrderSide::Buy,
                        day_of_execution,
                        timestamp_of_execution: x_secs,
                        current_money: money_for_detail,
                        current_shares: 0,
                        days_remaining: result.continuous_days,
                        x: x_secs,
                        y: y_secs,
                        stock: result.stock.clone(),
                        exchange: result.exchange.clone(),
                        simulate_mode: simulate,
                    },
                    now,
                )
                .await?;

            info!(
                execution_id = execution.id,
                detail_id = detail.id,
                task_id,
                stock = %result.stock,
                day = %day_of_execution,
                money = money_for_detail,
                "root buy task created"
            );
        }
        Ok(())
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
        // Thursday 2026-03-12: tomorrow is Friday the 13th, followed by
        // Holi on a Saturday and a Sunday.
        NaiveDate::from_ymd_opt(2026, 3, 12)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap()
    }

    fn candidate(stock: &str) -> Candidate {
        Candidate {
            stock: stock.into(),
            exchange: "NSE".into(),
            vertical_gap: 2.0,
            horizontal_gap: 2,
            continuous_days: 3,
            point: ScorePoint {
                x: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                y: NaiveTime::from_hms_opt(9, 45, 0).unwrap(),
                exceeded: 12,
                profit_days: 14,
                total_count: 16,
                exceed_prob: 0.75,
                profit_prob: 0.875,
                average: 4.0,
                highest: 9.0,
                lowest: -1.0,
                p5: -0.5,
                p10: 0.1,
                p20: 1.0,
                p40: 2.0,
                p50: 3.0,
            },
        }
    }

    async fn seeded(store: &Store, weights: &[f64]) -> i64 {
        store.create_run("run-1", "{}", now()).await.unwrap();
        let candidates: Vec<Candidate> =
            (0..weights.len()).map(|i| candidate(&format!("S{i}"))).collect();
        store.insert_results("run-1", &candidates).await.unwrap();
        let results = store.run_results("run-1", 50, 0).await.unwrap();
        let selections: Vec<(i64, f64)> = results
            .iter()
            .zip(weights)
            .map(|(r, w)| (r.id, *w))
            .collect();
        store
            .create_execution("run-1", TradeMode::Simulate, Some(30_000.0), &selections, now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claims_and_materialises_root_tasks() {
        let store = Store::memory().await;
        let execution_id = seeded(&store, &[60.0, 40.0]).await;

        let orchestrator = ExecutionOrchestrator::new(store.clone(), Duration::from_secs(60));
        orchestrator.tick(now()).await.unwrap();

        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, JobStatus::Running);

        let details = store.execution_details(execution_id).await.unwrap();
        assert_eq!(details.len(), 2);
        for detail in &details {
            assert_eq!(detail.status, JobStatus::Running);
            let tasks = store.tasks_for_detail(detail.id).await.unwrap();
            assert_eq!(tasks.len(), 1);
            let task = &tasks[0];
            assert_eq!(task.order_type, OrderSide::Buy);
            assert_eq!(task.previous_task_id, -1);
            assert_eq!(task.days_remaining, 3);
            assert_eq!(task.status, JobStatus::Queued);
            assert!(task.simulate_mode);
            // 09:15 anchor.
            assert_eq!(task.timestamp_of_execution, 33_300);
            assert_eq!(task.x, 33_300);
            assert_eq!(task.y, 35_100);
            // Tomorrow is Friday the 13th; the next trading day strictly
            // after it is Monday the 16th.
            assert_eq!(
                task.day_of_execution,
                NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
            );
        }

        // Weight split: 60% and 40% of 30 000.
        let moneys: Vec<f64> = {
            let mut v = Vec::new();
            for detail in &details {
                let task = &store.tasks_for_detail(detail.id).await.unwrap()[0];
                v.push(task.current_money);
            }
            v
        };
        assert!((moneys[0] - 18_000.0).abs() < 1e-9);
        assert!((moneys[1] - 12_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sits_out_while_an_execution_is_running() {
        let store = Store::memory().await;
        let first = seeded(&store, &[100.0]).await;

        let orchestrator = ExecutionOrchestrator::new(store.clone(), Duration::from_secs(60));
        orchestrator.tick(now()).await.unwrap();
        assert_eq!(
            store.get_execution(first).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        // A second queued execution must wait for the first to finish.
        let second = store
            .create_execution("run-1", TradeMode::Simulate, None, &[(1, 100.0)], now())
            .await
            .unwrap();
        orchestrator.tick(now()).await.unwrap();
        assert_eq!(
            store.get_execution(second).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn execution_without_details_fails() {
        let store = Store::memory().await;
        store.create_run("run-1", "{}", now()).await.unwrap();
        let execution_id = store
            .create_execution("run-1", TradeMode::Simulate, None, &[], now())
            .await
            .unwrap();

        let orchestrator = ExecutionOrchestrator::new(store.clone(), Duration::from_secs(60));
        orchestrator.tick(now()).await.unwrap();

        assert_eq!(
            store.get_execution(execution_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }
}
