// =============================================================================
// Task Dispatcher — fires due tasks against the broker and grows the chains
// =============================================================================
//
// Every tick the dispatcher picks up to ten queued tasks scheduled for today
// whose fire time falls inside [now - buffer, now + interval]. The
// `queued -> running` CAS is the concurrency gate: a task out of `queued` is
// never picked twice, so replayed windows are harmless.
//
// Completed buys chain a same-day sell at the y anchor; completed sells
// either chain the next day's buy (carrying the sale proceeds forward with
// one less day remaining) or, on the last day, complete their detail and
// possibly the whole execution.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{OrderGateway, OrderReceipt, OrderRequest};
use crate::calendar::next_business_day;
use crate::error::BrokerError;
use crate::store::executions::{NewTask, Task, TaskOutput};
use crate::store::{format_datetime, Store};
use crate::types::{JobStatus, OrderSide};

/// Maximum tasks dispatched per tick.
const TASKS_PER_TICK: i64 = 10;

pub struct TaskDispatcher {
    store: Store,
    gateway: Arc<dyn OrderGateway>,
    poll_interval: Duration,
    buffer_secs: i64,
}

impl TaskDispatcher {
    pub fn new(
        store: Store,
        gateway: Arc<dyn OrderGateway>,
        poll_interval: Duration,
        buffer_secs: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            poll_interval,
            buffer_secs,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            buffer_secs = self.buffer_secs,
            "task dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("task dispatcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Local::now().naive_local();
                    if let Err(err) = self.tick(now).await {
                        error!(error = %err, "dispatcher tick failed");
                    }
                }
            }
        }
    }

    /// One poll at wall-clock `now`.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<()> {
        let today = now.date();
        let now_secs = i64::from(now.time().num_seconds_from_midnight());
        let window_start = now_secs - self.buffer_secs;
        let window_end = now_secs + self.poll_interval.as_secs() as i64;

        let due = self
            .store
            .due_tasks(today, window_start, window_end, TASKS_PER_TICK)
            .await?;
        if due.is_empty() {
            debug!(window_start, window_end, "no due tasks");
            return Ok(());
        }
        info!(count = due.len(), window_start, window_end, "found due tasks");

        for task in due {
            if !self.store.claim_task(task.id).await? {
                continue;
            }
            if let Err(err) = self.process_task(&task, now).await {
                // Storage trouble mid-task: record the failure so the chain
                // does not dangle in `running`.
                error!(task_id = task.id, error = %err, "task processing error");
                let _ = self.store.fail_task(task.id, &err.to_string(), now).await;
            }
        }
        Ok(())
    }

    /// Fill one claimed task and advance its chain.
    async fn process_task(&self, task: &Task, now: NaiveDateTime) -> Result<()> {
        info!(
            task_id = task.id,
            order_type = %task.order_type,
            stock = %task.stock,
            simulate = task.simulate_mode,
            "dispatching task"
        );

        let receipt = match self.fill(task, now).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(task_id = task.id, error = %err, "order failed — failing task");
                self.store.fail_task(task.id, &err.to_string(), now).await?;
                return Ok(());
            }
        };

        self.store
            .insert_task_output(&TaskOutput {
                task_id: task.id,
                order_id: receipt.order_id.clone(),
                shares: receipt.shares,
                price_per_share: receipt.price_per_share,
                total_amount: receipt.total_amount,
                money_provided: receipt.money_provided,
                money_remaining: receipt.money_remaining,
                order_timestamp: receipt.order_timestamp.clone(),
                exchange_timestamp: receipt.exchange_timestamp.clone(),
            })
            .await?;
        self.store
            .complete_task(task.id, receipt.price_per_share, now)
            .await?;
        info!(
            task_id = task.id,
            order_id = %receipt.order_id,
            shares = receipt.shares,
            price = receipt.price_per_share,
            "task completed"
        );

        self.chain_forward(task, &receipt, now).await
    }

    /// Place the order for `task`, or synthesise a fill in simulate mode.
    async fn fill(&self, task: &Task, now: NaiveDateTime) -> Result<OrderReceipt, BrokerError> {
        if task.simulate_mode {
            return self.simulate_fill(task, now).await;
        }
        self.gateway
            .place_order(&OrderRequest {
                stock: task.stock.clone(),
                exchange: task.exchange.clone(),
                side: task.order_type,
                money: (task.order_type == OrderSide::Buy).then_some(task.current_money),
                quantity: (task.order_type == OrderSide::Sell).then_some(task.current_shares),
            })
            .await
    }

    /// Simulate-mode fill: price from a live LTP, no order leaves the
    /// process and no money moves.
    async fn simulate_fill(
        &self,
        task: &Task,
        now: NaiveDateTime,
    ) -> Result<OrderReceipt, BrokerError> {
        let price = self.gateway.get_ltp(&task.stock, &task.exchange).await?;
        let stamp = Some(format_datetime(now));

        let receipt = match task.order_type {
            OrderSide::Buy => {
                let shares = (task.current_money / price).floor() as i64;
                if shares <= 0 {
                    return Err(BrokerError::OrderFailed {
                        order_id: None,
                        status: "REJECTED".into(),
                        message: format!(
                            "insufficient funds: {:.2} buys no shares at {price:.2}",
                            task.current_money
                        ),
                    });
                }
                let total_amount = shares as f64 * price;
                OrderReceipt {
                    order_id: format!("sim-{}", Uuid::new_v4()),
                    status: "SIMULATED".into(),
                    side: OrderSide::Buy,
                    stock: task.stock.clone(),
                    exchange: task.exchange.clone(),
                    shares,
                    price_per_share: price,
                    total_amount,
                    money_provided: Some(task.current_money),
                    money_remaining: Some(task.current_money - total_amount),
                    order_timestamp: stamp.clone(),
                    exchange_timestamp: stamp,
                }
            }
            OrderSide::Sell => {
                let shares = task.current_shares;
                OrderReceipt {
                    order_id: format!("sim-{}", Uuid::new_v4()),
                    status: "SIMULATED".into(),
                    side: OrderSide::Sell,
                    stock: task.stock.clone(),
                    exchange: task.exchange.clone(),
                    shares,
                    price_per_share: price,
                    total_amount: shares as f64 * price,
                    money_provided: None,
                    money_remaining: None,
                    order_timestamp: stamp.clone(),
                    exchange_timestamp: stamp,
                }
            }
        };
        Ok(receipt)
    }

    /// Create the follow-on task, or close out the detail on the terminal
    /// sell.
    async fn chain_forward(
        &self,
        task: &Task,
        receipt: &OrderReceipt,
        now: NaiveDateTime,
    ) -> Result<()> {
        match task.order_type {
            OrderSide::Buy => {
                // Same-day sell at the y anchor, holding the bought shares.
                let sell_id = self
                    .store
                    .insert_task(
                        &NewTask {
                            execution_detail_id: task.execution_detail_id,
                            previous_task_id: task.id,
                            order_type: OrderSide::Sell,
                            day_of_execution: task.day_of_execution,
                            timestamp_of_execution: task.y,
                            current_money: 0.0,
                            current_shares: receipt.shares,
                            days_remaining: task.days_remaining,
                            x: task.x,
                            y: task.y,
                            stock: task.stock.clone(),
                            exchange: task.exchange.clone(),
                            simulate_mode: task.simulate_mode,
                        },
                        now,
                    )
                    .await?;
                info!(task_id = task.id, sell_task_id = sell_id, "chained sell task");
            }
            OrderSide::Sell if task.days_remaining > 1 => {
                // Next trading day's buy, funded by the sale proceeds.
                let next_day = next_business_day(task.day_of_execution, &task.exchange)?;
                let buy_id = self
                    .store
                    .insert_task(
                        &NewTask {
                            execution_detail_id: task.execution_detail_id,
                            previous_task_id: task.id,
                            order_type: OrderSide::Buy,
                            day_of_execution: next_day,
                            timestamp_of_execution: task.x,
                            current_money: receipt.total_amount,
                            current_shares: 0,
                            days_remaining: task.days_remaining - 1,
                            x: task.x,
                            y: task.y,
                            stock: task.stock.clone(),
                            exchange: task.exchange.clone(),
                            simulate_mode: task.simulate_mode,
                        },
                        now,
                    )
                    .await?;
                info!(
                    task_id = task.id,
                    buy_task_id = buy_id,
                    day = %next_day,
                    money = receipt.total_amount,
                    "chained next-day buy task"
                );
            }
            OrderSide::Sell => {
                // Terminal sell: the detail is done; the execution completes
                // once its last detail does.
                self.store
                    .transition_detail(task.execution_detail_id, JobStatus::Running, JobStatus::Completed)
                    .await?;
                let detail = self
                    .store
                    .get_detail(task.execution_detail_id)
                    .await?
                    .context("completed task references missing detail")?;
                info!(detail_id = detail.id, "execution detail completed");

                if self.store.incomplete_detail_count(detail.execution_id).await? == 0
                    && self
                        .store
                        .transition_execution(
                            detail.execution_id,
                            JobStatus::Running,
                            JobStatus::Completed,
                            now,
                        )
                        .await?
                {
                    info!(execution_id = detail.execution_id, "execution completed");
                }
            }
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
    use crate::broker::Quote;
    use crate::types::TradeMode;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Gateway stub: LTPs are served from a script, orders echo the request
    /// at the scripted price.
    struct ScriptedGateway {
        prices: Mutex<VecDeque<f64>>,
        fail_orders: bool,
    }

    impl ScriptedGateway {
        fn with_prices(prices: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(prices.iter().copied().collect()),
                fail_orders: false,
            })
        }

        fn next_price(&self) -> f64 {
            let mut prices = self.prices.lock();
            match prices.len() {
                0 => 100.0,
                1 => *prices.front().expect("non-empty"),
                _ => prices.pop_front().expect("non-empty"),
            }
        }
    }

    #[async_trait]
    impl OrderGateway for ScriptedGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError> {
            if self.fail_orders {
                return Err(BrokerError::OrderFailed {
                    order_id: Some("X99".into()),
                    status: "REJECTED".into(),
                    message: "margin shortfall".into(),
                });
            }
            let price = self.next_price();
            let (shares, money_provided) = match request.side {
                OrderSide::Buy => {
                    let money = request.money.unwrap_or(0.0);
                    ((money / price).floor() as i64, Some(money))
                }
                OrderSide::Sell => (request.quantity.unwrap_or(0), None),
            };
            let total_amount = shares as f64 * price;
            Ok(OrderReceipt {
                order_id: "live-1".into(),
                status: "COMPLETE".into(),
                side: request.side,
                stock: request.stock.clone(),
                exchange: request.exchange.clone(),
                shares,
                price_per_share: price,
                total_amount,
                money_remaining: money_provided.map(|m| m - total_amount),
                money_provided,
                order_timestamp: None,
                exchange_timestamp: None,
            })
        }

        async fn get_ltp(&self, _stock: &str, _exchange: &str) -> Result<f64, BrokerError> {
            Ok(self.next_price())
        }

        async fn get_quote(&self, stock: &str, exchange: &str) -> Result<Quote, BrokerError> {
            Ok(Quote {
                stock: stock.into(),
                exchange: exchange.into(),
                last_price: self.next_price(),
                open: None,
                high: None,
                low: None,
                close: None,
                volume: None,
                bid: None,
                ask: None,
                timestamp: None,
            })
        }
    }

    fn at(day: &str, hms: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{day} {hms}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    /// Seed a simulate-mode execution with one detail and its root buy task
    /// (3 days, 30 000 money, 09:15 buy / 09:45 sell anchors).
    async fn seeded(store: &Store, day: &str) -> (i64, i64, i64) {
        store.create_run("run-1", "{}", at(day, "08:00:00")).await.unwrap();
        let execution_id = store
            .create_execution("run-1", TradeMode::Simulate, Some(30_000.0), &[(1, 100.0)], at(day, "08:00:00"))
            .await
            .unwrap();
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Running, at(day, "08:00:00"))
            .await
            .unwrap();
        let detail_id = store.execution_details(execution_id).await.unwrap()[0].id;
        store
            .transition_detail(detail_id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap();
        let task_id = store
            .insert_task(
                &NewTask {
                    execution_detail_id: detail_id,
                    previous_task_id: -1,
                    order_type: OrderSide::Buy,
                    day_of_execution: NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
                    timestamp_of_execution: 33_300,
                    current_money: 30_000.0,
                    current_shares: 0,
                    days_remaining: 3,
                    x: 33_300,
                    y: 35_100,
                    stock: "RELIANCE".into(),
                    exchange: "NSE".into(),
                    simulate_mode: true,
                },
                at(day, "08:00:00"),
            )
            .await
            .unwrap();
        (execution_id, detail_id, task_id)
    }

    fn dispatcher(store: Store, gateway: Arc<dyn OrderGateway>) -> TaskDispatcher {
        TaskDispatcher::new(store, gateway, Duration::from_secs(10), 170)
    }

    #[tokio::test]
    async fn three_day_chain_runs_to_completion() {
        let store = Store::memory().await;
        // Monday through Wednesday, all trading days.
        let (execution_id, detail_id, _) = seeded(&store, "2026-03-16").await;
        // Buys fill at 100, sells at 102.
        let gateway = ScriptedGateway::with_prices(&[100.0, 102.0, 100.0, 102.0, 100.0, 102.0]);
        let dispatcher = dispatcher(store.clone(), gateway);

        for day in ["2026-03-16", "2026-03-17", "2026-03-18"] {
            dispatcher.tick(at(day, "09:15:00")).await.unwrap();
            dispatcher.tick(at(day, "09:45:00")).await.unwrap();
        }

        let tasks = store.tasks_for_detail(detail_id).await.unwrap();
        assert_eq!(tasks.len(), 6, "expected buy/sell per day for three days");

        // Alternating sides, strictly decreasing days_remaining per round.
        let sides: Vec<OrderSide> = tasks.iter().map(|t| t.order_type).collect();
        assert_eq!(
            sides,
            vec![
                OrderSide::Buy,
                OrderSide::Sell,
                OrderSide::Buy,
                OrderSide::Sell,
                OrderSide::Buy,
                OrderSide::Sell
            ]
        );
        assert_eq!(
            tasks.iter().map(|t| t.days_remaining).collect::<Vec<_>>(),
            vec![3, 3, 2, 2, 1, 1]
        );

        // Every task completed with price and output; chain links hold.
        let mut previous_id = -1;
        for task in &tasks {
            assert_eq!(task.status, JobStatus::Completed);
            assert_eq!(task.previous_task_id, previous_id);
            assert!(task.price_during_order.is_some());
            assert!(task.executed_at.is_some());
            assert!(store.task_output(task.id).await.unwrap().is_some());
            previous_id = task.id;
        }

        // Compounding: 300 shares, then 306, then 312; final proceeds 31 824
        // (~6% on 30 000).
        let final_output = store.task_output(tasks[5].id).await.unwrap().unwrap();
        assert_eq!(final_output.shares, 312);
        assert!((final_output.total_amount - 31_824.0).abs() < 1e-6);

        assert_eq!(
            store.execution_details(execution_id).await.unwrap()[0].status,
            JobStatus::Completed
        );
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, JobStatus::Completed);
        assert!(execution.completed_at.is_some());
    }

    #[tokio::test]
    async fn window_picks_near_tasks_and_skips_stale_ones() {
        let store = Store::memory().await;
        let (_, detail_id, root_id) = seeded(&store, "2026-03-16").await;
        // Root task fires at 09:15:00 = 33 300 s. A tick at 09:14:55 has
        // window [33 125, 33 305]: five seconds early still catches it.
        let gateway = ScriptedGateway::with_prices(&[100.0]);
        let dispatcher = dispatcher(store.clone(), gateway);
        dispatcher.tick(at("2026-03-16", "09:14:55")).await.unwrap();

        assert_eq!(
            store.get_task(root_id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );

        // A task 180 s in the past is outside the 170 s buffer and stays
        // queued for the watchdog.
        let stale_id = store
            .insert_task(
                &NewTask {
                    execution_detail_id: detail_id,
                    previous_task_id: -1,
                    order_type: OrderSide::Buy,
                    day_of_execution: NaiveDate::from_ymd_opt(2026, 3, 16).unwrap(),
                    timestamp_of_execution: 33_300 - 180,
                    current_money: 1_000.0,
                    current_shares: 0,
                    days_remaining: 1,
                    x: 33_120,
                    y: 35_100,
                    stock: "TCS".into(),
                    exchange: "NSE".into(),
                    simulate_mode: true,
                },
                at("2026-03-16", "08:00:00"),
            )
            .await
            .unwrap();
        dispatcher.tick(at("2026-03-16", "09:15:00")).await.unwrap();
        assert_eq!(
            store.get_task(stale_id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn completed_tasks_are_never_repicked() {
        let store = Store::memory().await;
        let (_, detail_id, root_id) = seeded(&store, "2026-03-16").await;
        let gateway = ScriptedGateway::with_prices(&[100.0, 102.0]);
        let dispatcher = dispatcher(store.clone(), gateway);

        dispatcher.tick(at("2026-03-16", "09:15:00")).await.unwrap();
        let after_first = store.get_task(root_id).await.unwrap().unwrap();
        assert_eq!(after_first.status, JobStatus::Completed);
        let chain_len = store.tasks_for_detail(detail_id).await.unwrap().len();

        // Replaying the same window changes nothing.
        dispatcher.tick(at("2026-03-16", "09:15:00")).await.unwrap();
        let after_second = store.get_task(root_id).await.unwrap().unwrap();
        assert_eq!(after_second.executed_at, after_first.executed_at);
        assert_eq!(store.tasks_for_detail(detail_id).await.unwrap().len(), chain_len);
    }

    #[tokio::test]
    async fn rejected_order_fails_the_task_without_chaining() {
        let store = Store::memory().await;
        let (_, detail_id, root_id) = seeded(&store, "2026-03-16").await;
        let gateway = Arc::new(ScriptedGateway {
            prices: Mutex::new(VecDeque::from([100.0])),
            fail_orders: true,
        });
        // A real-mode task at 10:00, clear of the simulate root at 09:15.
        let live_id = store
            .insert_task(
                &NewTask {
                    execution_detail_id: detail_id,
                    previous_task_id: -1,
                    order_type: OrderSide::Buy,
                    day_of_execution: NaiveDate::from_ymd_opt(2026, 3, 16).unwrap(),
                    timestamp_of_execution: 36_000,
                    current_money: 30_000.0,
                    current_shares: 0,
                    days_remaining: 3,
                    x: 36_000,
                    y: 37_800,
                    stock: "INFY".into(),
                    exchange: "NSE".into(),
                    simulate_mode: false,
                },
                at("2026-03-16", "08:00:00"),
            )
            .await
            .unwrap();

        let dispatcher = dispatcher(store.clone(), gateway);
        dispatcher.tick(at("2026-03-16", "10:00:00")).await.unwrap();

        let live = store.get_task(live_id).await.unwrap().unwrap();
        assert_eq!(live.status, JobStatus::Failed);
        assert!(live.error_message.as_deref().unwrap().contains("REJECTED"));
        assert!(live.executed_at.is_some());
        assert!(store.task_output(live_id).await.unwrap().is_none());

        // No follow-on task was chained off the failed order.
        let tasks = store.tasks_for_detail(detail_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.previous_task_id != live_id));

        // The untouched simulate root is still queued.
        assert_eq!(
            store.get_task(root_id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }
}
