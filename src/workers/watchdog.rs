// =============================================================================
// Task Watchdog — periodic consistency sweep over the execution trees
// =============================================================================
//
// Three sweeps per pass:
//   1. running executions holding a queued/running task whose scheduled
//      moment is further in the past than the grace buffer (or whose detail
//      statuses contradict their tasks) fail with their whole subtree;
//   2. queued executions whose children already moved fail with their
//      subtree;
//   3. terminal executions with non-terminal children have just those
//      children failed.
// Every write is a CAS away from non-terminal states, so re-running a sweep
// on an already-failed tree is a no-op.
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::executions::Execution;
use crate::store::Store;
use crate::types::JobStatus;

pub struct TaskWatchdog {
    store: Store,
    poll_interval: Duration,
    /// Seconds past the scheduled moment before queued/running work counts
    /// as a zombie.
    buffer_secs: i64,
}

impl TaskWatchdog {
    pub fn new(store: Store, poll_interval: Duration, buffer_secs: i64) -> Self {
        Self {
            store,
            poll_interval,
            buffer_secs,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            buffer_secs = self.buffer_secs,
            "task watchdog started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("task watchdog stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Local::now().naive_local();
                    if let Err(err) = self.sweep(now).await {
                        error!(error = %err, "watchdog sweep failed");
                    }
                }
            }
        }
    }

    /// One full consistency pass.
    pub async fn sweep(&self, now: NaiveDateTime) -> Result<()> {
        debug!("watchdog sweep starting");
        self.fail_zombie_running_executions(now).await?;
        self.fail_skewed_queued_executions(now).await?;
        self.fail_children_of_terminal_executions(now).await?;
        debug!("watchdog sweep finished");
        Ok(())
    }

    /// Case 1: running executions with stale scheduled work or
    /// contradictory detail/task statuses.
    async fn fail_zombie_running_executions(&self, now: NaiveDateTime) -> Result<()> {
        let running = self.store.executions_with_status(JobStatus::Running).await?;
        debug!(count = running.len(), "checking running executions");

        for execution in running {
            if let Some(reason) = self.zombie_reason(&execution, now).await? {
                warn!(execution_id = execution.id, reason = %reason, "zombie execution detected");
                self.store
                    .fail_execution_subtree(execution.id, &reason, now)
                    .await?;
            }
        }
        Ok(())
    }

    /// Why `execution` should be failed, or None when it is healthy.
    async fn zombie_reason(
        &self,
        execution: &Execution,
        now: NaiveDateTime,
    ) -> Result<Option<String>> {
        let details = self.store.execution_details(execution.id).await?;
        if details.is_empty() {
            return Ok(Some("no execution details found".to_string()));
        }

        for detail in details {
            match detail.status {
                JobStatus::Running => {
                    for task in self.store.nonterminal_tasks_for_detail(detail.id).await? {
                        let scheduled = task.day_of_execution.and_hms_opt(0, 0, 0).expect("midnight")
                            + chrono::Duration::seconds(task.timestamp_of_execution);
                        let overdue = scheduled + chrono::Duration::seconds(self.buffer_secs);
                        if now > overdue {
                            return Ok(Some(format!(
                                "task {} still {} {} seconds past its schedule",
                                task.id,
                                task.status,
                                (now - scheduled).num_seconds()
                            )));
                        }
                    }
                }
                JobStatus::Queued => {
                    let tasks = self.store.tasks_for_detail(detail.id).await?;
                    if tasks.iter().any(|t| t.status != JobStatus::Queued) {
                        return Ok(Some(format!(
                            "detail {} is queued but has tasks already moved",
                            detail.id
                        )));
                    }
                }
                JobStatus::Completed | JobStatus::Failed => {
                    let stuck = self.store.nonterminal_tasks_for_detail(detail.id).await?;
                    if !stuck.is_empty() {
                        return Ok(Some(format!(
                            "detail {} is terminal but task {} is not",
                            detail.id, stuck[0].id
                        )));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Case 2: a queued execution must have an entirely queued subtree.
    async fn fail_skewed_queued_executions(&self, now: NaiveDateTime) -> Result<()> {
        let skewed = self.store.skewed_queued_execution_ids().await?;
        debug!(count = skewed.len(), "queued executions with moved children");
        for execution_id in skewed {
            warn!(execution_id, "queued execution has non-queued children — failing subtree");
            self.store
                .fail_execution_subtree(
                    execution_id,
                    "execution queued but children already moved",
                    now,
                )
                .await?;
        }
        Ok(())
    }

    /// Case 3: terminal executions shed their non-terminal children; the
    /// execution row itself keeps its status.
    async fn fail_children_of_terminal_executions(&self, now: NaiveDateTime) -> Result<()> {
        let skewed = self.store.skewed_terminal_execution_ids().await?;
        debug!(count = skewed.len(), "terminal executions with live children");
        for execution_id in skewed {
            warn!(execution_id, "terminal execution has non-terminal children — failing them");
            self.store
                .fail_nonterminal_children(
                    execution_id,
                    "parent execution already terminal",
                    now,
                )
                .await?;
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
    use crate::store::executions::NewTask;
    use crate::types::{OrderSide, TradeMode};
    use chrono::NaiveDate;

    fn at(day: &str, hms: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{day} {hms}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn task(detail_id: i64, day: &str, secs: i64) -> NewTask {
        NewTask {
            execution_detail_id: detail_id,
            previous_task_id: -1,
            order_type: OrderSide::Buy,
            day_of_execution: NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
            timestamp_of_execution: secs,
            current_money: 10_000.0,
            current_shares: 0,
            days_remaining: 3,
            x: secs,
            y: secs + 1800,
            stock: "RELIANCE".into(),
            exchange: "NSE".into(),
            simulate_mode: true,
        }
    }

    async fn seeded(store: &Store) -> (i64, i64) {
        store.create_run("run-1", "{}", at("2026-03-16", "08:00:00")).await.unwrap();
        let execution_id = store
            .create_execution(
                "run-1",
                TradeMode::Simulate,
                None,
                &[(1, 100.0)],
                at("2026-03-16", "08:00:00"),
            )
            .await
            .unwrap();
        let detail_id = store.execution_details(execution_id).await.unwrap()[0].id;
        (execution_id, detail_id)
    }

    fn watchdog(store: Store) -> TaskWatchdog {
        TaskWatchdog::new(store, Duration::from_secs(1800), 600)
    }

    #[tokio::test]
    async fn overdue_task_zombifies_the_execution() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Running, at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store
            .transition_detail(detail_id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap();
        // Scheduled 09:15, still queued at 09:30 — 900 s late, buffer 600.
        store
            .insert_task(&task(detail_id, "2026-03-16", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();

        watchdog(store.clone()).sweep(at("2026-03-16", "09:30:00")).await.unwrap();

        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, JobStatus::Failed);
        let details = store.execution_details(execution_id).await.unwrap();
        assert!(details.iter().all(|d| d.status == JobStatus::Failed));
        let tasks = store.tasks_for_detail(detail_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == JobStatus::Failed));
        assert!(tasks[0].error_message.as_deref().unwrap().contains("past its schedule"));
    }

    #[tokio::test]
    async fn task_inside_the_grace_buffer_survives() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Running, at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store
            .transition_detail(detail_id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap();
        // Scheduled 09:15, checked at 09:20 — 300 s late, inside the buffer.
        store
            .insert_task(&task(detail_id, "2026-03-16", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();

        watchdog(store.clone()).sweep(at("2026-03-16", "09:20:00")).await.unwrap();

        assert_eq!(
            store.get_execution(execution_id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn forced_terminal_execution_sheds_live_children() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        let task_id = store
            .insert_task(&task(detail_id, "2026-03-16", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store.claim_task(task_id).await.unwrap();
        // Operator force-fails the execution while a detail is queued and a
        // task is running.
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Failed, at("2026-03-16", "09:00:00"))
            .await
            .unwrap();

        watchdog(store.clone()).sweep(at("2026-03-16", "09:05:00")).await.unwrap();

        let details = store.execution_details(execution_id).await.unwrap();
        assert!(details.iter().all(|d| d.status == JobStatus::Failed));
        let running_task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(running_task.status, JobStatus::Failed);
        // The execution keeps the status the operator set.
        assert_eq!(
            store.get_execution(execution_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn queued_execution_with_moved_children_fails() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        let task_id = store
            .insert_task(&task(detail_id, "2026-03-16", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store.claim_task(task_id).await.unwrap();

        watchdog(store.clone()).sweep(at("2026-03-16", "09:00:00")).await.unwrap();

        assert_eq!(
            store.get_execution(execution_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(
            store.get_task(task_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Running, at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store
            .transition_detail(detail_id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap();
        store
            .insert_task(&task(detail_id, "2026-03-16", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();

        let dog = watchdog(store.clone());
        dog.sweep(at("2026-03-16", "11:00:00")).await.unwrap();

        async fn snapshot(
            store: &Store,
            execution_id: i64,
            detail_id: i64,
        ) -> (
            JobStatus,
            Vec<(JobStatus, Option<String>, Option<NaiveDateTime>)>,
        ) {
            let execution = store.get_execution(execution_id).await.unwrap().unwrap();
            let tasks = store.tasks_for_detail(detail_id).await.unwrap();
            (
                execution.status,
                tasks
                    .iter()
                    .map(|t| (t.status, t.error_message.clone(), t.executed_at))
                    .collect::<Vec<_>>(),
            )
        }
        let first = snapshot(&store, execution_id, detail_id).await;

        dog.sweep(at("2026-03-16", "12:00:00")).await.unwrap();
        assert_eq!(snapshot(&store, execution_id, detail_id).await, first);
    }

    #[tokio::test]
    async fn healthy_trees_are_left_alone() {
        let store = Store::memory().await;
        let (execution_id, detail_id) = seeded(&store).await;
        store
            .transition_execution(execution_id, JobStatus::Queued, JobStatus::Running, at("2026-03-16", "08:00:00"))
            .await
            .unwrap();
        store
            .transition_detail(detail_id, JobStatus::Queued, JobStatus::Running)
            .await
            .unwrap();
        // Scheduled for tomorrow; nothing is overdue.
        store
            .insert_task(&task(detail_id, "2026-03-17", 33_300), at("2026-03-16", "08:00:00"))
            .await
            .unwrap();

        watchdog(store.clone()).sweep(at("2026-03-16", "12:00:00")).await.unwrap();

        assert_eq!(
            store.get_execution(execution_id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }
}
