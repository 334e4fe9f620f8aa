// =============================================================================
// Executions, Details, Tasks, Outputs — persistence for the trading workflow
// =============================================================================
//
// Chain invariants enforced here and by the dispatcher:
//   - every chain roots at one buy task with previous_task_id = -1;
//   - a completed task has exactly one output row; others have none;
//   - terminal tasks always carry executed_at.
// All transitions are CAS updates so replays and replicas are harmless.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::Row;

use super::{format_date, format_datetime, parse_date, parse_datetime, Store};
use crate::types::{JobStatus, OrderSide, TradeMode};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: i64,
    pub run_id: String,
    pub mode: TradeMode,
    pub total_money: Option<f64>,
    pub status: JobStatus,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct ExecutionDetail {
    pub id: i64,
    pub execution_id: i64,
    pub result_id: i64,
    pub weight_percent: f64,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub execution_detail_id: i64,
    /// -1 for the root buy of a chain.
    pub previous_task_id: i64,
    pub order_type: OrderSide,
    pub day_of_execution: NaiveDate,
    /// Seconds since midnight, exchange-local.
    pub timestamp_of_execution: i64,
    pub current_money: f64,
    pub current_shares: i64,
    pub days_remaining: i64,
    /// Buy anchor in seconds since midnight.
    pub x: i64,
    /// Sell anchor in seconds since midnight.
    pub y: i64,
    pub stock: String,
    pub exchange: String,
    pub simulate_mode: bool,
    pub status: JobStatus,
    pub price_during_order: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub executed_at: Option<NaiveDateTime>,
}

/// Insert payload for a task; status starts `queued`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub execution_detail_id: i64,
    pub previous_task_id: i64,
    pub order_type: OrderSide,
    pub day_of_execution: NaiveDate,
    pub timestamp_of_execution: i64,
    pub current_money: f64,
    pub current_shares: i64,
    pub days_remaining: i64,
    pub x: i64,
    pub y: i64,
    pub stock: String,
    pub exchange: String,
    pub simulate_mode: bool,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task_id: i64,
    pub order_id: String,
    pub shares: i64,
    pub price_per_share: f64,
    pub total_amount: f64,
    pub money_provided: Option<f64>,
    pub money_remaining: Option<f64>,
    pub order_timestamp: Option<String>,
    pub exchange_timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn status_of(row: &sqlx::sqlite::SqliteRow) -> Result<JobStatus> {
    let raw: String = row.get("status");
    JobStatus::parse(&raw).with_context(|| format!("unknown status '{raw}'"))
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let mode: String = row.get("mode");
    let completed_at: Option<String> = row.get("completed_at");
    Ok(Execution {
        id: row.get("id"),
        run_id: row.get("run_id"),
        mode: TradeMode::parse(&mode).with_context(|| format!("unknown mode '{mode}'"))?,
        total_money: row.get("total_money"),
        status: status_of(row)?,
        created_at: parse_datetime(row.get("created_at"))?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

fn detail_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionDetail> {
    Ok(ExecutionDetail {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        result_id: row.get("result_id"),
        weight_percent: row.get("weight_percent"),
        status: status_of(row)?,
    })
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let order_type: String = row.get("order_type");
    let executed_at: Option<String> = row.get("executed_at");
    Ok(Task {
        id: row.get("id"),
        execution_detail_id: row.get("execution_detail_id"),
        previous_task_id: row.get("previous_task_id"),
        order_type: OrderSide::parse(&order_type)
            .with_context(|| format!("unknown order type '{order_type}'"))?,
        day_of_execution: parse_date(row.get("day_of_execution"))?,
        timestamp_of_execution: row.get("timestamp_of_execution"),
        current_money: row.get("current_money"),
        current_shares: row.get("current_shares"),
        days_remaining: row.get("days_remaining"),
        x: row.get("x"),
        y: row.get("y"),
        stock: row.get("stock"),
        exchange: row.get("exchange"),
        simulate_mode: row.get::<i64, _>("simulate_mode") != 0,
        status: status_of(row)?,
        price_during_order: row.get("price_during_order"),
        error_message: row.get("error_message"),
        created_at: parse_datetime(row.get("created_at"))?,
        executed_at: executed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

impl Store {
    /// Create an execution with its details in `queued`, one transaction.
    /// Called by the API façade only; weight validation happens there.
    pub async fn create_execution(
        &self,
        run_id: &str,
        mode: TradeMode,
        total_money: Option<f64>,
        selections: &[(i64, f64)],
        created_at: NaiveDateTime,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await.context("begin create execution")?;
        let execution_id = sqlx::query(
            "INSERT INTO strategy_executions (run_id, mode, total_money, status, created_at) \
             VALUES (?, ?, ?, 'queued', ?)",
        )
        .bind(run_id)
        .bind(mode.as_str())
        .bind(total_money)
        .bind(format_datetime(created_at))
        .execute(&mut *tx)
        .await
        .context("insert execution")?
        .last_insert_rowid();

        for (result_id, weight_percent) in selections {
            sqlx::query(
                "INSERT INTO strategy_execution_details \
                 (execution_id, result_id, weight_percent, status) VALUES (?, ?, ?, 'queued')",
            )
            .bind(execution_id)
            .bind(result_id)
            .bind(weight_percent)
            .execute(&mut *tx)
            .await
            .context("insert execution detail")?;
        }
        tx.commit().await.context("commit create execution")?;
        Ok(execution_id)
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM strategy_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("query execution")?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn executions_with_status(&self, status: JobStatus) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_executions WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await
        .context("query executions by status")?;
        rows.iter().map(execution_from_row).collect()
    }

    /// CAS on an execution's status. Completion stamps `completed_at`.
    pub async fn transition_execution(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        now: NaiveDateTime,
    ) -> Result<bool> {
        let done = if to == JobStatus::Completed {
            sqlx::query(
                "UPDATE strategy_executions SET status = ?, completed_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(to.as_str())
            .bind(format_datetime(now))
            .bind(id)
            .bind(from.as_str())
            .execute(self.pool())
            .await
        } else {
            sqlx::query("UPDATE strategy_executions SET status = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(self.pool())
                .await
        }
        .context("transition execution status")?;
        Ok(done.rows_affected() == 1)
    }

    // -----------------------------------------------------------------------
    // Details
    // -----------------------------------------------------------------------

    pub async fn execution_details(&self, execution_id: i64) -> Result<Vec<ExecutionDetail>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_execution_details WHERE execution_id = ? ORDER BY id ASC",
        )
        .bind(execution_id)
        .fetch_all(self.pool())
        .await
        .context("query execution details")?;
        rows.iter().map(detail_from_row).collect()
    }

    pub async fn get_detail(&self, id: i64) -> Result<Option<ExecutionDetail>> {
        let row = sqlx::query("SELECT * FROM strategy_execution_details WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("query execution detail")?;
        row.as_ref().map(detail_from_row).transpose()
    }

    pub async fn transition_detail(&self, id: i64, from: JobStatus, to: JobStatus) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE strategy_execution_details SET status = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(self.pool())
        .await
        .context("transition detail status")?;
        Ok(done.rows_affected() == 1)
    }

    /// Details of an execution not yet in `completed`.
    pub async fn incomplete_detail_count(&self, execution_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM strategy_execution_details \
             WHERE execution_id = ? AND status != 'completed'",
        )
        .bind(execution_id)
        .fetch_one(self.pool())
        .await
        .context("count incomplete details")?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn insert_task(&self, task: &NewTask, created_at: NaiveDateTime) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO strategy_execution_tasks \
             (execution_detail_id, previous_task_id, order_type, day_of_execution, \
              timestamp_of_execution, current_money, current_shares, days_remaining, \
              x, y, stock, exchange, simulate_mode, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?)",
        )
        .bind(task.execution_detail_id)
        .bind(task.previous_task_id)
        .bind(task.order_type.as_str())
        .bind(format_date(task.day_of_execution))
        .bind(task.timestamp_of_execution)
        .bind(task.current_money)
        .bind(task.current_shares)
        .bind(task.days_remaining)
        .bind(task.x)
        .bind(task.y)
        .bind(&task.stock)
        .bind(&task.exchange)
        .bind(task.simulate_mode as i64)
        .bind(format_datetime(created_at))
        .execute(self.pool())
        .await
        .context("insert task")?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM strategy_execution_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("query task")?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Queued tasks due on `day` with a fire time inside
    /// `[from_secs, to_secs]`, oldest first.
    pub async fn due_tasks(
        &self,
        day: NaiveDate,
        from_secs: i64,
        to_secs: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_execution_tasks \
             WHERE status = 'queued' AND day_of_execution = ? \
               AND timestamp_of_execution BETWEEN ? AND ? \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(format_date(day))
        .bind(from_secs)
        .bind(to_secs)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("query due tasks")?;
        rows.iter().map(task_from_row).collect()
    }

    /// Claim a task for dispatch; the `queued -> running` CAS is the
    /// concurrency gate.
    pub async fn claim_task(&self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE strategy_execution_tasks SET status = 'running' \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .context("claim task")?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn complete_task(
        &self,
        id: i64,
        price_during_order: f64,
        now: NaiveDateTime,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE strategy_execution_tasks \
             SET status = 'completed', price_during_order = ?, executed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(price_during_order)
        .bind(format_datetime(now))
        .bind(id)
        .execute(self.pool())
        .await
        .context("complete task")?;
        Ok(done.rows_affected() == 1)
    }

    /// Fail a task from any non-terminal state, stamping `executed_at`.
    pub async fn fail_task(&self, id: i64, error: &str, now: NaiveDateTime) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE strategy_execution_tasks \
             SET status = 'failed', error_message = ?, executed_at = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(error)
        .bind(format_datetime(now))
        .bind(id)
        .execute(self.pool())
        .await
        .context("fail task")?;
        Ok(done.rows_affected() == 1)
    }

    /// Tasks of a detail that are still queued or running.
    pub async fn nonterminal_tasks_for_detail(&self, detail_id: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_execution_tasks \
             WHERE execution_detail_id = ? AND status IN ('queued', 'running') \
             ORDER BY id ASC",
        )
        .bind(detail_id)
        .fetch_all(self.pool())
        .await
        .context("query nonterminal tasks")?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn tasks_for_detail(&self, detail_id: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_execution_tasks WHERE execution_detail_id = ? ORDER BY id ASC",
        )
        .bind(detail_id)
        .fetch_all(self.pool())
        .await
        .context("query tasks for detail")?;
        rows.iter().map(task_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Task outputs
    // -----------------------------------------------------------------------

    pub async fn insert_task_output(&self, output: &TaskOutput) -> Result<()> {
        sqlx::query(
            "INSERT INTO strategy_execution_task_outputs \
             (task_id, order_id, shares, price_per_share, total_amount, \
              money_provided, money_remaining, order_timestamp, exchange_timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(output.task_id)
        .bind(&output.order_id)
        .bind(output.shares)
        .bind(output.price_per_share)
        .bind(output.total_amount)
        .bind(output.money_provided)
        .bind(output.money_remaining)
        .bind(&output.order_timestamp)
        .bind(&output.exchange_timestamp)
        .execute(self.pool())
        .await
        .context("insert task output")?;
        Ok(())
    }

    pub async fn task_output(&self, task_id: i64) -> Result<Option<TaskOutput>> {
        let row = sqlx::query("SELECT * FROM strategy_execution_task_outputs WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await
            .context("query task output")?;
        Ok(row.map(|row| TaskOutput {
            task_id: row.get("task_id"),
            order_id: row.get("order_id"),
            shares: row.get("shares"),
            price_per_share: row.get("price_per_share"),
            total_amount: row.get("total_amount"),
            money_provided: row.get("money_provided"),
            money_remaining: row.get("money_remaining"),
            order_timestamp: row.get("order_timestamp"),
            exchange_timestamp: row.get("exchange_timestamp"),
        }))
    }

    // -----------------------------------------------------------------------
    // Watchdog queries & cascades
    // -----------------------------------------------------------------------

    /// Executions still `queued` whose details or tasks have already moved.
    pub async fn skewed_queued_execution_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT se.id \
             FROM strategy_executions se \
             JOIN strategy_execution_details sed ON sed.execution_id = se.id \
             LEFT JOIN strategy_execution_tasks st ON st.execution_detail_id = sed.id \
             WHERE se.status = 'queued' \
               AND (sed.status != 'queued' OR (st.id IS NOT NULL AND st.status != 'queued'))",
        )
        .fetch_all(self.pool())
        .await
        .context("query skewed queued executions")?;
        Ok(rows)
    }

    /// Terminal executions that still have non-terminal details or tasks.
    pub async fn skewed_terminal_execution_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT se.id \
             FROM strategy_executions se \
             JOIN strategy_execution_details sed ON sed.execution_id = se.id \
             LEFT JOIN strategy_execution_tasks st ON st.execution_detail_id = sed.id \
             WHERE se.status IN ('completed', 'failed') \
               AND (sed.status NOT IN ('completed', 'failed') \
                    OR (st.id IS NOT NULL AND st.status NOT IN ('completed', 'failed')))",
        )
        .fetch_all(self.pool())
        .await
        .context("query skewed terminal executions")?;
        Ok(rows)
    }

    /// Fail every non-terminal detail and task under `execution_id`. The
    /// execution row itself is left alone; callers decide whether it too must
    /// fail. Idempotent: terminal rows are never touched.
    pub async fn fail_nonterminal_children(
        &self,
        execution_id: i64,
        reason: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.context("begin child cascade")?;
        sqlx::query(
            "UPDATE strategy_execution_details SET status = 'failed' \
             WHERE execution_id = ? AND status IN ('queued', 'running')",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .context("fail details")?;

        sqlx::query(
            "UPDATE strategy_execution_tasks \
             SET status = 'failed', error_message = ?, executed_at = ? \
             WHERE status IN ('queued', 'running') AND execution_detail_id IN \
               (SELECT id FROM strategy_execution_details WHERE execution_id = ?)",
        )
        .bind(reason)
        .bind(format_datetime(now))
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .context("fail tasks")?;
        tx.commit().await.context("commit child cascade")?;
        Ok(())
    }

    /// Fail an execution and its whole non-terminal subtree, top-down.
    pub async fn fail_execution_subtree(
        &self,
        execution_id: i64,
        reason: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE strategy_executions SET status = 'failed' \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(execution_id)
        .execute(self.pool())
        .await
        .context("fail execution")?;
        self.fail_nonterminal_children(execution_id, reason, now).await
    }
}
