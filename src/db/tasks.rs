use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite};
use sqlx::sqlite::SqliteRow;
use std::path::PathBuf;

use super::{Database, from_micros, from_micros_opt, to_micros};
use crate::core::{NewTask, StoreError, StoreResult, Task, TaskKind, TaskOutcome, TaskStatus};

const TASK_COLUMNS: &str = "id, user_id, task_type, status, input_data, cadastral_numbers, \
     processed_count, successful_count, failed_count, input_file_path, output_file_path, \
     error_message, api_balance, created_at, started_at, completed_at";

fn task_from_row(row: &SqliteRow) -> StoreResult<Task> {
    let kind: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let identifiers: Option<String> = row.try_get("cadastral_numbers")?;
    let identifiers = match identifiers {
        Some(raw) if !raw.is_empty() => Some(serde_json::from_str::<Vec<String>>(&raw)?),
        _ => None,
    };

    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<TaskKind>().map_err(StoreError::Corrupt)?,
        status: status.parse::<TaskStatus>().map_err(StoreError::Corrupt)?,
        input_data: row.try_get("input_data")?,
        identifiers,
        processed_count: row.try_get("processed_count")?,
        successful_count: row.try_get("successful_count")?,
        failed_count: row.try_get("failed_count")?,
        input_file_path: row
            .try_get::<Option<String>, _>("input_file_path")?
            .map(PathBuf::from),
        output_file_path: row
            .try_get::<Option<String>, _>("output_file_path")?
            .map(PathBuf::from),
        error_message: row.try_get("error_message")?,
        api_balance: row.try_get("api_balance")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        started_at: from_micros_opt(row.try_get("started_at")?)?,
        completed_at: from_micros_opt(row.try_get("completed_at")?)?,
    })
}

fn path_text(path: Option<&PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

impl Database {
    /// 新建任务，初始状态 PENDING
    pub async fn create_task(&self, new_task: &NewTask) -> StoreResult<Task> {
        let identifiers = serde_json::to_string(&new_task.identifiers)?;
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (user_id, task_type, status, input_data, cadastral_numbers, input_file_path, created_at) \
             VALUES (?, ?, 'pending', ?, ?, ?, ?) RETURNING {}",
            TASK_COLUMNS
        ))
        .bind(new_task.user_id)
        .bind(new_task.kind.as_str())
        .bind(new_task.input_data.as_deref())
        .bind(identifiers)
        .bind(path_text(new_task.input_file_path.as_ref()))
        .bind(to_micros(Utc::now()))
        .fetch_one(self.pool())
        .await?;
        task_from_row(&row)
    }

    pub async fn get_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// 修改任务状态，只允许向前迁移；返回是否真正写入
    pub async fn set_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        if !task.status.can_transition_to(status) {
            return Ok(false);
        }

        let now = to_micros(Utc::now());
        let started_at = (status == TaskStatus::Processing && task.status != TaskStatus::Processing)
            .then_some(now);
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query(
            "UPDATE tasks SET status = ?, \
                 error_message = COALESCE(?, error_message), \
                 started_at = COALESCE(?, started_at), \
                 completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(started_at)
        .bind(completed_at)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(true)
    }

    pub async fn count_tasks_with_status(&self, statuses: &[TaskStatus]) -> StoreResult<i64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT COUNT(*) FROM tasks WHERE status IN ({})", placeholders);
        let mut query = sqlx::query_scalar::<Sqlite, i64>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        Ok(query.fetch_one(self.pool()).await?)
    }

    /// 在同一条语句里取出最早的 PENDING 任务并置为 PROCESSING
    pub async fn claim_oldest_pending(&self) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "UPDATE tasks SET status = 'processing', started_at = ? \
             WHERE id = (SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at, id LIMIT 1) \
             RETURNING {}",
            TASK_COLUMNS
        ))
        .bind(to_micros(Utc::now()))
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// 排在该任务之前的 PENDING 任务数（按创建时间，时间相同按 id）
    pub async fn count_pending_before(&self, created_at: DateTime<Utc>, task_id: i64) -> StoreResult<i64> {
        let created = to_micros(created_at);
        let count = sqlx::query_scalar::<Sqlite, i64>(
            "SELECT COUNT(*) FROM tasks WHERE status = 'pending' \
             AND (created_at < ? OR (created_at = ? AND id < ?))",
        )
        .bind(created)
        .bind(created)
        .bind(task_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn update_task_identifiers(&self, task_id: i64, identifiers: &[String]) -> StoreResult<()> {
        sqlx::query("UPDATE tasks SET cadastral_numbers = ? WHERE id = ?")
            .bind(serde_json::to_string(identifiers)?)
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// 写回统计、产物路径和终态
    pub async fn finish_task(
        &self,
        task_id: i64,
        status: TaskStatus,
        outcome: &TaskOutcome,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        if !status.is_terminal() {
            return Err(StoreError::Corrupt(format!("{} 不是终态", status)));
        }
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, processed_count = ?, successful_count = ?, failed_count = ?, \
                 output_file_path = COALESCE(?, output_file_path), api_balance = COALESCE(?, api_balance), \
                 error_message = COALESCE(?, error_message), completed_at = ? \
             WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(status.as_str())
        .bind(outcome.processed_count)
        .bind(outcome.successful_count)
        .bind(outcome.failed_count)
        .bind(path_text(outcome.output_file_path.as_ref()))
        .bind(outcome.api_balance)
        .bind(error_message)
        .bind(to_micros(Utc::now()))
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_user_tasks(&self, user_id: i64, limit: i64) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// 上次进程崩溃时停在 PROCESSING 的任务直接判失败
    pub async fn fail_interrupted_tasks(&self, reason: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_message = ?, completed_at = ? WHERE status = 'processing'",
        )
        .bind(reason)
        .bind(to_micros(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
