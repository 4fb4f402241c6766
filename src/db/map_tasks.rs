use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::path::{Path, PathBuf};

use super::{Database, from_micros, from_micros_opt, is_unique_violation, to_micros};
use crate::core::{MapSubTask, MapTaskStatus, PositionHint, StoreError, StoreResult};

const MAP_COLUMNS: &str = "id, parent_task_id, user_id, cadastral_number, coordinate_x, coordinate_y, \
     status, retry_count, max_retries, map_file_path, error_message, created_at, started_at, \
     completed_at, last_retry_at";

fn map_task_from_row(row: &SqliteRow) -> StoreResult<MapSubTask> {
    let status: String = row.try_get("status")?;
    let x: Option<f64> = row.try_get("coordinate_x")?;
    let y: Option<f64> = row.try_get("coordinate_y")?;

    Ok(MapSubTask {
        id: row.try_get("id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        user_id: row.try_get("user_id")?,
        identifier: row.try_get("cadastral_number")?,
        hint: x.zip(y).map(|(x, y)| PositionHint { x, y }),
        status: status.parse::<MapTaskStatus>().map_err(StoreError::Corrupt)?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        map_file_path: row
            .try_get::<Option<String>, _>("map_file_path")?
            .map(PathBuf::from),
        error_message: row.try_get("error_message")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        started_at: from_micros_opt(row.try_get("started_at")?)?,
        completed_at: from_micros_opt(row.try_get("completed_at")?)?,
        last_retry_at: from_micros_opt(row.try_get("last_retry_at")?)?,
    })
}

/// 插入地图子任务需要的字段
#[derive(Debug, Clone)]
pub struct NewMapTask<'a> {
    pub user_id: Option<i64>,
    pub identifier: &'a str,
    pub hint: Option<PositionHint>,
    pub parent_task_id: Option<i64>,
    pub max_retries: i64,
}

impl Database {
    /// 插入 PENDING 子任务；同号已有活动记录（唯一索引冲突）时返回 None
    pub async fn insert_map_task(&self, new_task: &NewMapTask<'_>) -> StoreResult<Option<MapSubTask>> {
        let result = sqlx::query(&format!(
            "INSERT INTO map_generation_tasks \
                 (parent_task_id, user_id, cadastral_number, coordinate_x, coordinate_y, status, max_retries, created_at) \
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?) RETURNING {}",
            MAP_COLUMNS
        ))
        .bind(new_task.parent_task_id)
        .bind(new_task.user_id)
        .bind(new_task.identifier)
        .bind(new_task.hint.map(|h| h.x))
        .bind(new_task.hint.map(|h| h.y))
        .bind(new_task.max_retries)
        .bind(to_micros(Utc::now()))
        .fetch_one(self.pool())
        .await;

        match result {
            Ok(row) => Ok(Some(map_task_from_row(&row)?)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_map_task(&self, id: i64) -> StoreResult<Option<MapSubTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM map_generation_tasks WHERE id = ?",
            MAP_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_task_from_row).transpose()
    }

    pub async fn find_active_map_task(&self, identifier: &str) -> StoreResult<Option<MapSubTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM map_generation_tasks \
             WHERE cadastral_number = ? AND status IN ('pending', 'processing', 'retrying') \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            MAP_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_task_from_row).transpose()
    }

    /// 按地籍号取最新记录；给了状态就只在该状态里找，COMPLETED 按完成时间排序
    pub async fn find_map_task_by_identifier(
        &self,
        identifier: &str,
        status: Option<MapTaskStatus>,
    ) -> StoreResult<Option<MapSubTask>> {
        let row = match status {
            Some(MapTaskStatus::Completed) => {
                sqlx::query(&format!(
                    "SELECT {} FROM map_generation_tasks WHERE cadastral_number = ? AND status = 'completed' \
                     ORDER BY completed_at DESC, id DESC LIMIT 1",
                    MAP_COLUMNS
                ))
                .bind(identifier)
                .fetch_optional(self.pool())
                .await?
            }
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM map_generation_tasks WHERE cadastral_number = ? AND status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    MAP_COLUMNS
                ))
                .bind(identifier)
                .bind(status.as_str())
                .fetch_optional(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM map_generation_tasks WHERE cadastral_number = ? \
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    MAP_COLUMNS
                ))
                .bind(identifier)
                .fetch_optional(self.pool())
                .await?
            }
        };
        row.as_ref().map(map_task_from_row).transpose()
    }

    pub async fn list_map_tasks_with_status(
        &self,
        status: MapTaskStatus,
        limit: i64,
    ) -> StoreResult<Vec<MapSubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM map_generation_tasks WHERE status = ? ORDER BY created_at, id LIMIT ?",
            MAP_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_task_from_row).collect()
    }

    pub async fn list_retryable_map_tasks(&self, limit: i64) -> StoreResult<Vec<MapSubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM map_generation_tasks \
             WHERE status = 'retrying' AND retry_count < max_retries \
             ORDER BY last_retry_at, id LIMIT ?",
            MAP_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_task_from_row).collect()
    }

    pub async fn list_user_map_tasks(&self, user_id: i64, limit: i64) -> StoreResult<Vec<MapSubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM map_generation_tasks WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            MAP_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_task_from_row).collect()
    }

    /// 设置状态并按状态记录开始/完成时间
    pub async fn set_map_task_status(
        &self,
        id: i64,
        status: MapTaskStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let now = to_micros(Utc::now());
        let started_at = (status == MapTaskStatus::Processing).then_some(now);
        let completed_at =
            matches!(status, MapTaskStatus::Completed | MapTaskStatus::Failed).then_some(now);

        sqlx::query(
            "UPDATE map_generation_tasks SET status = ?, \
                 error_message = COALESCE(?, error_message), \
                 started_at = COALESCE(?, started_at), \
                 completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn complete_map_task(&self, id: i64, map_file: &Path) -> StoreResult<()> {
        sqlx::query(
            "UPDATE map_generation_tasks SET status = 'completed', map_file_path = ?, \
                 error_message = NULL, completed_at = ? WHERE id = ?",
        )
        .bind(map_file.to_string_lossy().into_owned())
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// 失败一次：计数加一并转为 RETRYING
    pub async fn mark_map_task_retrying(&self, id: i64, error_message: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE map_generation_tasks SET status = 'retrying', retry_count = retry_count + 1, \
                 error_message = ?, last_retry_at = ? WHERE id = ?",
        )
        .bind(error_message)
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fail_interrupted_map_tasks(&self, reason: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE map_generation_tasks SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE status = 'processing'",
        )
        .bind(reason)
        .bind(to_micros(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_map_task(identifier: &str) -> NewMapTask<'_> {
        NewMapTask {
            user_id: Some(1),
            identifier,
            hint: Some(PositionHint { x: 30.1, y: 59.9 }),
            parent_task_id: None,
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn test_unique_active_index_rejects_second_insert() {
        let db = Database::in_memory().await.unwrap();
        let first = db.insert_map_task(&new_map_task("47:14:1203001:814")).await.unwrap();
        assert!(first.is_some());
        let second = db.insert_map_task(&new_map_task("47:14:1203001:814")).await.unwrap();
        assert!(second.is_none(), "同号已有活动子任务时插入被拒绝");

        let first = first.unwrap();
        assert_eq!(first.hint, Some(PositionHint { x: 30.1, y: 59.9 }));
        db.set_map_task_status(first.id, MapTaskStatus::Failed, Some("x")).await.unwrap();
        assert!(
            db.insert_map_task(&new_map_task("47:14:1203001:814")).await.unwrap().is_some(),
            "旧记录结束后可以再建"
        );
    }

    #[tokio::test]
    async fn test_status_stamps() {
        let db = Database::in_memory().await.unwrap();
        let task = db.insert_map_task(&new_map_task("47:14:1203001:814")).await.unwrap().unwrap();

        db.set_map_task_status(task.id, MapTaskStatus::Processing, None).await.unwrap();
        let processing = db.get_map_task(task.id).await.unwrap().unwrap();
        assert!(processing.started_at.is_some());
        assert!(processing.completed_at.is_none());

        db.complete_map_task(task.id, Path::new("maps/47_14_1203001_814_map.png")).await.unwrap();
        let done = db.get_map_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, MapTaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(
            done.map_file_path.as_deref(),
            Some(Path::new("maps/47_14_1203001_814_map.png"))
        );
    }

    #[tokio::test]
    async fn test_retryable_listing() {
        let db = Database::in_memory().await.unwrap();
        let mut new_task = new_map_task("47:14:1203001:814");
        new_task.max_retries = 2;
        let task = db.insert_map_task(&new_task).await.unwrap().unwrap();

        db.mark_map_task_retrying(task.id, "timeout").await.unwrap();
        assert_eq!(db.list_retryable_map_tasks(10).await.unwrap().len(), 1);

        db.mark_map_task_retrying(task.id, "timeout").await.unwrap();
        assert!(
            db.list_retryable_map_tasks(10).await.unwrap().is_empty(),
            "retry_count 达到上限后不再可重试"
        );
    }
}
