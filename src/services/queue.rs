use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::{StoreResult, Task, TaskStatus};
use crate::db::Database;

/// 先进先出的任务队列，所有操作都经过同一把锁
#[derive(Debug)]
pub struct TaskQueue {
    db: Database,
    lock: Mutex<()>,
}

impl TaskQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    /// 把任务放入队列（重新确认为 PENDING），返回当前排队+处理中的任务数（含本任务）。
    /// 任务不存在或已离开 PENDING 时返回 0 并记录日志。
    pub async fn enqueue(&self, task_id: i64) -> StoreResult<i64> {
        let _guard = self.lock.lock().await;

        let Some(task) = self.db.get_task(task_id).await? else {
            error!("任务 {} 不存在，无法加入队列", task_id);
            return Ok(0);
        };
        if !self.db.set_task_status(task_id, TaskStatus::Pending, None).await? {
            warn!("任务 {} 当前状态为 {}，不能重新排队", task_id, task.status);
            return Ok(0);
        }

        let position = self
            .db
            .count_tasks_with_status(&[TaskStatus::Pending, TaskStatus::Processing])
            .await?;
        info!("📥 任务 {} 已加入队列，位置 {}", task_id, position);
        Ok(position)
    }

    /// 取出最早创建的 PENDING 任务并置为 PROCESSING
    pub async fn dequeue_next(&self) -> StoreResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let task = self.db.claim_oldest_pending().await?;
        if let Some(task) = &task {
            debug!("从队列取出任务 {}", task.id);
        }
        Ok(task)
    }

    /// PENDING 任务数
    pub async fn size(&self) -> StoreResult<i64> {
        let _guard = self.lock.lock().await;
        self.db.count_tasks_with_status(&[TaskStatus::Pending]).await
    }

    /// 任务在队列中的位置（从 1 开始），不在排队中返回 0。每次都重新计算。
    pub async fn position_of(&self, task_id: i64) -> StoreResult<i64> {
        let _guard = self.lock.lock().await;
        let Some(task) = self.db.get_task(task_id).await? else {
            return Ok(0);
        };
        if task.status != TaskStatus::Pending {
            return Ok(0);
        }
        let ahead = self.db.count_pending_before(task.created_at, task.id).await?;
        Ok(ahead + 1)
    }
}
