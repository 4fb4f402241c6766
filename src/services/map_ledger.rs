use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::app::config::MapRetryMode;
use crate::core::{MapSubTask, MapTaskStatus, PositionHint, StoreResult};
use crate::db::Database;
use crate::db::map_tasks::NewMapTask;

/// 一次地图抓取的结果
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Rendered(PathBuf),
    Failed(String),
}

/// 地图子任务台账：负责去重、状态流转和重试计数
#[derive(Debug, Clone)]
pub struct MapTaskLedger {
    db: Database,
    retry_mode: MapRetryMode,
}

impl MapTaskLedger {
    pub fn new(db: Database, retry_mode: MapRetryMode) -> Self {
        Self { db, retry_mode }
    }

    /// 新建子任务。同号已有活动任务，或已有文件仍在的完成记录（缓存命中）时返回 None
    pub async fn create(
        &self,
        user_id: Option<i64>,
        identifier: &str,
        hint: Option<PositionHint>,
        parent_task_id: Option<i64>,
        max_retries: i64,
    ) -> StoreResult<Option<MapSubTask>> {
        if let Some(active) = self.db.find_active_map_task(identifier).await? {
            info!(
                "地块 {} 已有进行中的地图任务 #{}（{}），跳过",
                identifier, active.id, active.status
            );
            return Ok(None);
        }

        if let Some(path) = self.cached_map_path(identifier).await? {
            info!("地块 {} 的地图已存在: {}", identifier, path.display());
            return Ok(None);
        }

        let created = self
            .db
            .insert_map_task(&NewMapTask {
                user_id,
                identifier,
                hint,
                parent_task_id,
                max_retries,
            })
            .await?;

        match &created {
            Some(task) => debug!("创建地图任务 #{}: {}", task.id, identifier),
            None => warn!("地块 {} 的地图任务已被并发创建，跳过", identifier),
        }
        Ok(created)
    }

    /// 最近一次完成且文件仍存在的地图路径
    pub async fn cached_map_path(&self, identifier: &str) -> StoreResult<Option<PathBuf>> {
        let completed = self
            .db
            .find_map_task_by_identifier(identifier, Some(MapTaskStatus::Completed))
            .await?;
        Ok(completed
            .and_then(|task| task.map_file_path)
            .filter(|path| file_exists(path)))
    }

    pub async fn list_pending(&self, limit: i64) -> StoreResult<Vec<MapSubTask>> {
        self.db
            .list_map_tasks_with_status(MapTaskStatus::Pending, limit)
            .await
    }

    pub async fn list_retryable(&self, limit: i64) -> StoreResult<Vec<MapSubTask>> {
        self.db.list_retryable_map_tasks(limit).await
    }

    pub async fn mark_status(
        &self,
        id: i64,
        status: MapTaskStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.db.set_map_task_status(id, status, error).await
    }

    /// 记录抓取结果，返回子任务的新状态
    pub async fn record_result(&self, id: i64, outcome: &MapOutcome) -> StoreResult<MapTaskStatus> {
        match outcome {
            MapOutcome::Rendered(path) => {
                self.db.complete_map_task(id, path).await?;
                info!("✓ 地图任务 #{} 完成: {}", id, path.display());
                Ok(MapTaskStatus::Completed)
            }
            MapOutcome::Failed(error) => {
                if self.retry_mode == MapRetryMode::Requeue {
                    if let Some(task) = self.db.get_map_task(id).await? {
                        if task.retry_count + 1 < task.max_retries {
                            self.db.mark_map_task_retrying(id, error).await?;
                            warn!(
                                "地图任务 #{} 失败，稍后重试（{}/{}）: {}",
                                id,
                                task.retry_count + 1,
                                task.max_retries,
                                error
                            );
                            return Ok(MapTaskStatus::Retrying);
                        }
                    }
                }
                self.db
                    .set_map_task_status(id, MapTaskStatus::Failed, Some(error))
                    .await?;
                warn!("❌ 地图任务 #{} 失败: {}", id, error);
                Ok(MapTaskStatus::Failed)
            }
        }
    }

    pub async fn get_by_id(&self, id: i64) -> StoreResult<Option<MapSubTask>> {
        self.db.get_map_task(id).await
    }

    pub async fn get_by_identifier(
        &self,
        identifier: &str,
        status: Option<MapTaskStatus>,
    ) -> StoreResult<Option<MapSubTask>> {
        self.db.find_map_task_by_identifier(identifier, status).await
    }

    pub async fn list_for_user(&self, user_id: i64, limit: i64) -> StoreResult<Vec<MapSubTask>> {
        self.db.list_user_map_tasks(user_id, limit).await
    }
}

fn file_exists(path: &Path) -> bool {
    path.is_file()
}
