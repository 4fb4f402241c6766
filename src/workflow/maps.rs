//! 地图阶段：为地块登记子任务，再把待处理的子任务逐个交给地图抓取

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::app::config::{MapRetryMode, WorkerConfig};
use crate::core::{EnrichedRecord, MapFailureKind, MapSubTask, MapTaskStatus, StoreResult, Task};
use crate::scrape::MapRenderer;
use crate::services::notifier::notify_text;
use crate::services::{MapOutcome, MapTaskLedger, Notifier};

/// 地图失败时发给用户的说明
pub fn map_failure_message(kind: MapFailureKind, identifier: &str) -> String {
    let reason = match kind {
        MapFailureKind::NotFound => "Кадастровый участок не найден на карте.",
        MapFailureKind::MissingCoordinates => "Отсутствуют координаты участка.",
        MapFailureKind::Timeout => "Превышено время ожидания загрузки карты.",
        MapFailureKind::Generic => "Произошла ошибка при генерации карты.",
    };
    format!(
        "❌ Не удалось создать карту\n\n{}\nКадастровый номер: {}",
        reason, identifier
    )
}

pub struct MapGenerator<'a> {
    ledger: &'a MapTaskLedger,
    renderer: &'a dyn MapRenderer,
    notifier: &'a dyn Notifier,
    config: &'a WorkerConfig,
}

impl<'a> MapGenerator<'a> {
    pub fn new(
        ledger: &'a MapTaskLedger,
        renderer: &'a dyn MapRenderer,
        notifier: &'a dyn Notifier,
        config: &'a WorkerConfig,
    ) -> Self {
        Self {
            ledger,
            renderer,
            notifier,
            config,
        }
    }

    /// 返回本次新生成的地图数量。台账出错只记日志，不影响任务
    pub async fn run(&self, task: &Task, records: &mut [EnrichedRecord]) -> usize {
        if let Err(e) = self.register(task, records).await {
            warn!("[任务 {}] 登记地图子任务失败: {}", task.id, e);
        }
        match self.drain(task, records).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("[任务 {}] 处理地图子任务失败: {}", task.id, e);
                0
            }
        }
    }

    /// 每个地块登记一次；已有活动任务或缓存命中时不新建，缓存直接回填
    async fn register(&self, task: &Task, records: &mut [EnrichedRecord]) -> StoreResult<()> {
        for record in records.iter_mut().filter(|r| r.is_land_plot() && !r.has_error()) {
            let created = self
                .ledger
                .create(
                    Some(task.user_id),
                    &record.cadastral_number,
                    record.coordinates,
                    Some(task.id),
                    self.config.map_max_retries,
                )
                .await?;
            if created.is_none() {
                if let Some(path) = self.ledger.cached_map_path(&record.cadastral_number).await? {
                    debug!("复用已有地图: {}", path.display());
                    record.map_image_path = Some(path);
                }
            }
        }
        Ok(())
    }

    async fn drain(&self, task: &Task, records: &mut [EnrichedRecord]) -> StoreResult<usize> {
        let limit = self.config.map_drain_limit;
        let mut queue = self.ledger.list_pending(limit).await?;
        if self.config.map_retry_mode == MapRetryMode::Requeue {
            queue.extend(self.ledger.list_retryable(limit).await?);
        }
        if queue.is_empty() {
            return Ok(0);
        }

        info!("[任务 {}] 🗺 待生成地图 {} 个", task.id, queue.len());
        let mut rendered = 0;
        for sub in queue {
            if let Some(path) = self.render(task, &sub).await? {
                fill_map_path(records, &sub.identifier, &path);
                rendered += 1;
            }
        }
        Ok(rendered)
    }

    async fn render(&self, task: &Task, sub: &MapSubTask) -> StoreResult<Option<PathBuf>> {
        self.ledger
            .mark_status(sub.id, MapTaskStatus::Processing, None)
            .await?;

        let (outcome, kind) = match self.renderer.generate_one(&sub.identifier, sub.hint).await {
            Ok(path) => (MapOutcome::Rendered(path), None),
            Err(e) => (MapOutcome::Failed(e.to_string()), Some(e.failure_kind())),
        };

        let status = self.ledger.record_result(sub.id, &outcome).await?;
        match (outcome, status) {
            (MapOutcome::Rendered(path), _) => Ok(Some(path)),
            (MapOutcome::Failed(_), MapTaskStatus::Failed) => {
                let user_id = sub.user_id.unwrap_or(task.user_id);
                let kind = kind.unwrap_or(MapFailureKind::Generic);
                notify_text(self.notifier, user_id, &map_failure_message(kind, &sub.identifier)).await;
                Ok(None)
            }
            (MapOutcome::Failed(_), _) => Ok(None),
        }
    }
}

fn fill_map_path(records: &mut [EnrichedRecord], identifier: &str, path: &Path) {
    for record in records.iter_mut().filter(|r| r.cadastral_number == identifier) {
        record.map_image_path = Some(path.to_path_buf());
    }
}
