//! 后台任务处理器：从队列取任务，按阶段跑完整条流水线
//!
//! 取号 → 校验数据源 → 主数据 → 门户补全 → 地图 → 报告 → 通知 → 清理。
//! 任意阶段失败直接进入 FAILED，通知和清理照常执行；每个任务结束都会回收共享浏览器。

use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::app::AppConfig;
use crate::app::config::{PortalConfig, WorkerConfig};
use crate::browser::BrowserLifecycle;
use crate::core::{
    ProcessResult, ProcessStats, ReportError, SourceError, StoreError, StoreResult, Task, TaskKind,
    TaskOutcome, TaskStatus,
};
use crate::db::Database;
use crate::scrape::{MapRenderer, PortalSession};
use crate::services::extract::{extract_from_spreadsheet, extract_from_text};
use crate::services::notifier::{notify_document, notify_text};
use crate::services::{
    CaptchaRecognizer, MapTaskLedger, Notifier, RecordSource, ReportAssembler, TaskQueue,
};
use crate::utils::text::truncate_chars;
use crate::workflow::enrich::PortalEnricher;
use crate::workflow::maps::MapGenerator;
use crate::workflow::pipeline::fetch_records;

/// 持久化和发给用户的错误文本上限
pub const ERROR_TEXT_LIMIT: usize = 300;

const INTERRUPTED_REASON: &str = "Обработка прервана перезапуском сервиса";

/// 任务级失败，消息即写入任务的 error_message
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("Кадастровые номера не найдены")]
    NoIdentifiers,

    #[error("API ключ не задан")]
    NotConfigured,

    #[error("API недоступен: {0}")]
    Unavailable(String),

    #[error("Ошибка создания файла: {0}")]
    Assembly(#[from] ReportError),

    #[error("Ошибка обработки: {0:#}")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for TaskFailure {
    fn from(e: anyhow::Error) -> Self {
        TaskFailure::Internal(e)
    }
}

impl From<StoreError> for TaskFailure {
    fn from(e: StoreError) -> Self {
        TaskFailure::Internal(e.into())
    }
}

impl TaskFailure {
    /// 给用户看的失败说明
    pub fn user_message(&self, task_id: i64) -> String {
        let header = format!("❌ Задача #{} завершена с ошибкой\n\n", task_id);
        let body = match self {
            TaskFailure::NoIdentifiers => "⚠️ Данные не найдены\n\n\
                 Кадастровые номера не найдены в предоставленных данных.\n\n\
                 💡 Проверьте:\n\
                 • Правильность формата номеров (XX:XX:XXXXXXX:XXXX)\n\
                 • Наличие номеров в тексте или файле"
                .to_string(),
            TaskFailure::NotConfigured => "🔑 API ключ не настроен\n\n\
                 Для получения данных необходимо настроить API ключ.\n\n\
                 Обратитесь к администратору для настройки API."
                .to_string(),
            TaskFailure::Unavailable(_) => "🌐 API Росреестра недоступен\n\n\
                 Сервис временно недоступен. Попробуйте повторить запрос позже.\n\n\
                 Если проблема сохраняется, обратитесь к администратору."
                .to_string(),
            TaskFailure::Assembly(e) => format!(
                "📄 Ошибка при создании файла\n\n\
                 Не удалось создать Excel файл с результатами.\n\n{}\n\n\
                 Обратитесь к администратору, если проблема повторяется.",
                truncate_error(&e.to_string())
            ),
            TaskFailure::Internal(e) => format!(
                "⚠️ Произошла ошибка при обработке\n\n{}\n\n\
                 Обратитесь к администратору, если проблема повторяется.",
                truncate_error(&format!("{:#}", e))
            ),
        };
        header + &body
    }
}

/// 超过上限的错误文本截断并加省略号
pub fn truncate_error(text: &str) -> String {
    if text.chars().count() > ERROR_TEXT_LIMIT {
        format!("{}...", truncate_chars(text, ERROR_TEXT_LIMIT))
    } else {
        text.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知 panic".to_string())
}

fn completion_message(task_id: i64, stats: &ProcessStats, balance: Option<f64>) -> String {
    let mut text = format!(
        "✅ Задача #{} завершена!\n\n📊 Статистика:\n• Успешно обработано: {}\n",
        task_id, stats.success
    );
    if stats.failed > 0 {
        text.push_str(&format!("• С ошибками: {}\n", stats.failed));
    }
    text.push_str(&format!("• Всего: {}\n", stats.total()));
    if let Some(balance) = balance.filter(|b| *b > 0.0) {
        text.push_str(&format!("\n💰 Текущий баланс API: {:.2} руб.", balance));
    }
    text
}

/// 处理器依赖的外部协作方
pub struct Collaborators {
    pub source: Arc<dyn RecordSource>,
    pub renderer: Arc<dyn MapRenderer>,
    /// 为 None 时跳过门户补全
    pub portal: Option<Arc<dyn PortalSession>>,
    pub recognizer: Arc<dyn CaptchaRecognizer>,
    pub assembler: Arc<dyn ReportAssembler>,
    pub notifier: Arc<dyn Notifier>,
    pub browser: Arc<dyn BrowserLifecycle>,
}

/// 成功跑完时交给通知阶段的内容
struct Delivered {
    stats: ProcessStats,
    balance: Option<f64>,
    output: PathBuf,
}

pub struct TaskWorker {
    db: Database,
    queue: Arc<TaskQueue>,
    ledger: MapTaskLedger,
    services: Collaborators,
    worker: WorkerConfig,
    portal: PortalConfig,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl TaskWorker {
    pub fn new(
        db: Database,
        queue: Arc<TaskQueue>,
        services: Collaborators,
        config: &AppConfig,
    ) -> Self {
        let ledger = MapTaskLedger::new(db.clone(), config.worker.map_retry_mode);
        Self {
            db,
            queue,
            ledger,
            services,
            worker: config.worker.clone(),
            portal: config.portal.clone(),
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
        }
    }

    /// 上次进程退出时停在 PROCESSING 的任务和地图子任务改为 FAILED
    pub async fn recover_interrupted(&self) -> StoreResult<(u64, u64)> {
        let tasks = self.db.fail_interrupted_tasks(INTERRUPTED_REASON).await?;
        let maps = self.db.fail_interrupted_map_tasks(INTERRUPTED_REASON).await?;
        if tasks + maps > 0 {
            warn!("已将 {} 个中断的任务和 {} 个地图子任务标记为失败", tasks, maps);
        }
        Ok((tasks, maps))
    }

    /// 主循环：空队列时轮询等待，循环本身出错时退避后继续
    pub async fn run(&self) {
        info!("🚀 任务处理器已启动");
        loop {
            match self.run_once().await {
                Ok(Some(status)) => debug!("任务结束: {}", status),
                Ok(None) => sleep(self.poll_interval).await,
                Err(e) => {
                    error!("❌ 任务循环出错: {}", e);
                    sleep(self.error_backoff).await;
                }
            }
        }
    }

    /// 处理一个任务，队列为空返回 None
    pub async fn run_once(&self) -> StoreResult<Option<TaskStatus>> {
        match self.queue.dequeue_next().await? {
            Some(task) => Ok(Some(self.process_task(task).await)),
            None => Ok(None),
        }
    }

    pub async fn process_task(&self, task: Task) -> TaskStatus {
        info!("[任务 {}] 开始处理（用户 {}）", task.id, task.user_id);
        let mut progress = TaskOutcome::default();

        let result = AssertUnwindSafe(self.run_pipeline(&task, &mut progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(TaskFailure::Internal(anyhow!(panic_message(payload)))));

        let status = match result {
            Ok(delivered) => {
                let text = completion_message(task.id, &delivered.stats, delivered.balance);
                notify_text(self.services.notifier.as_ref(), task.user_id, &text).await;
                notify_document(self.services.notifier.as_ref(), task.user_id, &delivered.output).await;
                info!("[任务 {}] ✓ 处理完成", task.id);
                TaskStatus::Completed
            }
            Err(failure) => {
                self.record_failure(&task, &progress, &failure).await;
                TaskStatus::Failed
            }
        };

        self.cleanup(&task, progress.output_file_path.as_deref()).await;
        status
    }

    async fn record_failure(&self, task: &Task, progress: &TaskOutcome, failure: &TaskFailure) {
        let error_text = truncate_error(&failure.to_string());
        match failure {
            TaskFailure::Internal(_) => error!("[任务 {}] ❌ 处理失败: {}", task.id, error_text),
            _ => warn!("[任务 {}] ❌ 处理失败: {}", task.id, error_text),
        }
        match self
            .db
            .finish_task(task.id, TaskStatus::Failed, progress, Some(&error_text))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("[任务 {}] 任务已处于终态，未覆盖", task.id),
            Err(e) => error!("[任务 {}] 写入失败状态出错: {}", task.id, e),
        }
        notify_text(
            self.services.notifier.as_ref(),
            task.user_id,
            &failure.user_message(task.id),
        )
        .await;
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        progress: &mut TaskOutcome,
    ) -> Result<Delivered, TaskFailure> {
        let identifiers = self.fetch_identifiers(task).await?;
        self.validate_source().await?;

        let count = identifiers.len();
        info!("[任务 {}] 地籍号 {} 个", task.id, count);
        notify_text(
            self.services.notifier.as_ref(),
            task.user_id,
            &format!(
                "🔄 Задача #{} в работе\n\n📊 Найдено номеров: {}\n🌐 Получение данных из Росреестра...\n\n⏳ Это может занять некоторое время.",
                task.id, count
            ),
        )
        .await;

        let fetched = fetch_records(
            task.id,
            &identifiers,
            self.services.source.as_ref(),
            Some(self.services.renderer.as_ref()),
            self.worker.progress_every,
        )
        .await;
        let mut records = fetched.records;

        if let Some(portal) = self.services.portal.as_deref().filter(|_| self.portal.enabled) {
            PortalEnricher::new(portal, self.services.recognizer.as_ref(), &self.portal)
                .enrich(&mut records)
                .await;
        }

        MapGenerator::new(
            &self.ledger,
            self.services.renderer.as_ref(),
            self.services.notifier.as_ref(),
            &self.worker,
        )
        .run(task, &mut records)
        .await;

        let mut stats = ProcessStats::default();
        for record in &records {
            stats.add_result(&if record.has_error() {
                ProcessResult::Failed
            } else {
                ProcessResult::Success
            });
        }
        progress.processed_count = count as i64;
        progress.successful_count = stats.success as i64;
        progress.failed_count = stats.failed as i64;

        let balance = match records.iter().find_map(|r| r.api_balance) {
            Some(balance) => Some(balance),
            None => self.services.source.account_balance().await.unwrap_or_else(|e| {
                warn!("[任务 {}] 查询余额失败: {}", task.id, e);
                None
            }),
        };
        progress.api_balance = balance;

        let source_file = task.input_file_path.as_deref().filter(|p| p.exists());
        let output = self.services.assembler.assemble(&records, source_file)?;
        info!("[任务 {}] 报告已生成: {}", task.id, output.display());
        progress.output_file_path = Some(output.clone());

        self.db
            .finish_task(task.id, TaskStatus::Completed, progress, None)
            .await?;

        Ok(Delivered {
            stats,
            balance,
            output,
        })
    }

    /// 优先用提交时解析好的列表，没有时再从原始输入重新解析
    async fn fetch_identifiers(&self, task: &Task) -> Result<Vec<String>, TaskFailure> {
        if let Some(identifiers) = task.identifiers.as_ref().filter(|ids| !ids.is_empty()) {
            return Ok(identifiers.clone());
        }

        let parsed = match task.kind {
            TaskKind::TextInput => task
                .input_data
                .as_deref()
                .map(extract_from_text)
                .unwrap_or_default(),
            TaskKind::FileUpload => match task.input_file_path.as_deref() {
                Some(path) if path.exists() => extract_from_spreadsheet(path).unwrap_or_else(|e| {
                    warn!("[任务 {}] 重新解析输入文件失败: {}", task.id, e);
                    Vec::new()
                }),
                _ => Vec::new(),
            },
        };
        if parsed.is_empty() {
            return Err(TaskFailure::NoIdentifiers);
        }
        self.db.update_task_identifiers(task.id, &parsed).await?;
        Ok(parsed)
    }

    async fn validate_source(&self) -> Result<(), TaskFailure> {
        let source = self.services.source.as_ref();
        if !source.is_configured() {
            return Err(TaskFailure::NotConfigured);
        }
        match source.check_availability().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TaskFailure::Unavailable("сервис не ответил".to_string())),
            Err(SourceError::NotConfigured) => Err(TaskFailure::NotConfigured),
            Err(e) => Err(TaskFailure::Unavailable(e.to_string())),
        }
    }

    /// 删除输入输出文件，然后回收浏览器。无论成败都只执行一次
    async fn cleanup(&self, task: &Task, output: Option<&Path>) {
        if self.worker.cleanup_files {
            for path in output.into_iter().chain(task.input_file_path.as_deref()) {
                if !path.exists() {
                    continue;
                }
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!("[任务 {}] 已删除 {}", task.id, path.display()),
                    Err(e) => warn!("[任务 {}] 删除文件 {} 失败: {}", task.id, path.display(), e),
                }
            }
        }

        self.services.renderer.close().await;
        if let Some(portal) = &self.services.portal {
            portal.close().await;
        }
        self.services.browser.recycle().await;
        info!("[任务 {}] 浏览器已回收，下一个任务将重新启动", task.id);
    }
}
