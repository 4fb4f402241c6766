use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::core::{EnrichedRecord, ProcessResult, ProcessStats};
use crate::scrape::MapRenderer;
use crate::services::RecordSource;
use crate::services::api_client::{CODE_API_ERROR, CODE_NOT_FOUND};

/// 主数据阶段的结果
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<EnrichedRecord>,
    pub stats: ProcessStats,
}

/// 逐个地籍号请求主数据源；单个失败记为错误记录，不中断。
/// 接口查不到的对象再到地图页读一次信息面板。
pub async fn fetch_records(
    task_id: i64,
    identifiers: &[String],
    source: &dyn RecordSource,
    fallback: Option<&dyn MapRenderer>,
    progress_every: usize,
) -> FetchOutcome {
    let total = identifiers.len();
    let progress_every = progress_every.max(1);

    stream::iter(identifiers.iter().enumerate())
        .then(|(idx, identifier)| async move {
            info!("[任务 {}] 处理 {}/{}: {}", task_id, idx + 1, total, identifier);
            let record = fetch_one(task_id, identifier, source, fallback).await;
            let done = idx + 1;
            if done % progress_every == 0 || done == total {
                info!(
                    "[任务 {}] 进度: {}/{} ({}%)",
                    task_id,
                    done,
                    total,
                    done * 100 / total
                );
            }
            record
        })
        .fold(FetchOutcome::default(), |mut outcome, record| async move {
            let result = if record.has_error() {
                ProcessResult::Failed
            } else {
                ProcessResult::Success
            };
            outcome.stats.add_result(&result);
            outcome.records.push(record);
            outcome
        })
        .await
}

async fn fetch_one(
    task_id: i64,
    identifier: &str,
    source: &dyn RecordSource,
    fallback: Option<&dyn MapRenderer>,
) -> EnrichedRecord {
    let record = match source.fetch_one(identifier).await {
        Ok(record) => record,
        Err(e) => {
            error!("[任务 {}] ❌ {} 请求失败: {}", task_id, identifier, e);
            return EnrichedRecord::failed(identifier, CODE_API_ERROR, e.to_string());
        }
    };

    if record.error_code.as_deref() != Some(CODE_NOT_FOUND) {
        return record;
    }
    let Some(renderer) = fallback else {
        return record;
    };

    match renderer.lookup_record(identifier).await {
        Some(mut found) => {
            info!("[任务 {}] ✓ {} 接口未找到，已从地图页补全", task_id, identifier);
            found.api_balance = record.api_balance;
            if found.coordinates.is_none() {
                found.coordinates = record.coordinates;
            }
            found
        }
        None => {
            warn!("[任务 {}] {} 在地图页也未找到", task_id, identifier);
            record
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MapError, PositionHint, SourceError};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TableSource;

    #[async_trait]
    impl RecordSource for TableSource {
        fn is_configured(&self) -> bool {
            true
        }
        async fn fetch_one(&self, identifier: &str) -> Result<EnrichedRecord, SourceError> {
            match identifier {
                "78:38:0022629:1006" => Ok(EnrichedRecord::failed(identifier, CODE_NOT_FOUND, "Данные не найдены")),
                "78:38:0022629:9999" => Err(SourceError::Unreachable("connection reset".into())),
                _ => {
                    let mut record = EnrichedRecord::new(identifier);
                    record.object_type = Some("Здание".to_string());
                    Ok(record)
                }
            }
        }
        async fn check_availability(&self) -> Result<bool, SourceError> {
            Ok(true)
        }
        async fn account_balance(&self) -> Result<Option<f64>, SourceError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct PanelRenderer {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl MapRenderer for PanelRenderer {
        async fn generate_one(&self, id: &str, _: Option<PositionHint>) -> Result<PathBuf, MapError> {
            Err(MapError::PlotNotFound(id.to_string()))
        }
        async fn lookup_record(&self, identifier: &str) -> Option<EnrichedRecord> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let mut record = EnrichedRecord::new(identifier);
            record.object_type = Some("Земельный участок".to_string());
            Some(record)
        }
        async fn restart_sub_session(&self) -> Result<(), MapError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_per_identifier_failures_are_contained() {
        let identifiers = ids(&["78:38:0022629:1115", "78:38:0022629:9999", "78:38:0022629:1006"]);
        let outcome = fetch_records(1, &identifiers, &TableSource, None, 10).await;

        assert_eq!(outcome.records.len(), 3, "每个地籍号都有一条记录");
        assert_eq!(outcome.stats.success, 1);
        assert_eq!(outcome.stats.failed, 2);
        assert_eq!(outcome.records[1].error_code.as_deref(), Some(CODE_API_ERROR));
        let order: Vec<_> = outcome.records.iter().map(|r| r.cadastral_number.as_str()).collect();
        assert_eq!(order, ["78:38:0022629:1115", "78:38:0022629:9999", "78:38:0022629:1006"]);
    }

    #[tokio::test]
    async fn test_not_found_falls_back_to_map_panel() {
        let renderer = PanelRenderer::default();
        let identifiers = ids(&["78:38:0022629:1115", "78:38:0022629:1006"]);
        let outcome = fetch_records(1, &identifiers, &TableSource, Some(&renderer), 10).await;

        assert_eq!(renderer.lookups.load(Ordering::SeqCst), 1, "只有未找到的才查地图页");
        assert_eq!(outcome.stats.success, 2);
        assert!(outcome.records[1].is_land_plot());
    }
}
