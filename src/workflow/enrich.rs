//! 门户补全：接口返回的权利/限制缺少“编号+日期”细节时，到 lk.rosreestr.ru 查卡片
//!
//! 两层重试：外层整条记录重来（重新导航或重建会话），内层只重试验证码。

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::config::PortalConfig;
use crate::core::{EnrichedRecord, PortalDetails, PortalError};
use crate::scrape::PortalSession;
use crate::services::CaptchaRecognizer;
use crate::workflow::retry::{RetryPolicy, retry_with_policy};

pub struct PortalEnricher<'a> {
    portal: &'a dyn PortalSession,
    recognizer: &'a dyn CaptchaRecognizer,
    outer: RetryPolicy,
    inner: RetryPolicy,
    object_pause: Duration,
}

impl<'a> PortalEnricher<'a> {
    pub fn new(
        portal: &'a dyn PortalSession,
        recognizer: &'a dyn CaptchaRecognizer,
        config: &PortalConfig,
    ) -> Self {
        Self {
            portal,
            recognizer,
            outer: RetryPolicy::from_millis(config.outer_attempts, config.outer_backoff_ms),
            inner: RetryPolicy::from_millis(config.captcha_attempts, config.captcha_backoff_ms),
            object_pause: Duration::from_millis(config.object_pause_ms),
        }
    }

    /// 补全所有需要的记录，返回成功补全的条数。阶段结束时关闭门户子会话
    pub async fn enrich(&self, records: &mut [EnrichedRecord]) -> usize {
        let targets: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.needs_portal_enrichment())
            .map(|(idx, _)| idx)
            .collect();
        if targets.is_empty() {
            debug!("没有需要门户补全的记录");
            return 0;
        }

        info!("📥 门户补全 {} 条记录", targets.len());
        if let Err(e) = self.open_or_restart().await {
            warn!("❌ 门户无法打开，保留接口数据: {}", e);
            self.portal.close().await;
            return 0;
        }

        let mut enriched = 0;
        for (pos, &idx) in targets.iter().enumerate() {
            let identifier = records[idx].cadastral_number.clone();
            if pos > 0 {
                tokio::time::sleep(self.object_pause).await;
                if let Err(e) = self.portal.back_to_search().await {
                    warn!("返回搜索页失败: {}，重建会话", e);
                    if let Err(e) = self.portal.restart().await {
                        warn!("❌ 门户会话重建失败，停止补全: {}", e);
                        break;
                    }
                }
            }

            match self.fetch_details(&identifier).await {
                Ok(details) if !details.is_empty() => {
                    records[idx].apply_portal_details(&details);
                    enriched += 1;
                    info!("✓ 门户补全 {}", identifier);
                }
                Ok(_) => warn!("门户卡片中没有 {} 的权利信息", identifier),
                Err(e) => warn!("❌ 门户补全 {} 失败，保留接口数据: {}", identifier, e),
            }
        }

        self.portal.close().await;
        info!("门户补全完成: {}/{}", enriched, targets.len());
        enriched
    }

    async fn open_or_restart(&self) -> Result<(), PortalError> {
        match self.portal.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("打开门户失败: {}，重建会话后再试", e);
                self.portal.restart().await
            }
        }
    }

    async fn fetch_details(&self, identifier: &str) -> Result<PortalDetails, PortalError> {
        let label = format!("门户查询 {}", identifier);
        retry_with_policy(
            &self.outer,
            &label,
            |_| self.attempt(identifier),
            |_| true,
            |e: &PortalError| {
                let restart = e.needs_restart();
                async move { self.recover(restart).await }
            },
        )
        .await
    }

    async fn recover(&self, restart: bool) {
        let result = if restart {
            self.portal.restart().await
        } else {
            self.portal.back_to_search().await
        };
        if let Err(e) = result {
            warn!("门户恢复失败: {}", e);
        }
    }

    async fn attempt(&self, identifier: &str) -> Result<PortalDetails, PortalError> {
        self.portal.fill_identifier(identifier).await?;
        retry_with_policy(
            &self.inner,
            "验证码",
            |_| self.solve_captcha(),
            PortalError::is_captcha,
            |_| async move {
                if let Err(e) = self.portal.reload_captcha().await {
                    warn!("刷新验证码失败: {}", e);
                }
            },
        )
        .await?;
        self.portal.open_first_result().await?;
        self.portal.extract_details().await
    }

    async fn solve_captcha(&self) -> Result<(), PortalError> {
        let image = self.portal.captcha_image().await?;
        let text = self.recognizer.recognize(&image).await;
        if let Err(e) = tokio::fs::remove_file(&image).await {
            debug!("删除验证码截图失败: {}", e);
        }
        let Some(text) = text else {
            return Err(PortalError::CaptchaUnrecognized);
        };
        debug!("验证码识别结果: {}", text);

        self.portal.fill_captcha(&text).await?;
        self.portal.submit().await?;
        if self.portal.captcha_rejected().await? {
            return Err(PortalError::CaptchaRejected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按脚本返回结果的门户
    #[derive(Default)]
    struct ScriptedPortal {
        rejections: AtomicUsize,
        first_result_errors: Mutex<Vec<PortalError>>,
        submits: AtomicUsize,
        reloads: AtomicUsize,
        restarts: AtomicUsize,
        backs: AtomicUsize,
        closes: AtomicUsize,
        filled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PortalSession for ScriptedPortal {
        async fn open(&self) -> Result<(), PortalError> {
            Ok(())
        }
        async fn fill_identifier(&self, identifier: &str) -> Result<(), PortalError> {
            self.filled.lock().unwrap().push(identifier.to_string());
            Ok(())
        }
        async fn captcha_image(&self) -> Result<PathBuf, PortalError> {
            Ok(PathBuf::from("/nonexistent/captcha.png"))
        }
        async fn fill_captcha(&self, _: &str) -> Result<(), PortalError> {
            Ok(())
        }
        async fn submit(&self) -> Result<(), PortalError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn captcha_rejected(&self) -> Result<bool, PortalError> {
            let left = self.rejections.load(Ordering::SeqCst);
            if left > 0 {
                self.rejections.store(left - 1, Ordering::SeqCst);
                return Ok(true);
            }
            Ok(false)
        }
        async fn reload_captcha(&self) -> Result<(), PortalError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn open_first_result(&self) -> Result<(), PortalError> {
            match self.first_result_errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        async fn extract_details(&self) -> Result<PortalDetails, PortalError> {
            Ok(PortalDetails {
                rights: Some("Собственность № 78-78/001-2020 от 01.02.2020".to_string()),
                encumbrances: None,
            })
        }
        async fn back_to_search(&self) -> Result<(), PortalError> {
            self.backs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn restart(&self) -> Result<(), PortalError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedRecognizer(Option<&'static str>);

    #[async_trait]
    impl CaptchaRecognizer for FixedRecognizer {
        async fn recognize(&self, _: &Path) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn fast_config() -> PortalConfig {
        PortalConfig {
            outer_backoff_ms: 0,
            captcha_backoff_ms: 0,
            object_pause_ms: 0,
            ..PortalConfig::default()
        }
    }

    fn record_without_detail(id: &str) -> EnrichedRecord {
        let mut record = EnrichedRecord::new(id);
        record.rights = Some("Собственность".to_string());
        record
    }

    #[tokio::test]
    async fn test_captcha_rejection_retries_inner_loop_only() {
        let portal = ScriptedPortal {
            rejections: AtomicUsize::new(2),
            ..Default::default()
        };
        let recognizer = FixedRecognizer(Some("ab12c"));
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![record_without_detail("78:38:0022629:1115")];
        assert_eq!(enricher.enrich(&mut records).await, 1);
        assert!(records[0].has_detailed_rights(), "门户数据应覆盖接口数据");
        assert_eq!(portal.submits.load(Ordering::SeqCst), 3);
        assert_eq!(portal.reloads.load(Ordering::SeqCst), 2, "每次被拒后刷新验证码");
        assert_eq!(portal.filled.lock().unwrap().len(), 1, "内层重试不重新输入地籍号");
        assert_eq!(portal.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_api_data() {
        let portal = ScriptedPortal {
            first_result_errors: Mutex::new(vec![
                PortalError::NoResults,
                PortalError::NoDetailLink,
                PortalError::NoResults,
            ]),
            ..Default::default()
        };
        let recognizer = FixedRecognizer(Some("ab12c"));
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![record_without_detail("78:38:0022629:1115")];
        assert_eq!(enricher.enrich(&mut records).await, 0);
        assert_eq!(records[0].rights.as_deref(), Some("Собственность"));
        assert_eq!(portal.filled.lock().unwrap().len(), 3, "外层重试三次");
        assert_eq!(portal.backs.load(Ordering::SeqCst), 2, "非会话错误回到搜索页");
        assert_eq!(portal.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_error_restarts_sub_session() {
        let portal = ScriptedPortal {
            first_result_errors: Mutex::new(vec![PortalError::Navigation("net::ERR_ABORTED".into())]),
            ..Default::default()
        };
        let recognizer = FixedRecognizer(Some("ab12c"));
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![record_without_detail("78:38:0022629:1115")];
        assert_eq!(enricher.enrich(&mut records).await, 1);
        assert_eq!(portal.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_timeout_restarts_sub_session() {
        let portal = ScriptedPortal {
            first_result_errors: Mutex::new(vec![PortalError::from(
                chromiumoxide::error::CdpError::Timeout,
            )]),
            ..Default::default()
        };
        let recognizer = FixedRecognizer(Some("ab12c"));
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![record_without_detail("78:38:0022629:1115")];
        assert_eq!(enricher.enrich(&mut records).await, 1);
        assert_eq!(portal.restarts.load(Ordering::SeqCst), 1, "超时后重建会话");
        assert_eq!(portal.backs.load(Ordering::SeqCst), 0, "超时不走返回搜索页");
    }

    #[tokio::test]
    async fn test_unrecognized_captcha_gives_up_after_inner_and_outer_limits() {
        let portal = ScriptedPortal::default();
        let recognizer = FixedRecognizer(None);
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![record_without_detail("78:38:0022629:1115")];
        assert_eq!(enricher.enrich(&mut records).await, 0);
        assert_eq!(portal.submits.load(Ordering::SeqCst), 0, "识别失败不提交");
        assert_eq!(portal.reloads.load(Ordering::SeqCst), 3 * 4, "每轮外层内刷新四次");
    }

    #[tokio::test]
    async fn test_skips_records_that_need_nothing() {
        let portal = ScriptedPortal::default();
        let recognizer = FixedRecognizer(Some("ab12c"));
        let enricher = PortalEnricher::new(&portal, &recognizer, &fast_config());

        let mut records = vec![EnrichedRecord::failed("78:38:0022629:1006", "NOT_FOUND", "не найден")];
        assert_eq!(enricher.enrich(&mut records).await, 0);
        assert!(portal.filled.lock().unwrap().is_empty());
        assert_eq!(portal.closes.load(Ordering::SeqCst), 0, "没有目标时不打开门户");
    }
}
