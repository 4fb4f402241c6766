use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::config::PortalConfig;
use crate::browser::actions::{click_when_ready, evaluate, navigate, pause, wait_for_selector};
use crate::browser::scripts::{
    LOCATION_JS, PORTAL_CAPTCHA_ERROR_JS, PORTAL_CENTER_FORM_JS, PORTAL_FIRST_RESULT_JS, call_js,
    focus_and_clear_js,
};
use crate::browser::{SharedBrowser, SubSession};
use crate::core::{PortalDetails, PortalError};
use crate::scrape::portal_extract::{parse_rights_data, parse_rights_html};

const SEARCH_FORM: &str = ".realestateobjects-wrapper.card";
const QUERY_INPUT: &str = "#query";
const CAPTCHA_IMAGE: &str = ".rros-ui-lib-captcha-content-img";
const CAPTCHA_INPUT: &str = "#captcha";
const CAPTCHA_RELOAD: &str = ".rros-ui-lib-captcha-content-reload-btn";
const SEARCH_BUTTON: &str = "#realestateobjects-search";
const RESULTS_TABLE: &str = ".rros-ui-lib-table";
const OBJECT_CARD: &str = ".build-card-wrapper";
const PORTAL_PAGE_MARKER: &str = "real-estate-objects-online";

/// 门户查询的分步接口，由补全阶段按顺序驱动
#[async_trait]
pub trait PortalSession: Send + Sync {
    async fn open(&self) -> Result<(), PortalError>;
    async fn fill_identifier(&self, identifier: &str) -> Result<(), PortalError>;
    /// 把当前验证码截成 PNG，返回文件路径，调用方负责删除
    async fn captcha_image(&self) -> Result<PathBuf, PortalError>;
    async fn fill_captcha(&self, text: &str) -> Result<(), PortalError>;
    async fn submit(&self) -> Result<(), PortalError>;
    async fn captcha_rejected(&self) -> Result<bool, PortalError>;
    async fn reload_captcha(&self) -> Result<(), PortalError>;
    /// 等结果表出现，点开第一条，等卡片加载
    async fn open_first_result(&self) -> Result<(), PortalError>;
    async fn extract_details(&self) -> Result<PortalDetails, PortalError>;
    async fn back_to_search(&self) -> Result<(), PortalError>;
    /// 只重建自己的子会话并重新打开搜索页
    async fn restart(&self) -> Result<(), PortalError>;
    async fn close(&self);
}

/// lk.rosreestr.ru 在线查询页
pub struct RosreestrPortal {
    browser: Arc<SharedBrowser>,
    config: PortalConfig,
    captcha_dir: PathBuf,
    sub: Mutex<Option<SubSession>>,
}

impl RosreestrPortal {
    pub fn new(browser: Arc<SharedBrowser>, config: PortalConfig, captcha_dir: PathBuf) -> Self {
        Self {
            browser,
            config,
            captcha_dir,
            sub: Mutex::new(None),
        }
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.config.step_timeout_secs)
    }

    async fn page(&self) -> Result<Page, PortalError> {
        let mut slot = self.sub.lock().await;
        if let Some(sub) = slot.as_ref() {
            if self.browser.is_current(sub).await {
                return Ok(sub.page.clone());
            }
            debug!("门户子会话已过期，重新创建");
        }
        let sub = self
            .browser
            .open_sub_session(&self.browser.default_options())
            .await
            .map_err(|e| PortalError::Browser(format!("{:#}", e)))?;
        let page = sub.page.clone();
        *slot = Some(sub);
        Ok(page)
    }

    async fn drop_sub_session(&self) {
        if let Some(sub) = self.sub.lock().await.take() {
            self.browser.close_sub_session(sub).await;
        }
    }

    /// 等搜索表单出现并滚到屏幕中央
    async fn await_form(&self, page: &Page) -> Result<(), PortalError> {
        if !wait_for_selector(page, SEARCH_FORM, self.step_timeout()).await? {
            return Err(PortalError::Navigation("搜索表单未加载".to_string()));
        }
        let _: bool = evaluate(page, call_js(PORTAL_CENTER_FORM_JS, ""), self.step_timeout()).await?;
        pause(500).await;
        Ok(())
    }

    /// 清空后逐字输入，门户的表单只认键盘事件
    async fn type_into(&self, page: &Page, selector: &str, text: &str) -> Result<(), PortalError> {
        let input = page.find_element(selector).await?;
        input.click().await?;
        let arg = serde_json::to_string(selector).map_err(|e| PortalError::Browser(e.to_string()))?;
        let _: bool = evaluate(page, call_js(&focus_and_clear_js(), &arg), self.step_timeout()).await?;
        input.type_str(text).await?;
        Ok(())
    }
}

#[async_trait]
impl PortalSession for RosreestrPortal {
    async fn open(&self) -> Result<(), PortalError> {
        let page = self.page().await?;
        navigate(&page, &self.config.url, Duration::from_secs(60))
            .await
            .map_err(|e| PortalError::Navigation(e.to_string()))?;
        self.await_form(&page).await?;
        info!("✓ 门户查询页已打开");
        Ok(())
    }

    async fn fill_identifier(&self, identifier: &str) -> Result<(), PortalError> {
        let page = self.page().await?;
        self.type_into(&page, QUERY_INPUT, identifier).await?;
        debug!("已输入地籍号 {}", identifier);
        Ok(())
    }

    async fn captcha_image(&self) -> Result<PathBuf, PortalError> {
        let page = self.page().await?;
        if !wait_for_selector(&page, CAPTCHA_IMAGE, Duration::from_secs(10)).await? {
            return Err(PortalError::Browser("验证码图片未出现".to_string()));
        }
        tokio::fs::create_dir_all(&self.captcha_dir)
            .await
            .map_err(|e| PortalError::Browser(e.to_string()))?;
        let path = self
            .captcha_dir
            .join(format!("captcha_{}.png", uuid::Uuid::new_v4().simple()));
        let image = page.find_element(CAPTCHA_IMAGE).await?;
        image
            .save_screenshot(CaptureScreenshotFormat::Png, &path)
            .await?;
        Ok(path)
    }

    async fn fill_captcha(&self, text: &str) -> Result<(), PortalError> {
        let page = self.page().await?;
        self.type_into(&page, CAPTCHA_INPUT, text).await
    }

    async fn submit(&self) -> Result<(), PortalError> {
        let page = self.page().await?;
        if click_when_ready(&page, SEARCH_BUTTON, Duration::from_secs(5)).await? {
            pause(1000).await;
            return Ok(());
        }
        // 验证码错误时搜索按钮会被隐藏
        if self.captcha_rejected().await? {
            return Err(PortalError::CaptchaRejected);
        }
        Err(PortalError::SearchButtonMissing)
    }

    async fn captcha_rejected(&self) -> Result<bool, PortalError> {
        let page = self.page().await?;
        Ok(evaluate(&page, call_js(PORTAL_CAPTCHA_ERROR_JS, ""), self.step_timeout()).await?)
    }

    async fn reload_captcha(&self) -> Result<(), PortalError> {
        let page = self.page().await?;
        if !click_when_ready(&page, CAPTCHA_RELOAD, Duration::from_secs(3)).await? {
            warn!("未找到验证码刷新按钮");
        }
        pause(1000).await;
        Ok(())
    }

    async fn open_first_result(&self) -> Result<(), PortalError> {
        let page = self.page().await?;
        if !wait_for_selector(&page, RESULTS_TABLE, self.step_timeout()).await? {
            return Err(PortalError::NoResults);
        }
        pause(2000).await;

        let link: Option<String> =
            evaluate(&page, call_js(PORTAL_FIRST_RESULT_JS, ""), self.step_timeout()).await?;
        let Some(link) = link else {
            return Err(PortalError::NoDetailLink);
        };
        debug!("打开搜索结果: {}", link);

        if !wait_for_selector(&page, OBJECT_CARD, self.step_timeout()).await? {
            return Err(PortalError::CardNotLoaded);
        }
        pause(2000).await;
        Ok(())
    }

    async fn extract_details(&self) -> Result<PortalDetails, PortalError> {
        let page = self.page().await?;
        let html = page.content().await?;
        let entries = parse_rights_html(&html);
        debug!("权利区块条目 {} 个", entries.len());
        Ok(parse_rights_data(&entries))
    }

    async fn back_to_search(&self) -> Result<(), PortalError> {
        let page = self.page().await?;
        let location: String = evaluate(&page, call_js(LOCATION_JS, ""), self.step_timeout()).await?;
        if location.contains(PORTAL_PAGE_MARKER) {
            page.reload()
                .await
                .map_err(|e| PortalError::Navigation(e.to_string()))?;
        } else {
            navigate(&page, &self.config.url, Duration::from_secs(60))
                .await
                .map_err(|e| PortalError::Navigation(e.to_string()))?;
        }
        self.await_form(&page).await
    }

    async fn restart(&self) -> Result<(), PortalError> {
        info!("重建门户子会话");
        self.drop_sub_session().await;
        self.open().await
    }

    async fn close(&self) {
        self.drop_sub_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // 访问 lk.rosreestr.ru，需要本机 Chrome
    async fn test_open_live_portal() {
        let dir = tempfile::tempdir().unwrap();
        let browser = Arc::new(SharedBrowser::new(Default::default()));
        let portal = RosreestrPortal::new(browser.clone(), PortalConfig::default(), dir.path().into());
        portal.open().await.unwrap();
        portal.fill_identifier("78:38:0022629:1115").await.unwrap();
        let image = portal.captcha_image().await.unwrap();
        assert!(image.exists(), "验证码截图应写入磁盘");
        portal.close().await;
        browser.close().await;
    }
}
