use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::config::BrowserSettings;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const HIDE_WEBDRIVER_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined })";

/// 子会话参数，默认取全局浏览器配置，调用方可覆盖
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSessionOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub ignore_https_errors: bool,
}

impl SubSessionOptions {
    pub fn from_settings(settings: &BrowserSettings) -> Self {
        Self {
            viewport_width: settings.viewport_width,
            viewport_height: settings.viewport_height,
            ignore_https_errors: settings.ignore_https_errors,
        }
    }
}

/// 独立的浏览器上下文 + 页面。cookie 和存储不与其他子会话共享
#[derive(Debug)]
pub struct SubSession {
    pub page: Page,
    context_id: BrowserContextId,
    generation: u64,
}

struct LiveBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// 进程内唯一的浏览器。首次使用时启动，`close` 之后下次使用重新启动；
/// 每次启动代数加一，旧代数的子会话即视为失效
pub struct SharedBrowser {
    settings: BrowserSettings,
    live: Mutex<Option<LiveBrowser>>,
    generation: AtomicU64,
}

/// 任务结束后的浏览器回收
#[async_trait]
pub trait BrowserLifecycle: Send + Sync {
    async fn recycle(&self);
}

impl SharedBrowser {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn default_options(&self) -> SubSessionOptions {
        SubSessionOptions::from_settings(&self.settings)
    }

    /// 当前代数，0 表示从未启动
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 子会话是否属于当前这一代浏览器
    pub async fn is_current(&self, sub: &SubSession) -> bool {
        self.live.lock().await.is_some() && sub.generation == self.generation()
    }

    pub async fn is_running(&self) -> bool {
        self.live.lock().await.is_some()
    }

    /// 保证浏览器已启动，返回当前代数。重复调用不会再次启动
    pub async fn get_session(&self) -> Result<u64> {
        let mut guard = self.live.lock().await;
        self.ensure_launched(&mut guard).await?;
        Ok(self.generation())
    }

    async fn ensure_launched<'a>(
        &self,
        slot: &'a mut Option<LiveBrowser>,
    ) -> Result<&'a mut LiveBrowser> {
        if slot.is_none() {
            let live = launch(&self.settings).await?;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!("✓ 共享浏览器已启动（第 {} 代）", generation);
            *slot = Some(live);
        }
        slot.as_mut().context("浏览器未启动")
    }

    /// 在共享浏览器下新建一个隔离的上下文和页面
    pub async fn open_sub_session(&self, options: &SubSessionOptions) -> Result<SubSession> {
        let mut guard = self.live.lock().await;
        let live = self.ensure_launched(&mut guard).await?;

        let context_id = live
            .browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .context("创建浏览器上下文失败")?;

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .width(options.viewport_width as i64)
            .height(options.viewport_height as i64)
            .build()
            .map_err(anyhow::Error::msg)?;
        let page = live.browser.new_page(params).await.context("创建页面失败")?;
        page.evaluate_on_new_document(HIDE_WEBDRIVER_JS).await?;
        if options.ignore_https_errors {
            page.execute(SetIgnoreCertificateErrorsParams::new(true)).await?;
        }

        let generation = self.generation();
        debug!("已创建子会话（第 {} 代）", generation);
        Ok(SubSession {
            page,
            context_id,
            generation,
        })
    }

    /// 关闭单个子会话。浏览器已换代时页面早已随旧进程消失，直接丢弃
    pub async fn close_sub_session(&self, sub: SubSession) {
        let guard = self.live.lock().await;
        let Some(live) = guard.as_ref() else {
            return;
        };
        if sub.generation != self.generation() {
            return;
        }
        if let Err(e) = sub.page.close().await {
            debug!("关闭页面失败: {}", e);
        }
        if let Err(e) = live
            .browser
            .execute(DisposeBrowserContextParams::new(sub.context_id))
            .await
        {
            debug!("销毁浏览器上下文失败: {}", e);
        }
    }

    /// 关闭浏览器进程，所有子会话随之失效。可重复调用
    pub async fn close(&self) {
        let Some(mut live) = self.live.lock().await.take() else {
            debug!("浏览器未运行，无需关闭");
            return;
        };
        if let Err(e) = live.browser.close().await {
            warn!("关闭浏览器失败: {}", e);
        }
        if let Err(e) = live.browser.wait().await {
            debug!("等待浏览器进程退出失败: {}", e);
        }
        live.handler.abort();
        info!("共享浏览器已关闭");
    }
}

#[async_trait]
impl BrowserLifecycle for SharedBrowser {
    /// 关闭当前进程，下一次使用时懒启动新进程
    async fn recycle(&self) {
        self.close().await;
    }
}

async fn launch(settings: &BrowserSettings) -> Result<LiveBrowser> {
    let viewport = Viewport {
        width: settings.viewport_width,
        height: settings.viewport_height,
        ..Default::default()
    };

    let mut builder = BrowserConfig::builder()
        .viewport(viewport)
        .arg(format!("--user-agent={}", USER_AGENT))
        .arg("--disable-blink-features=AutomationControlled");
    if !settings.headless {
        builder = builder.with_head();
    }
    if settings.ignore_https_errors {
        builder = builder.arg("--ignore-certificate-errors");
    }
    if let Some(executable) = &settings.executable {
        builder = builder.chrome_executable(executable);
    }
    let config = builder.build().map_err(anyhow::Error::msg)?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("启动浏览器失败")?;

    let handler = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    Ok(LiveBrowser { browser, handler })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_settings() {
        let settings = BrowserSettings {
            viewport_width: 1280,
            ignore_https_errors: false,
            ..Default::default()
        };
        let browser = SharedBrowser::new(settings);
        let options = browser.default_options();
        assert_eq!(options.viewport_width, 1280);
        assert_eq!(options.viewport_height, 1080);
        assert!(!options.ignore_https_errors);
    }

    #[tokio::test]
    async fn test_close_without_launch_is_noop() {
        let browser = SharedBrowser::new(BrowserSettings::default());
        browser.close().await;
        browser.recycle().await;
        assert_eq!(browser.generation(), 0);
        assert!(!browser.is_running().await);
    }

    #[tokio::test]
    #[ignore] // 需要本机 Chrome
    async fn test_recycle_bumps_generation() {
        let browser = SharedBrowser::new(BrowserSettings::default());
        assert_eq!(browser.get_session().await.unwrap(), 1);
        assert_eq!(browser.get_session().await.unwrap(), 1, "重复获取不重启");

        let sub = browser
            .open_sub_session(&browser.default_options())
            .await
            .unwrap();
        assert!(browser.is_current(&sub).await);

        browser.recycle().await;
        assert!(!browser.is_current(&sub).await);
        assert_eq!(browser.get_session().await.unwrap(), 2);
        browser.close().await;
    }
}
