use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport as ClipRect};
use chromiumoxide::page::ScreenshotParams;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::config::MapConfig;
use crate::browser::actions::{click_when_ready, evaluate, fill_input, navigate, pause, wait_for_selector};
use crate::browser::scripts::{
    call_js, click_result_button_js, info_panel_html_js, press_enter_js, result_button_texts_js,
};
use crate::browser::{SharedBrowser, SubSession};
use crate::core::{EnrichedRecord, MapError, PositionHint};
use crate::scrape::map_extract::{
    crop_clip, lacks_geometry, map_file_path, parse_map_record, pick_result_button,
};
use crate::workflow::retry::{RetryPolicy, retry};

const MODAL_CLOSE: &str = "button.close, .close-button, [aria-label='Закрыть'], .modal-close";
const SEARCH_INPUT: &str =
    ".input-label input, label.input-label input, m-search-field input, form input[placeholder]";
const SEARCH_SUBMIT: &str =
    "form m-button[type='submit'], form button[type='submit'], m-button[variant='filled'][type='submit']";
const SEARCH_RESULTS: &str = ".accordion-container, .accordion-count, m-accordion";
const MAP_CANVAS: &str = "canvas, .leaflet-container, .map-container, #map, [class*='map']";
const ZOOM_OUT: &str = "zoom-control m-tooltip[content*=\"Уменьшить\"] m-button";
const ZOOM_OUT_FALLBACK: &str = "zoom-control m-button";
const INFO_PANEL: &str = "#tabpanel-info, div[role='tabpanel']";
const NAVIGATION_ATTEMPTS: u32 = 2;

/// 地图生成与地图页查询
#[async_trait]
pub trait MapRenderer: Send + Sync {
    /// 生成单个地块的地图截图，坐标只作参考，搜索始终按地籍号进行
    async fn generate_one(
        &self,
        identifier: &str,
        hint: Option<PositionHint>,
    ) -> Result<PathBuf, MapError>;

    /// 逐个生成，失败的记为 None
    async fn generate_batch(&self, identifiers: &[String]) -> HashMap<String, Option<PathBuf>> {
        let mut results = HashMap::new();
        for (idx, identifier) in identifiers.iter().enumerate() {
            let path = match self.generate_one(identifier, None).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("生成地图失败 {}: {}", identifier, e);
                    None
                }
            };
            results.insert(identifier.clone(), path);
            if idx + 1 < identifiers.len() {
                pause(1000).await;
            }
        }
        results
    }

    /// 从地图页的信息面板读取对象数据，接口查不到时兜底
    async fn lookup_record(&self, identifier: &str) -> Option<EnrichedRecord>;

    /// 只重建自己的子会话
    async fn restart_sub_session(&self) -> Result<(), MapError>;

    async fn close(&self);
}

/// 一次抓取走过的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapStage {
    Opened,
    Searched,
    ResultsVisible,
    DetailSelected,
    CardLoaded,
    Extracted,
}

impl fmt::Display for MapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapStage::Opened => "opened",
            MapStage::Searched => "searched",
            MapStage::ResultsVisible => "results-visible",
            MapStage::DetailSelected => "detail-selected",
            MapStage::CardLoaded => "card-loaded",
            MapStage::Extracted => "extracted",
        };
        f.write_str(name)
    }
}

/// nspd.gov.ru/map 抓取器，占用共享浏览器的一个子会话
pub struct NspdMapScraper {
    browser: Arc<SharedBrowser>,
    config: MapConfig,
    maps_dir: PathBuf,
    sub: Mutex<Option<SubSession>>,
}

impl NspdMapScraper {
    pub fn new(browser: Arc<SharedBrowser>, config: MapConfig, maps_dir: PathBuf) -> Self {
        Self {
            browser,
            config,
            maps_dir,
            sub: Mutex::new(None),
        }
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.config.step_timeout_secs)
    }

    /// 复用当前子会话；浏览器换代后旧页面已失效，重新打开
    async fn page(&self) -> Result<Page, MapError> {
        let mut slot = self.sub.lock().await;
        if let Some(sub) = slot.as_ref() {
            if self.browser.is_current(sub).await {
                return Ok(sub.page.clone());
            }
            debug!("地图子会话已过期，重新创建");
        }
        let sub = self
            .browser
            .open_sub_session(&self.browser.default_options())
            .await
            .map_err(|e| MapError::Browser(format!("{:#}", e)))?;
        let page = sub.page.clone();
        *slot = Some(sub);
        Ok(page)
    }

    async fn open(&self, page: &Page) -> Result<MapStage, MapError> {
        let policy = RetryPolicy::from_millis(NAVIGATION_ATTEMPTS, 2000);
        retry(&policy, "打开地图页", |_| navigate(page, &self.config.url, Duration::from_secs(60))).await?;
        pause(2000).await;
        if click_when_ready(page, MODAL_CLOSE, Duration::from_secs(3)).await? {
            debug!("已关闭浏览器提示弹窗");
            pause(1000).await;
        }
        Ok(MapStage::Opened)
    }

    async fn search(&self, page: &Page, identifier: &str) -> Result<MapStage, MapError> {
        if !wait_for_selector(page, SEARCH_INPUT, self.step_timeout()).await? {
            return Err(MapError::Browser("未找到搜索框".to_string()));
        }
        pause(1000).await;
        fill_input(page, SEARCH_INPUT, identifier, self.step_timeout()).await?;
        pause(1500).await;

        if !click_when_ready(page, SEARCH_SUBMIT, Duration::from_secs(3)).await? {
            debug!("未找到搜索按钮，改用回车");
            let js = call_js(&press_enter_js(), &serde_json::to_string(SEARCH_INPUT).unwrap_or_default());
            let _: bool = evaluate(page, js, self.step_timeout()).await?;
        }
        pause(2000).await;
        Ok(MapStage::Searched)
    }

    async fn await_results(&self, page: &Page) -> Result<MapStage, MapError> {
        if wait_for_selector(page, SEARCH_RESULTS, self.step_timeout()).await? {
            pause(2000).await;
        } else {
            // 结果区有时不渲染计数，继续尝试选择按钮
            warn!("搜索结果未在 {} 秒内出现", self.config.step_timeout_secs);
        }
        Ok(MapStage::ResultsVisible)
    }

    async fn select_detail(&self, page: &Page, identifier: &str) -> Result<MapStage, MapError> {
        wait_for_selector(page, "m-accordion", Duration::from_secs(15)).await?;
        let texts: Vec<String> =
            evaluate(page, call_js(&result_button_texts_js(), "null"), self.step_timeout()).await?;
        debug!("搜索结果按钮 {} 个", texts.len());

        let Some(index) = pick_result_button(&texts, identifier) else {
            return Err(MapError::PlotNotFound(identifier.to_string()));
        };
        let clicked: bool = evaluate(
            page,
            call_js(&click_result_button_js(), &index.to_string()),
            self.step_timeout(),
        )
        .await?;
        if !clicked {
            return Err(MapError::PlotNotFound(identifier.to_string()));
        }
        info!("✓ 已选中地块 {}", identifier);
        pause(3000).await;
        Ok(MapStage::DetailSelected)
    }

    async fn await_card(&self, page: &Page) -> Result<MapStage, MapError> {
        if wait_for_selector(page, MAP_CANVAS, self.step_timeout()).await? {
            pause(3000).await;
        } else {
            warn!("地图未在 {} 秒内加载完成，继续", self.config.step_timeout_secs);
        }
        Ok(MapStage::CardLoaded)
    }

    async fn zoom_out(&self, page: &Page) -> Result<(), MapError> {
        for selector in [ZOOM_OUT, ZOOM_OUT_FALLBACK] {
            if !wait_for_selector(page, selector, Duration::from_secs(3)).await? {
                continue;
            }
            for _ in 0..self.config.zoom_out_steps {
                click_when_ready(page, selector, Duration::from_secs(3)).await?;
                pause(500).await;
            }
            debug!("地图已缩小 {} 级", self.config.zoom_out_steps);
            return Ok(());
        }
        warn!("未找到缩放按钮，保持当前比例");
        Ok(())
    }

    async fn capture(&self, page: &Page, identifier: &str) -> Result<PathBuf, MapError> {
        tokio::fs::create_dir_all(&self.maps_dir).await?;
        let path = map_file_path(&self.maps_dir, identifier);

        let options = self.browser.default_options();
        let mut params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false);
        if let Some((x, y, width, height)) =
            crop_clip(options.viewport_width, options.viewport_height, &self.config.crop)
        {
            params = params.clip(ClipRect {
                x,
                y,
                width,
                height,
                scale: 1.0,
            });
        }
        page.save_screenshot(params.build(), &path).await?;
        Ok(path)
    }

    /// opened → searched → results-visible → detail-selected → card-loaded
    async fn select_object(&self, page: &Page, identifier: &str) -> Result<MapStage, MapError> {
        let mut stage = self.open(page).await?;
        debug!("[{}] 阶段: {}", identifier, stage);
        stage = self.search(page, identifier).await?;
        debug!("[{}] 阶段: {}", identifier, stage);
        stage = self.await_results(page).await?;
        debug!("[{}] 阶段: {}", identifier, stage);
        stage = self.select_detail(page, identifier).await?;
        debug!("[{}] 阶段: {}", identifier, stage);
        stage = self.await_card(page).await?;
        debug!("[{}] 阶段: {}", identifier, stage);
        Ok(stage)
    }

    async fn render(&self, page: &Page, identifier: &str) -> Result<PathBuf, MapError> {
        self.select_object(page, identifier).await?;
        if let Some(html) = self.panel_html(page, Duration::from_secs(5)).await? {
            if lacks_geometry(&html) {
                return Err(MapError::MissingCoordinates(identifier.to_string()));
            }
        }
        self.zoom_out(page).await?;
        let path = self.capture(page, identifier).await?;
        debug!("[{}] 阶段: {}", identifier, MapStage::Extracted);
        Ok(path)
    }

    async fn read_record(&self, page: &Page, identifier: &str) -> Result<Option<EnrichedRecord>, MapError> {
        self.select_object(page, identifier).await?;
        pause(2000).await;
        let html = self.panel_html(page, Duration::from_secs(10)).await?;
        Ok(html.and_then(|html| parse_map_record(identifier, &html)))
    }

    /// 选中对象后的信息面板 HTML，面板没出现返回 None
    async fn panel_html(&self, page: &Page, wait: Duration) -> Result<Option<String>, MapError> {
        if !wait_for_selector(page, INFO_PANEL, wait).await? {
            return Ok(None);
        }
        pause(2000).await;
        let html = evaluate(
            page,
            call_js(&info_panel_html_js(), &serde_json::to_string(INFO_PANEL).unwrap_or_default()),
            self.step_timeout(),
        )
        .await?;
        Ok(html)
    }

    async fn drop_sub_session(&self) {
        if let Some(sub) = self.sub.lock().await.take() {
            self.browser.close_sub_session(sub).await;
        }
    }
}

#[async_trait]
impl MapRenderer for NspdMapScraper {
    async fn generate_one(
        &self,
        identifier: &str,
        hint: Option<PositionHint>,
    ) -> Result<PathBuf, MapError> {
        info!("生成地图: {}", identifier);
        if let Some(hint) = hint {
            debug!("参考坐标: ({}, {})", hint.x, hint.y);
        }
        let page = self.page().await?;
        match self.render(&page, identifier).await {
            Ok(path) => {
                info!("✓ 地图已生成: {}", path.display());
                Ok(path)
            }
            Err(e) => {
                if matches!(e, MapError::Browser(_) | MapError::Timeout(_)) {
                    self.drop_sub_session().await;
                }
                Err(e)
            }
        }
    }

    async fn lookup_record(&self, identifier: &str) -> Option<EnrichedRecord> {
        info!("尝试从地图页读取 {} 的数据", identifier);
        let page = match self.page().await {
            Ok(page) => page,
            Err(e) => {
                warn!("地图子会话不可用: {}", e);
                return None;
            }
        };
        match self.read_record(&page, identifier).await {
            Ok(Some(record)) => {
                info!("✓ 已从地图页读取 {} 的数据", identifier);
                Some(record)
            }
            Ok(None) => {
                warn!("地图页没有 {} 的信息面板", identifier);
                None
            }
            Err(e) => {
                warn!("从地图页读取 {} 失败: {}", identifier, e);
                None
            }
        }
    }

    async fn restart_sub_session(&self) -> Result<(), MapError> {
        self.drop_sub_session().await;
        self.page().await.map(|_| ())
    }

    async fn close(&self) {
        self.drop_sub_session().await;
    }
}
