use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// api-cloud 要求的最小超时
pub const MIN_API_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_maps_dir")]
    pub maps_dir: PathBuf,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// 主数据源 api-cloud.ru
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    /// 模拟模式：不访问网络，返回固定的演示数据
    #[serde(default)]
    pub simulation: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MapRetryMode {
    /// 第一次失败即 FAILED
    #[default]
    Immediate,
    /// 失败后转 RETRYING，直到 retry_count 达到 max_retries
    Requeue,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_map_drain_limit")]
    pub map_drain_limit: i64,
    #[serde(default = "default_map_max_retries")]
    pub map_max_retries: i64,
    #[serde(default)]
    pub map_retry_mode: MapRetryMode,
    /// 任务结束后删除输入输出文件
    #[serde(default = "default_true")]
    pub cleanup_files: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserSettings {
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default = "default_true")]
    pub ignore_https_errors: bool,
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

/// lk.rosreestr.ru 门户
#[derive(Debug, Deserialize, Clone)]
pub struct PortalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_portal_url")]
    pub url: String,
    #[serde(default = "default_outer_attempts")]
    pub outer_attempts: u32,
    #[serde(default = "default_outer_backoff_ms")]
    pub outer_backoff_ms: u64,
    #[serde(default = "default_captcha_attempts")]
    pub captcha_attempts: u32,
    #[serde(default = "default_captcha_backoff_ms")]
    pub captcha_backoff_ms: u64,
    #[serde(default = "default_object_pause_ms")]
    pub object_pause_ms: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

/// 截图裁边（像素）
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CropBorder {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Default for CropBorder {
    fn default() -> Self {
        Self {
            left: 550,
            top: 120,
            right: 150,
            bottom: 180,
        }
    }
}

/// nspd.gov.ru 地图
#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    #[serde(default = "default_map_url")]
    pub url: String,
    #[serde(default = "default_map_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub crop: CropBorder,
    #[serde(default = "default_zoom_out_steps")]
    pub zoom_out_steps: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerKind {
    #[default]
    Llm,
    Tesseract,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptchaConfig {
    #[serde(default)]
    pub recognizer: RecognizerKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_tesseract_cmd")]
    pub tesseract_cmd: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new("config.toml"));
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            toml::from_str::<AppConfig>(&raw)
                .with_context(|| format!("解析配置文件失败: {}", path.display()))?
        } else {
            AppConfig::default()
        };
        cfg.apply_env_overrides();
        cfg.normalize();
        Ok(cfg)
    }

    /// 环境变量优先于配置文件
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value("API_CLOUD_TOKEN") {
            self.api.token = Some(v);
        }
        if let Some(v) = env_value("SIMULATION_MODE") {
            self.api.simulation = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_value("OPENROUTER_API_KEY") {
            self.captcha.api_key = Some(v);
        }
        if let Some(v) = env_value("TELEGRAM_BOT_TOKEN") {
            self.notifier.telegram_token = Some(v);
        }
        if let Some(v) = env_value("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env_value("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn normalize(&mut self) {
        if self.api.timeout_secs < MIN_API_TIMEOUT_SECS {
            warn!(
                "API 超时 {} 秒低于要求的最小值，已调整为 {} 秒",
                self.api.timeout_secs, MIN_API_TIMEOUT_SECS
            );
            self.api.timeout_secs = MIN_API_TIMEOUT_SECS;
        }
        if self.worker.progress_every == 0 {
            self.worker.progress_every = default_progress_every();
        }
        if self.api.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.api.token = None;
        }
    }

    pub fn directories(&self) -> [&Path; 3] {
        [&self.input_dir, &self.output_dir, &self.maps_dir]
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.worker.error_backoff_secs)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_url: default_database_url(),
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            maps_dir: default_maps_dir(),
            api: ApiConfig::default(),
            worker: WorkerConfig::default(),
            browser: BrowserSettings::default(),
            portal: PortalConfig::default(),
            map: MapConfig::default(),
            captcha: CaptchaConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            token: None,
            timeout_secs: default_api_timeout_secs(),
            simulation: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            progress_every: default_progress_every(),
            map_drain_limit: default_map_drain_limit(),
            map_max_retries: default_map_max_retries(),
            map_retry_mode: MapRetryMode::default(),
            cleanup_files: true,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            ignore_https_errors: true,
            executable: None,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_portal_url(),
            outer_attempts: default_outer_attempts(),
            outer_backoff_ms: default_outer_backoff_ms(),
            captcha_attempts: default_captcha_attempts(),
            captcha_backoff_ms: default_captcha_backoff_ms(),
            object_pause_ms: default_object_pause_ms(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            url: default_map_url(),
            step_timeout_secs: default_map_step_timeout_secs(),
            crop: CropBorder::default(),
            zoom_out_steps: default_zoom_out_steps(),
        }
    }
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            recognizer: RecognizerKind::default(),
            api_key: None,
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            tesseract_cmd: default_tesseract_cmd(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            api_base: default_telegram_api(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://data/cadastral.db?mode=rwc".to_string()
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("data/input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/output")
}

fn default_maps_dir() -> PathBuf {
    PathBuf::from("data/output/maps")
}

fn default_api_base_url() -> String {
    "https://api-cloud.ru".to_string()
}

fn default_api_timeout_secs() -> u64 {
    MIN_API_TIMEOUT_SECS
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_error_backoff_secs() -> u64 {
    5
}

fn default_progress_every() -> usize {
    10
}

fn default_map_drain_limit() -> i64 {
    50
}

fn default_map_max_retries() -> i64 {
    1
}

fn default_viewport_width() -> u32 {
    1920
}

fn default_viewport_height() -> u32 {
    1080
}

fn default_portal_url() -> String {
    "https://lk.rosreestr.ru/eservices/real-estate-objects-online".to_string()
}

fn default_outer_attempts() -> u32 {
    3
}

fn default_outer_backoff_ms() -> u64 {
    3000
}

fn default_captcha_attempts() -> u32 {
    5
}

fn default_captcha_backoff_ms() -> u64 {
    1000
}

fn default_object_pause_ms() -> u64 {
    1000
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_map_url() -> String {
    "https://nspd.gov.ru/map".to_string()
}

fn default_map_step_timeout_secs() -> u64 {
    45
}

fn default_zoom_out_steps() -> u32 {
    2
}

fn default_llm_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "allenai/molmo-2-8b:free".to_string()
}

fn default_tesseract_cmd() -> String {
    "tesseract".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
