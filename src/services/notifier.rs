use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::config::NotifierConfig;

/// 用户通知。实现只需返回错误，调用方负责记日志，通知失败不影响任务状态
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<()>;
    async fn send_document(&self, user_id: i64, path: &Path) -> Result<()>;
}

/// 尽力发送，失败只记日志
pub async fn notify_text(notifier: &dyn Notifier, user_id: i64, text: &str) {
    if let Err(e) = notifier.send_text(user_id, text).await {
        warn!("❌ 发送通知给用户 {} 失败: {:#}", user_id, e);
    }
}

pub async fn notify_document(notifier: &dyn Notifier, user_id: i64, path: &Path) {
    if let Err(e) = notifier.send_document(user_id, path).await {
        warn!("❌ 发送文件 {} 给用户 {} 失败: {:#}", path.display(), user_id, e);
    }
}

pub struct TelegramNotifier {
    http: Client,
    base: String,
}

impl TelegramNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let token = config
            .telegram_token
            .as_deref()
            .context("TELEGRAM_BOT_TOKEN 未配置")?;
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("创建 Telegram HTTP 客户端失败")?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
        })
    }

    async fn check(response: reqwest::Response, method: &str) -> Result<()> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() || body["ok"] != Value::Bool(true) {
            anyhow::bail!(
                "Telegram {} 返回 HTTP {}: {}",
                method,
                status,
                body["description"].as_str().unwrap_or("未知错误")
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/sendMessage", self.base))
            .json(&json!({"chat_id": user_id, "text": text}))
            .send()
            .await?;
        Self::check(response, "sendMessage").await
    }

    async fn send_document(&self, user_id: i64, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取文件失败: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.xlsx".to_string());
        let form = Form::new()
            .text("chat_id", user_id.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name));
        let response = self
            .http
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await?;
        Self::check(response, "sendDocument").await?;
        info!("✓ 已发送文件给用户 {}: {}", user_id, path.display());
        Ok(())
    }
}

/// 没有配置机器人时只写日志
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<()> {
        info!("📨 [用户 {}] {}", user_id, text);
        Ok(())
    }

    async fn send_document(&self, user_id: i64, path: &Path) -> Result<()> {
        info!("📎 [用户 {}] 文件: {}", user_id, path.display());
        Ok(())
    }
}
