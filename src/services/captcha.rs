use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::app::config::{CaptchaConfig, RecognizerKind};

const CAPTCHA_PROMPT: &str = "Распознай текст на этом изображении капчи. В капче могут быть только буквы \
(латиница, a-z, A-Z) и цифры (0-9). Спецсимволов, пробелов и других символов нет. Верни ТОЛЬКО \
распознанный текст без дополнительных объяснений, кавычек, точек и других символов. Если не можешь \
распознать, верни пустую строку.";

const WHITELIST: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 验证码识别：输入图片路径，识别失败返回 None
#[async_trait]
pub trait CaptchaRecognizer: Send + Sync {
    async fn recognize(&self, image: &Path) -> Option<String>;
}

/// 只保留字母数字并转小写，门户的验证码总是小写
pub fn clean_captcha_text(raw: &str) -> Option<String> {
    let text: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    (!text.is_empty()).then_some(text)
}

pub fn build_recognizer(config: &CaptchaConfig) -> anyhow::Result<Arc<dyn CaptchaRecognizer>> {
    Ok(match config.recognizer {
        RecognizerKind::Llm => Arc::new(LlmCaptchaRecognizer::new(config.clone())?),
        RecognizerKind::Tesseract => Arc::new(TesseractRecognizer::new(&config.tesseract_cmd)),
    })
}

/// 通过 OpenRouter 的视觉模型识别
pub struct LlmCaptchaRecognizer {
    http: Client,
    config: CaptchaConfig,
}

impl LlmCaptchaRecognizer {
    pub fn new(config: CaptchaConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { http, config })
    }

    fn build_request(&self, image_bytes: &[u8], mime: &str) -> Value {
        let data_url = format!("data:{};base64,{}", mime, STANDARD.encode(image_bytes));
        json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": CAPTCHA_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }],
            "max_tokens": 50,
            "temperature": 0.1
        })
    }

    async fn ask(&self, image: &Path) -> anyhow::Result<Option<String>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OpenRouter API 密钥未配置"))?;
        let bytes = tokio::fs::read(image).await?;
        let mime = match image.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
            _ => "image/jpeg",
        };

        debug!("正在调用视觉模型识别验证码，模型: {}", self.config.model);
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&self.build_request(&bytes, mime))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("LLM API 调用失败: HTTP {} {}", status, body));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        Ok(clean_captcha_text(content))
    }
}

#[async_trait]
impl CaptchaRecognizer for LlmCaptchaRecognizer {
    async fn recognize(&self, image: &Path) -> Option<String> {
        match self.ask(image).await {
            Ok(Some(text)) => {
                info!("✓ 验证码识别结果: {}", text);
                Some(text)
            }
            Ok(None) => {
                warn!("视觉模型未返回可用的验证码文本");
                None
            }
            Err(e) => {
                warn!("❌ 验证码识别失败: {}", e);
                None
            }
        }
    }
}

/// 本地 tesseract 命令行，依次尝试几种分页模式
pub struct TesseractRecognizer {
    command: String,
}

impl TesseractRecognizer {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    async fn run(&self, image: &Path, psm: u8, whitelist: bool) -> anyhow::Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(image)
            .arg("stdout")
            .args(["--oem", "3", "--psm", &psm.to_string()]);
        if whitelist {
            cmd.args(["-c", &format!("tessedit_char_whitelist={}", WHITELIST)]);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "tesseract 退出码 {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CaptchaRecognizer for TesseractRecognizer {
    async fn recognize(&self, image: &Path) -> Option<String> {
        let attempts = [(7, true), (8, true), (13, true), (7, false)];
        for (psm, whitelist) in attempts {
            match self.run(image, psm, whitelist).await {
                Ok(raw) => {
                    if let Some(text) = clean_captcha_text(&raw) {
                        info!("✓ tesseract 识别结果 (psm {}): {}", psm, text);
                        return Some(text);
                    }
                }
                Err(e) => debug!("tesseract psm {} 失败: {}", psm, e),
            }
        }
        warn!("tesseract 未能识别验证码: {}", image.display());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_captcha_text() {
        assert_eq!(clean_captcha_text(" \"Ab3-9z.\"\n"), Some("ab39z".to_string()));
        assert_eq!(clean_captcha_text("..."), None);
    }

    #[test]
    fn test_request_shape() {
        let recognizer = LlmCaptchaRecognizer::new(CaptchaConfig::default()).unwrap();
        let request = recognizer.build_request(b"png", "image/png");
        assert_eq!(request["model"], "allenai/molmo-2-8b:free");
        assert_eq!(request["max_tokens"], 50);
        let url = request["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("captcha.png");
        std::fs::write(&image, b"png").unwrap();
        let recognizer = LlmCaptchaRecognizer::new(CaptchaConfig::default()).unwrap();
        assert_eq!(recognizer.recognize(&image).await, None);
    }
}
