use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::error::CdpError;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::browser::scripts::{call_js, click_first_js, exists_js, focus_and_clear_js};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 带超时的 evaluate，超时按 `CdpError::Timeout` 返回
pub async fn evaluate<T: DeserializeOwned>(
    page: &Page,
    js: String,
    limit: Duration,
) -> Result<T, CdpError> {
    let result = timeout(limit, page.evaluate(js))
        .await
        .map_err(|_| CdpError::Timeout)??;
    Ok(result.into_value()?)
}

fn selector_arg(selector: &str) -> Result<String, CdpError> {
    Ok(serde_json::to_string(selector)?)
}

/// 轮询直到出现可见的匹配元素，超时返回 false
pub async fn wait_for_selector(
    page: &Page,
    selector: &str,
    limit: Duration,
) -> Result<bool, CdpError> {
    let js = call_js(&exists_js(), &selector_arg(selector)?);
    let deadline = Instant::now() + limit;
    loop {
        let found: bool = evaluate(page, js.clone(), limit).await.unwrap_or(false);
        if found {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            debug!("等待元素超时: {}", selector);
            return Ok(false);
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// 等待元素出现后点击第一个，没出现返回 false
pub async fn click_when_ready(
    page: &Page,
    selector: &str,
    limit: Duration,
) -> Result<bool, CdpError> {
    if !wait_for_selector(page, selector, limit).await? {
        return Ok(false);
    }
    let js = call_js(&click_first_js(), &selector_arg(selector)?);
    evaluate(page, js, limit).await
}

/// 聚焦并清空输入框，再用 CDP 插入文本（会触发页面的 input 事件）
pub async fn fill_input(
    page: &Page,
    selector: &str,
    text: &str,
    limit: Duration,
) -> Result<bool, CdpError> {
    let js = call_js(&focus_and_clear_js(), &selector_arg(selector)?);
    let focused: bool = evaluate(page, js, limit).await?;
    if !focused {
        return Ok(false);
    }
    page.execute(InsertTextParams::new(text)).await?;
    Ok(true)
}

/// 打开地址并等待页面加载
pub async fn navigate(page: &Page, url: &str, limit: Duration) -> Result<(), CdpError> {
    timeout(limit, page.goto(url))
        .await
        .map_err(|_| CdpError::Timeout)??;
    Ok(())
}

pub async fn pause(millis: u64) {
    sleep(Duration::from_millis(millis)).await;
}
