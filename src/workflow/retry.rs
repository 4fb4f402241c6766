use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// 有界重试策略：最多尝试次数 + 每次失败后的等待
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_millis(max_attempts: u32, backoff_ms: u64) -> Self {
        Self::new(max_attempts, Duration::from_millis(backoff_ms))
    }
}

/// 按策略重复执行 `op`（参数为从 1 开始的尝试序号）。
///
/// `should_retry` 判断错误是否值得再试，返回 false 的错误直接向外抛；
/// `before_retry` 在退避之后、下一次尝试之前执行，用来做恢复（刷新验证码、重建会话等）。
pub async fn retry_with_policy<T, E, Op, Fut, Pred, Hook, HookFut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: Op,
    should_retry: Pred,
    mut before_retry: Hook,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Pred: Fn(&E) -> bool,
    Hook: FnMut(&E) -> HookFut,
    HookFut: Future<Output = ()>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} 第 {} 次尝试成功", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= policy.max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                warn!(
                    "{} 第 {}/{} 次尝试失败: {}",
                    label, attempt, policy.max_attempts, e
                );
                if !policy.backoff.is_zero() {
                    sleep(policy.backoff).await;
                }
                before_retry(&e).await;
                attempt += 1;
            }
        }
    }
}

/// 所有错误都重试、不需要恢复动作的简化版本
pub async fn retry<T, E, Op, Fut>(policy: &RetryPolicy, label: &str, op: Op) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_policy(policy, label, op, |_| true, |_| async {}).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(&policy, "测试", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("失败 {}", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(&policy, "测试", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("失败 {}", attempt)) }
        })
        .await;
        assert_eq!(result, Err("失败 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "不能超过最大尝试次数");
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let hooks = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_policy(
            &policy,
            "测试",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
            |e| *e != "fatal",
            |_| {
                hooks.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hook_runs_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let hooks = AtomicU32::new(0);
        let _: Result<(), &str> = retry_with_policy(
            &policy,
            "测试",
            |_| async { Err("again") },
            |_| true,
            |_| {
                hooks.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;
        assert_eq!(hooks.load(Ordering::SeqCst), 2, "三次尝试之间恢复两次");
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
