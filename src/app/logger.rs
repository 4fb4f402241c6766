use tracing_subscriber::EnvFilter;

/// 初始化日志；RUST_LOG 优先于配置里的级别，重复调用不会报错
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn,chromiumoxide=warn,hyper=warn", level))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
