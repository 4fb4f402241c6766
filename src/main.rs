use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use cadastral_worker::app::{AppConfig, logger};
use cadastral_worker::browser::SharedBrowser;
use cadastral_worker::db::Database;
use cadastral_worker::scrape::{NspdMapScraper, PortalSession, RosreestrPortal};
use cadastral_worker::services::captcha::build_recognizer;
use cadastral_worker::services::notifier::{LogNotifier, TelegramNotifier};
use cadastral_worker::services::report::XlsxReportAssembler;
use cadastral_worker::services::submit::Submitter;
use cadastral_worker::services::{ApiCloudClient, MapTaskLedger, Notifier, TaskQueue};
use cadastral_worker::workflow::{Collaborators, TaskWorker};

const HISTORY_LIMIT: i64 = 10;

/// 地籍号批量查询：排队、后台处理、生成报表
#[derive(Parser, Debug)]
#[command(name = "cadastral_worker")]
#[command(version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml", env = "CADASTRAL_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动后台 worker，Ctrl+C 退出
    Run,
    /// 提交一批地籍号（文本或表格）
    Submit(SubmitArgs),
    /// 查看任务状态和排队位置
    Status { task_id: i64 },
    /// 用户最近的任务
    History {
        #[arg(long)]
        user: i64,
    },
    /// 用户最近的地图子任务
    Maps {
        #[arg(long)]
        user: i64,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(long)]
    user: i64,
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    text: Option<String>,
    /// .xlsx / .xls / .txt / .csv
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;
    logger::init(&config.log_level);

    for dir in config.directories() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("创建目录失败: {}", dir.display()))?;
    }
    let db = Database::connect(&config.database_url)
        .await
        .context("打开数据库失败")?;

    match cli.command {
        Command::Run => run_worker(db, &config).await,
        Command::Submit(args) => submit(db, &config, args).await,
        Command::Status { task_id } => status(db, task_id).await,
        Command::History { user } => history(db, user).await,
        Command::Maps { user } => maps(db, &config, user).await,
    }
}

async fn run_worker(db: Database, config: &AppConfig) -> Result<()> {
    info!("🚀 启动任务 worker");
    let browser = Arc::new(SharedBrowser::new(config.browser.clone()));
    let portal: Option<Arc<dyn PortalSession>> = config.portal.enabled.then(|| {
        Arc::new(RosreestrPortal::new(
            browser.clone(),
            config.portal.clone(),
            config.output_dir.join("captcha"),
        )) as Arc<dyn PortalSession>
    });

    let services = Collaborators {
        source: Arc::new(ApiCloudClient::new(config.api.clone())?),
        renderer: Arc::new(NspdMapScraper::new(
            browser.clone(),
            config.map.clone(),
            config.maps_dir.clone(),
        )),
        portal,
        recognizer: build_recognizer(&config.captcha)?,
        assembler: Arc::new(XlsxReportAssembler::new(config.output_dir.clone())),
        notifier: build_notifier(config),
        browser: browser.clone(),
    };

    let queue = Arc::new(TaskQueue::new(db.clone()));
    let worker = TaskWorker::new(db, queue, services, config);
    worker
        .recover_interrupted()
        .await
        .context("恢复中断任务失败")?;

    tokio::select! {
        _ = worker.run() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("监听 Ctrl+C 失败: {}", e);
            }
            info!("收到退出信号，停止 worker");
        }
    }

    browser.close().await;
    info!("worker 已退出");
    Ok(())
}

fn build_notifier(config: &AppConfig) -> Arc<dyn Notifier> {
    if config.notifier.telegram_token.is_none() {
        info!("未配置 Telegram，通知只写日志");
        return Arc::new(LogNotifier);
    }
    match TelegramNotifier::new(&config.notifier) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("❌ Telegram 通知不可用，改为写日志: {:#}", e);
            Arc::new(LogNotifier)
        }
    }
}

async fn submit(db: Database, config: &AppConfig, args: SubmitArgs) -> Result<()> {
    let queue = TaskQueue::new(db.clone());
    let submitter = Submitter::new(&db, &queue, &config.input_dir);
    let submission = match (&args.text, &args.file) {
        (Some(text), _) => submitter.submit_text(args.user, text).await?,
        (None, Some(file)) => submitter.submit_file(args.user, file).await?,
        (None, None) => anyhow::bail!("需要 --text 或 --file"),
    };

    let count = submission.task.identifiers.as_ref().map_or(0, Vec::len);
    println!(
        "Задача #{} принята: {} кадастровых номеров. Позиция в очереди: {}",
        submission.task.id, count, submission.position
    );
    Ok(())
}

async fn status(db: Database, task_id: i64) -> Result<()> {
    let queue = TaskQueue::new(db.clone());
    let Some(task) = db.get_task(task_id).await? else {
        anyhow::bail!("任务 {} 不存在", task_id);
    };
    println!("Задача #{}: {}", task.id, task.status);
    println!(
        "Обработано: {} (успешно {}, ошибок {})",
        task.processed_count, task.successful_count, task.failed_count
    );
    let position = queue.position_of(task.id).await?;
    if position > 0 {
        println!("Позиция в очереди: {} из {}", position, queue.size().await?);
    }
    if let Some(error) = &task.error_message {
        println!("Ошибка: {}", error);
    }
    if let Some(path) = &task.output_file_path {
        println!("Файл: {}", path.display());
    }
    Ok(())
}

async fn history(db: Database, user_id: i64) -> Result<()> {
    let tasks = db.list_user_tasks(user_id, HISTORY_LIMIT).await?;
    if tasks.is_empty() {
        println!("Задач нет");
        return Ok(());
    }
    for task in tasks {
        println!(
            "#{} {} {}: {}/{}",
            task.id,
            task.created_at.format("%d.%m.%Y %H:%M"),
            task.status,
            task.successful_count,
            task.processed_count
        );
    }
    Ok(())
}

async fn maps(db: Database, config: &AppConfig, user_id: i64) -> Result<()> {
    let ledger = MapTaskLedger::new(db, config.worker.map_retry_mode);
    let subs = ledger.list_for_user(user_id, HISTORY_LIMIT).await?;
    if subs.is_empty() {
        println!("Карт нет");
        return Ok(());
    }
    for sub in subs {
        let detail = match (&sub.map_file_path, &sub.error_message) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!("#{} {} {} {}", sub.id, sub.identifier, sub.status, detail);
    }
    Ok(())
}
