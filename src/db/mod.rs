//! SQLite 持久化：任务表和地图子任务表
//!
//! 时间统一存成 UTC 微秒整数，保证按时间排序与比较是严格的。

pub mod map_tasks;
pub mod tasks;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, info};

use crate::core::{StoreError, StoreResult};

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 打开（必要时创建）数据库并建表
    pub async fn connect(url: &str) -> StoreResult<Self> {
        if let Some(path) = url
            .strip_prefix("sqlite://")
            .map(|rest| rest.split('?').next().unwrap_or(rest))
        {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Corrupt(format!("无法创建数据库目录: {}", e)))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        info!("✓ 数据库已连接: {}", url);

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// 内存数据库，只有一个连接，测试用
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                input_data TEXT,
                cadastral_numbers TEXT,
                processed_count INTEGER NOT NULL DEFAULT 0,
                successful_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                input_file_path TEXT,
                output_file_path TEXT,
                error_message TEXT,
                api_balance REAL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at, id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS map_generation_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_task_id INTEGER REFERENCES tasks(id),
                user_id INTEGER,
                cadastral_number TEXT NOT NULL,
                coordinate_x REAL,
                coordinate_y REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                map_file_path TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                last_retry_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_map_tasks_number ON map_generation_tasks(cadastral_number, status)",
        )
        .execute(&self.pool)
        .await?;

        // 同一地籍号同时最多一个活动子任务
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_map_tasks_one_active
            ON map_generation_tasks(cadastral_number)
            WHERE status IN ('pending', 'processing', 'retrying')
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("数据库表结构已就绪");
        Ok(())
    }
}

pub(crate) fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("无效的时间戳: {}", value)))
}

pub(crate) fn from_micros_opt(value: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(from_micros).transpose()
}

/// 把唯一约束冲突识别出来，由调用方当作“重复”处理
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
