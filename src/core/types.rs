use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// 任务状态，只能向前流转：PENDING → PROCESSING → {COMPLETED | FAILED | CANCELLED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 是否允许从当前状态迁移到 `next`（同状态视为重新确认）
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => !a.is_terminal(),
            (TaskStatus::Pending, _) => true,
            (TaskStatus::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("未知的任务状态: {}", other)),
        }
    }
}

/// 任务输入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextInput,
    FileUpload,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextInput => "text_input",
            TaskKind::FileUpload => "file_upload",
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_input" => Ok(TaskKind::TextInput),
            "file_upload" => Ok(TaskKind::FileUpload),
            other => Err(format!("未知的任务类型: {}", other)),
        }
    }
}

/// 地图子任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl MapTaskStatus {
    pub const ACTIVE: [MapTaskStatus; 3] = [
        MapTaskStatus::Pending,
        MapTaskStatus::Processing,
        MapTaskStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MapTaskStatus::Pending => "pending",
            MapTaskStatus::Processing => "processing",
            MapTaskStatus::Completed => "completed",
            MapTaskStatus::Failed => "failed",
            MapTaskStatus::Retrying => "retrying",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for MapTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MapTaskStatus::Pending),
            "processing" => Ok(MapTaskStatus::Processing),
            "completed" => Ok(MapTaskStatus::Completed),
            "failed" => Ok(MapTaskStatus::Failed),
            "retrying" => Ok(MapTaskStatus::Retrying),
            other => Err(format!("未知的地图任务状态: {}", other)),
        }
    }
}

/// 坐标提示，仅供参考，地图抓取始终按地籍号搜索
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionHint {
    pub x: f64,
    pub y: f64,
}

/// 用户提交的一次处理任务
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub input_data: Option<String>,
    pub identifiers: Option<Vec<String>>,
    pub processed_count: i64,
    pub successful_count: i64,
    pub failed_count: i64,
    pub input_file_path: Option<PathBuf>,
    pub output_file_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub api_balance: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 创建任务所需的字段
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: i64,
    pub kind: TaskKind,
    pub input_data: Option<String>,
    pub identifiers: Vec<String>,
    pub input_file_path: Option<PathBuf>,
}

/// 任务结束时写回的统计与产物
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub processed_count: i64,
    pub successful_count: i64,
    pub failed_count: i64,
    pub output_file_path: Option<PathBuf>,
    pub api_balance: Option<f64>,
}

/// 地图生成子任务
#[derive(Debug, Clone, PartialEq)]
pub struct MapSubTask {
    pub id: i64,
    pub parent_task_id: Option<i64>,
    pub user_id: Option<i64>,
    pub identifier: String,
    pub hint: Option<PositionHint>,
    pub status: MapTaskStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub map_file_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// 单个地籍号的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    Success,
    Failed,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub success: usize,
    pub failed: usize,
}

impl ProcessStats {
    pub fn add_result(&mut self, result: &ProcessResult) {
        match result {
            ProcessResult::Success => self.success += 1,
            ProcessResult::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_forward_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Pending), "PENDING 可以重新确认");
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending), "不允许回退");
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed), "终态不可再变");
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for s in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<TaskStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<TaskStatus>().is_err());
        assert!(MapTaskStatus::Retrying.is_active());
        assert!(!MapTaskStatus::Completed.is_active());
    }

    #[test]
    fn test_process_stats() {
        let mut stats = ProcessStats::default();
        stats.add_result(&ProcessResult::Success);
        stats.add_result(&ProcessResult::Failed);
        stats.add_result(&ProcessResult::Success);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }
}
