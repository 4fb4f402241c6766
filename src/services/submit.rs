use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::core::{ExtractError, NewTask, StoreError, Task, TaskKind};
use crate::db::Database;
use crate::services::extract::{extract_from_spreadsheet, extract_from_text};
use crate::services::queue::TaskQueue;
use crate::utils::text::sanitize_filename;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("任务 {0} 未能加入队列")]
    NotQueued(i64),
}

/// 受理成功后的任务和排队位置
#[derive(Debug)]
pub struct Submission {
    pub task: Task,
    pub position: i64,
}

/// 用户提交入口：先提取地籍号，提取不到就不建任务
pub struct Submitter<'a> {
    db: &'a Database,
    queue: &'a TaskQueue,
    input_dir: &'a Path,
}

impl<'a> Submitter<'a> {
    pub fn new(db: &'a Database, queue: &'a TaskQueue, input_dir: &'a Path) -> Self {
        Self {
            db,
            queue,
            input_dir,
        }
    }

    pub async fn submit_text(&self, user_id: i64, text: &str) -> Result<Submission, SubmitError> {
        let identifiers = extract_from_text(text);
        if identifiers.is_empty() {
            return Err(ExtractError::NoIdentifiers.into());
        }
        self.create_and_enqueue(NewTask {
            user_id,
            kind: TaskKind::TextInput,
            input_data: Some(text.to_string()),
            identifiers,
            input_file_path: None,
        })
        .await
    }

    /// 文件先复制到输入目录，任务清理时删除的是副本
    pub async fn submit_file(&self, user_id: i64, path: &Path) -> Result<Submission, SubmitError> {
        let identifiers = extract_from_spreadsheet(path)?;
        let stored = self.store_input(user_id, path)?;
        self.create_and_enqueue(NewTask {
            user_id,
            kind: TaskKind::FileUpload,
            input_data: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            identifiers,
            input_file_path: Some(stored),
        })
        .await
    }

    fn store_input(&self, user_id: i64, path: &Path) -> Result<PathBuf, ExtractError> {
        std::fs::create_dir_all(self.input_dir)?;
        let file_name = path
            .file_name()
            .map(|n| sanitize_filename(&n.to_string_lossy()))
            .unwrap_or_else(|| "input.xlsx".to_string());
        let target = self.input_dir.join(format!(
            "{}_{}_{}",
            user_id,
            uuid::Uuid::new_v4().simple(),
            file_name
        ));
        std::fs::copy(path, &target)?;
        Ok(target)
    }

    async fn create_and_enqueue(&self, new_task: NewTask) -> Result<Submission, SubmitError> {
        let task = self.db.create_task(&new_task).await?;
        let position = self.queue.enqueue(task.id).await?;
        if position == 0 {
            return Err(SubmitError::NotQueued(task.id));
        }
        info!(
            "用户 {} 提交任务 {}（{} 个地籍号），队列位置 {}",
            task.user_id,
            task.id,
            new_task.identifiers.len(),
            position
        );
        Ok(Submission { task, position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskStatus;

    #[tokio::test]
    async fn test_text_submission_scenario() {
        let db = Database::in_memory().await.unwrap();
        let queue = TaskQueue::new(db.clone());
        let dir = tempfile::tempdir().unwrap();
        let submitter = Submitter::new(&db, &queue, dir.path());

        let submission = submitter
            .submit_text(7, "78:38:0022629:1115, 78:38:0022629:1006")
            .await
            .unwrap();
        assert_eq!(submission.position, 1, "空队列时位置为 1");
        assert_eq!(submission.task.status, TaskStatus::Pending);
        assert_eq!(
            submission.task.identifiers,
            Some(vec![
                "78:38:0022629:1115".to_string(),
                "78:38:0022629:1006".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_empty_input_creates_no_task() {
        let db = Database::in_memory().await.unwrap();
        let queue = TaskQueue::new(db.clone());
        let dir = tempfile::tempdir().unwrap();
        let submitter = Submitter::new(&db, &queue, dir.path());

        let result = submitter.submit_text(7, "ничего нет").await;
        assert!(matches!(
            result,
            Err(SubmitError::Extract(ExtractError::NoIdentifiers))
        ));
        assert!(db.list_user_tasks(7, 10).await.unwrap().is_empty(), "不能创建任务");
    }

    #[tokio::test]
    async fn test_file_submission_copies_input() {
        let db = Database::in_memory().await.unwrap();
        let queue = TaskQueue::new(db.clone());
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("numbers.csv");
        std::fs::write(&source, "47:14:1203001:814").unwrap();
        let input_dir = dir.path().join("input");
        let submitter = Submitter::new(&db, &queue, &input_dir);

        let submission = submitter.submit_file(3, &source).await.unwrap();
        let stored = submission.task.input_file_path.unwrap();
        assert!(stored.starts_with(&input_dir));
        assert!(stored.exists());
        assert!(source.exists(), "原文件保持不动");
    }
}
