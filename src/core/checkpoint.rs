//! 检查点存储
//!
//! 每个节点执行完后写入一条检查点（thread_id, step, next, state），读取时取该线程最新一条。
//! setup() 幂等建表；写入失败必须上抛（AgentError::Checkpoint），否则无法保证可恢复性。
//!
//! - InMemoryCheckpointer：进程内，测试与无数据库时使用
//! - SqliteCheckpointer：sqlx SQLite，checkpoints 表（需启用 `async-sqlite` feature）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{AgentError, ConversationState, NextNode};

/// 一条检查点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    /// 线程内单调递增的步号
    pub step: u64,
    pub next: NextNode,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: &str, step: u64, next: NextNode, state: ConversationState) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            step,
            next,
            state,
            created_at: Utc::now(),
        }
    }
}

/// 检查点存储 trait
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// 幂等初始化（建表等）
    async fn setup(&self) -> Result<(), AgentError>;

    /// 线程最新检查点
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError>;

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), AgentError>;

    /// 线程全部检查点（按步号升序）
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError>;
}

/// 进程内检查点存储
#[derive(Clone, Default)]
pub struct InMemoryCheckpointer {
    threads: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn setup(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        self.threads
            .write()
            .await
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePool;
    use sqlx::Row;

    use super::{Checkpoint, Checkpointer};
    use crate::core::AgentError;

    fn checkpoint_err(e: impl std::fmt::Display) -> AgentError {
        AgentError::Checkpoint(e.to_string())
    }

    /// SQLite 检查点存储（与 Database 共用连接池）
    #[derive(Clone)]
    pub struct SqliteCheckpointer {
        pool: SqlitePool,
    }

    impl SqliteCheckpointer {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, AgentError> {
            let next: String = row.get("next");
            let state: String = row.get("state");
            let created_at: String = row.get("created_at");
            let step: i64 = row.get("step");
            Ok(Checkpoint {
                thread_id: row.get("thread_id"),
                step: step as u64,
                next: serde_json::from_value(serde_json::Value::String(next)).map_err(checkpoint_err)?,
                state: serde_json::from_str(&state).map_err(checkpoint_err)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .map_err(checkpoint_err)?,
            })
        }
    }

    #[async_trait]
    impl Checkpointer for SqliteCheckpointer {
        async fn setup(&self) -> Result<(), AgentError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    step INTEGER NOT NULL,
                    next TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await
            .map_err(checkpoint_err)?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id, id)")
                .execute(&self.pool)
                .await
                .map_err(checkpoint_err)?;
            Ok(())
        }

        async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
            let row = sqlx::query(
                "SELECT thread_id, step, next, state, created_at FROM checkpoints
                 WHERE thread_id = ? ORDER BY id DESC LIMIT 1",
            )
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(checkpoint_err)?;

            row.as_ref().map(Self::from_row).transpose()
        }

        async fn put(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
            let state = serde_json::to_string(&checkpoint.state).map_err(checkpoint_err)?;
            sqlx::query(
                "INSERT INTO checkpoints (thread_id, step, next, state, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&checkpoint.thread_id)
            .bind(checkpoint.step as i64)
            .bind(checkpoint.next.as_str())
            .bind(state)
            .bind(checkpoint.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(checkpoint_err)?;
            Ok(())
        }

        async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
            let rows = sqlx::query(
                "SELECT thread_id, step, next, state, created_at FROM checkpoints
                 WHERE thread_id = ? ORDER BY id ASC",
            )
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(checkpoint_err)?;

            rows.iter().map(Self::from_row).collect()
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteCheckpointer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    fn state(text: &str) -> ConversationState {
        ConversationState {
            messages: vec![Message::user(text)],
            long_term_memory: String::new(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_latest_wins() {
        let store = InMemoryCheckpointer::new();
        store.setup().await.unwrap();
        assert!(store.get("t").await.unwrap().is_none());

        store.put(&Checkpoint::new("t", 1, NextNode::Chat, state("a"))).await.unwrap();
        store.put(&Checkpoint::new("t", 2, NextNode::End, state("b"))).await.unwrap();
        store.put(&Checkpoint::new("other", 1, NextNode::Chat, state("c"))).await.unwrap();

        let latest = store.get("t").await.unwrap().unwrap();
        assert_eq!(latest.step, 2);
        assert_eq!(latest.next, NextNode::End);
        assert_eq!(store.history("t").await.unwrap().len(), 2);
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_sqlite_checkpointer_round_trip() {
        use sqlx::sqlite::SqlitePoolOptions;

        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("cp.db").display());
        let pool = SqlitePoolOptions::new().max_connections(2).connect(&url).await.unwrap();

        let store = SqliteCheckpointer::new(pool);
        store.setup().await.unwrap();
        // setup 幂等
        store.setup().await.unwrap();

        store.put(&Checkpoint::new("t", 1, NextNode::ToolCall, state("a"))).await.unwrap();
        store.put(&Checkpoint::new("t", 2, NextNode::End, state("b"))).await.unwrap();

        let latest = store.get("t").await.unwrap().unwrap();
        assert_eq!(latest.step, 2);
        assert_eq!(latest.next, NextNode::End);
        assert_eq!(latest.state.messages[0].content, "b");

        let history = store.history("t").await.unwrap();
        assert_eq!(history.iter().map(|c| c.next).collect::<Vec<_>>(), vec![NextNode::ToolCall, NextNode::End]);
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
