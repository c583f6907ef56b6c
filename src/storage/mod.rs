//! 关系型存储：用户与会话（sqlx SQLite）
//!
//! 打开时建表（幂等）；连接池同时交给检查点存储与向量记忆复用。
//! 只负责记录，不做鉴权（密码哈希由调用方计算后传入）。

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::config::DatabaseSection;
use crate::core::AgentError;

/// 用户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

/// 聊天会话（id 即状态机的 thread_id）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// 数据库服务
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 按配置打开连接池（文件不存在时创建，父目录一并创建）并建表
    pub async fn connect(section: &DatabaseSection) -> Result<Self, AgentError> {
        if let Some(parent) = sqlite_file_path(&section.url).and_then(|p| p.parent().map(PathBuf::from)) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(&parent)
                    .map_err(|e| AgentError::Storage(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&section.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(section.pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(url = %section.url, error = %e, "database_initialization_failed");
                AgentError::from(e)
            })?;

        let db = Self::from_pool(pool);
        db.init_tables().await?;
        tracing::info!(pool_size = section.pool_size, "database_initialized");
        Ok(db)
    }

    /// 从已有连接池创建（调用方负责建表时机时使用 init_tables）
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_tables(&self) -> Result<(), AgentError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                hashed_password TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 创建用户；邮箱重复返回 Storage 错误
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, AgentError> {
        let created_at = Utc::now();
        let result = sqlx::query("INSERT INTO users (email, hashed_password, created_at) VALUES (?, ?, ?)")
            .bind(email)
            .bind(password_hash)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            email: email.to_string(),
            hashed_password: password_hash.to_string(),
            created_at,
        })
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AgentError> {
        let row = sqlx::query("SELECT id, email, hashed_password, created_at FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<User, AgentError> {
            Ok(User {
                id: row.get("id"),
                email: row.get("email"),
                hashed_password: row.get("hashed_password"),
                created_at: parse_time(&row)?,
            })
        })
        .transpose()
    }

    /// 创建会话并关联到用户
    pub async fn create_session(
        &self,
        session_id: &str,
        user_id: i64,
        name: &str,
    ) -> Result<Session, AgentError> {
        let created_at = Utc::now();
        sqlx::query("INSERT INTO sessions (id, user_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(session_id)
            .bind(user_id)
            .bind(name)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(Session {
            id: session_id.to_string(),
            user_id,
            name: name.to_string(),
            created_at,
        })
    }

    /// 用户的全部会话，按创建顺序
    pub async fn get_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, AgentError> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, created_at FROM sessions
             WHERE user_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Session, AgentError> {
                Ok(Session {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    name: row.get("name"),
                    created_at: parse_time(row)?,
                })
            })
            .collect()
    }
}

fn parse_time(row: &SqliteRow) -> Result<DateTime<Utc>, AgentError> {
    let raw: String = row.get("created_at");
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentError::Storage(e.to_string()))
}

/// `sqlite://data/x.db?mode=rwc` → `data/x.db`；内存库返回 None
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(dir: &tempfile::TempDir) -> Database {
        let section = DatabaseSection {
            url: format!("sqlite://{}", dir.path().join("nested/app.db").display()),
            pool_size: 2,
        };
        Database::connect(&section).await.unwrap()
    }

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(sqlite_file_path("sqlite://data/a.db"), Some(PathBuf::from("data/a.db")));
        assert_eq!(sqlite_file_path("sqlite:x.db?mode=rwc"), Some(PathBuf::from("x.db")));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://h/db"), None);
    }

    #[tokio::test]
    async fn test_users_and_sessions() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open(&dir).await;

        let user = db.create_user("a@example.com", "hash").await.unwrap();
        assert!(db.create_user("a@example.com", "other").await.is_err());

        let found = db.get_user_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.hashed_password, "hash");
        assert!(db.get_user_by_email("nobody@example.com").await.unwrap().is_none());

        db.create_session("s1", user.id, "first").await.unwrap();
        db.create_session("s2", user.id, "").await.unwrap();
        let sessions = db.get_user_sessions(user.id).await.unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(sessions[0].name, "first");
        assert!(db.get_user_sessions(user.id + 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = open(&dir).await;
            db.create_user("b@example.com", "h").await.unwrap();
            db.pool().close().await;
        }
        let db = open(&dir).await;
        assert!(db.get_user_by_email("b@example.com").await.unwrap().is_some());
    }
}
