//! 长期记忆：按用户存储事实，跨会话检索
//!
//! search(user_id, query) 返回按相关度排序的事实；add(user_id, messages) 在一轮对话结束后
//! 由后台任务调用，从用户发言中抽取新事实。检索失败不影响对话：调用方通过
//! `relevant_context` 拿到的要么是事实列表，要么是占位串 `NO_RELEVANT_MEMORY`。
//!
//! 实现：
//! - InMemoryLongTerm：关键词重叠（无向量），适合本地与测试
//! - VectorLongTerm：嵌入 + 余弦相似度，可选持久化到 SQLite 的 memory_facts 表
//! - NoopLongTerm：关闭长期记忆

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::MemorySection;
use crate::llm::EmbeddingProvider;
use crate::memory::{Message, Role};

/// 没有检索到任何事实时注入提示词的占位文本
pub const NO_RELEVANT_MEMORY: &str = "No relevant memory found.";

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Memory storage failed: {0}")]
    Storage(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for MemoryError {
    fn from(e: sqlx::Error) -> Self {
        MemoryError::Storage(e.to_string())
    }
}

/// 一条长期记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: String,
    pub user_id: String,
    pub text: String,
    /// 检索得分（写入时为 0）
    #[serde(default)]
    pub score: f32,
    pub created_at: DateTime<Utc>,
}

impl MemoryFact {
    pub fn new(user_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            text: text.into(),
            score: 0.0,
            created_at: Utc::now(),
        }
    }
}

/// 长期记忆 trait
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// 按相关度降序返回该用户的事实
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<MemoryFact>, MemoryError>;

    /// 从一轮对话的消息中抽取并写入新事实，返回新增条数
    async fn add(&self, user_id: &str, messages: &[Message]) -> Result<usize, MemoryError>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 事实列表拼成注入提示词的文本：每条一行 "* fact"
pub fn format_facts(facts: &[MemoryFact]) -> String {
    if facts.is_empty() {
        return NO_RELEVANT_MEMORY.to_string();
    }
    facts
        .iter()
        .map(|f| format!("* {}", f.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 尽力检索：出错时记录日志并按无结果处理
pub async fn relevant_context(memory: &dyn LongTermMemory, user_id: &str, query: &str) -> String {
    if !memory.enabled() || query.trim().is_empty() {
        return NO_RELEVANT_MEMORY.to_string();
    }
    match memory.search(user_id, query).await {
        Ok(facts) => format_facts(&facts),
        Err(e) => {
            tracing::error!(user_id, error = %e, "memory_search_failed");
            NO_RELEVANT_MEMORY.to_string()
        }
    }
}

/// 从消息中抽取候选事实：非空 user 发言，去掉已存在与本批重复的
pub fn extract_facts(messages: &[Message], existing: &HashSet<String>) -> Vec<String> {
    let mut seen = existing.clone();
    messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.trim().to_string())
        .filter(|text| !text.is_empty() && seen.insert(text.clone()))
        .collect()
}

/// 按得分降序，同分时较新的在前，截取 limit 条
fn rank(mut scored: Vec<MemoryFact>, limit: usize) -> Vec<MemoryFact> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
    });
    scored.truncate(limit);
    scored
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn search(&self, _user_id: &str, _query: &str) -> Result<Vec<MemoryFact>, MemoryError> {
        Ok(Vec::new())
    }

    async fn add(&self, _user_id: &str, _messages: &[Message]) -> Result<usize, MemoryError> {
        Ok(0)
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 简单内存实现：按关键词重叠检索，每个用户独立存储
#[derive(Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<HashMap<String, Vec<MemoryFact>>>>,
    max_entries: usize,
    limit: usize,
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize, limit: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            limit,
        }
    }

    /// 某用户当前保存的全部事实（按写入顺序）
    pub async fn facts(&self, user_id: &str) -> Vec<MemoryFact> {
        self.store
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(500, 5)
    }
}

#[async_trait]
impl LongTermMemory for InMemoryLongTerm {
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<MemoryFact>, MemoryError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().await;
        let scored: Vec<MemoryFact> = store
            .get(user_id)
            .map(|facts| {
                facts
                    .iter()
                    .filter_map(|f| {
                        let overlap = query_tokens.intersection(&tokenize_lower(&f.text)).count();
                        (overlap > 0).then(|| MemoryFact {
                            score: overlap as f32 / query_tokens.len() as f32,
                            ..f.clone()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank(scored, self.limit))
    }

    async fn add(&self, user_id: &str, messages: &[Message]) -> Result<usize, MemoryError> {
        let mut store = self.store.write().await;
        let facts = store.entry(user_id.to_string()).or_default();
        let existing: HashSet<String> = facts.iter().map(|f| f.text.clone()).collect();

        let new_facts = extract_facts(messages, &existing);
        let added = new_facts.len();
        facts.extend(new_facts.into_iter().map(|text| MemoryFact::new(user_id, text)));

        let n = facts.len();
        if n > self.max_entries {
            facts.drain(0..n - self.max_entries);
        }
        Ok(added)
    }
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// 向量实现：嵌入 + 余弦相似度
///
/// 设置了连接池时，事实同时写入 memory_facts 表，某用户首次被访问时从表中加载。
pub struct VectorLongTerm {
    embedder: Arc<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<(MemoryFact, Vec<f32>)>>>,
    limit: usize,
    min_score: f32,
    max_entries: usize,
    #[cfg(feature = "async-sqlite")]
    pool: Option<sqlx::SqlitePool>,
    #[cfg(feature = "async-sqlite")]
    loaded: RwLock<HashSet<String>>,
}

impl VectorLongTerm {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, section: &MemorySection) -> Self {
        Self {
            embedder,
            cache: RwLock::new(HashMap::new()),
            limit: section.search_limit,
            min_score: section.min_score,
            max_entries: section.max_facts_per_user,
            #[cfg(feature = "async-sqlite")]
            pool: None,
            #[cfg(feature = "async-sqlite")]
            loaded: RwLock::new(HashSet::new()),
        }
    }

    /// 启用 SQLite 持久化（与检查点共用连接池），建表幂等
    #[cfg(feature = "async-sqlite")]
    pub async fn with_pool(mut self, pool: sqlx::SqlitePool) -> Result<Self, MemoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memory_facts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_facts_user ON memory_facts(user_id)")
            .execute(&pool)
            .await?;
        self.pool = Some(pool);
        Ok(self)
    }

    #[cfg(feature = "async-sqlite")]
    async fn ensure_loaded(&self, user_id: &str) -> Result<(), MemoryError> {
        use sqlx::Row;

        let Some(pool) = &self.pool else {
            return Ok(());
        };
        if self.loaded.read().await.contains(user_id) {
            return Ok(());
        }

        let rows = sqlx::query(
            "SELECT id, text, embedding, created_at FROM memory_facts WHERE user_id = ? ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: String = row.get("embedding");
            let created_at: String = row.get("created_at");
            let vector: Vec<f32> = serde_json::from_str(&embedding)
                .map_err(|e| MemoryError::Storage(e.to_string()))?;
            let fact = MemoryFact {
                id: row.get("id"),
                user_id: user_id.to_string(),
                text: row.get("text"),
                score: 0.0,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            };
            entries.push((fact, vector));
        }

        self.install_loaded(user_id, entries).await;
        Ok(())
    }

    /// 写入从表中加载的事实；并发的首次访问可能已先完成加载并追加了新事实，持锁后再确认一次
    #[cfg(feature = "async-sqlite")]
    async fn install_loaded(&self, user_id: &str, entries: Vec<(MemoryFact, Vec<f32>)>) -> bool {
        let mut cache = self.cache.write().await;
        let mut loaded = self.loaded.write().await;
        if !loaded.insert(user_id.to_string()) {
            return false;
        }
        cache.insert(user_id.to_string(), entries);
        true
    }

    #[cfg(feature = "async-sqlite")]
    async fn persist(&self, user_id: &str, added: &[(MemoryFact, Vec<f32>)]) -> Result<(), MemoryError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let mut tx = pool.begin().await?;
        for (fact, vector) in added {
            let embedding =
                serde_json::to_string(vector).map_err(|e| MemoryError::Storage(e.to_string()))?;
            sqlx::query(
                "INSERT INTO memory_facts (id, user_id, text, embedding, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&fact.id)
            .bind(user_id)
            .bind(&fact.text)
            .bind(embedding)
            .bind(fact.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "DELETE FROM memory_facts WHERE user_id = ? AND id NOT IN (
                SELECT id FROM memory_facts WHERE user_id = ? ORDER BY created_at DESC LIMIT ?
            )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(self.max_entries as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LongTermMemory for VectorLongTerm {
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<MemoryFact>, MemoryError> {
        #[cfg(feature = "async-sqlite")]
        self.ensure_loaded(user_id).await?;

        let query_vec = self
            .embedder
            .embed(query)
            .await
            .map_err(MemoryError::Embedding)?;
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }

        let cache = self.cache.read().await;
        let scored: Vec<MemoryFact> = cache
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(fact, vector)| MemoryFact {
                        score: cosine_similarity(&query_vec, vector),
                        ..fact.clone()
                    })
                    .filter(|f| f.score >= self.min_score)
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank(scored, self.limit))
    }

    async fn add(&self, user_id: &str, messages: &[Message]) -> Result<usize, MemoryError> {
        #[cfg(feature = "async-sqlite")]
        self.ensure_loaded(user_id).await?;

        let existing: HashSet<String> = self
            .cache
            .read()
            .await
            .get(user_id)
            .map(|entries| entries.iter().map(|(f, _)| f.text.clone()).collect())
            .unwrap_or_default();

        let mut added = Vec::new();
        for text in extract_facts(messages, &existing) {
            let vector = self
                .embedder
                .embed(&text)
                .await
                .map_err(MemoryError::Embedding)?;
            added.push((MemoryFact::new(user_id, text), vector));
        }
        if added.is_empty() {
            return Ok(0);
        }

        #[cfg(feature = "async-sqlite")]
        self.persist(user_id, &added).await?;

        let count = added.len();
        let mut cache = self.cache.write().await;
        let entries = cache.entry(user_id.to_string()).or_default();
        entries.extend(added);
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        tracing::debug!(user_id, added = count, "memory_facts_added");
        Ok(count)
    }
}
