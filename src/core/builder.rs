//! Agent 构建器：从配置装配编排器
//!
//! 所有入口（CLI、测试、嵌入方）共用同一套装配逻辑：
//! 模型客户端 → 注册表与韧性层 → 工具表 → 提示词 → 数据库（检查点与记忆共用连接池）→ 长期记忆。
//! 每一部分都可以用 with_* 覆盖，测试借此注入 Mock。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{AgentError, AgentOrchestrator, Checkpointer, InMemoryCheckpointer, PromptTemplate};
use crate::llm::{
    create_embedder_from_config, LlmClient, LlmService, MockLlmClient, ModelRegistry, OpenAiClient,
    RetryPolicy,
};
use crate::memory::{InMemoryLongTerm, LongTermMemory, NoopLongTerm, VectorLongTerm};
use crate::tools::{DuckDuckGoSearchTool, ToolRegistry};

#[cfg(feature = "async-sqlite")]
use crate::core::SqliteCheckpointer;
#[cfg(feature = "async-sqlite")]
use crate::storage::Database;

/// 提示词文件缺失时使用的模板
const FALLBACK_SYSTEM_PROMPT: &str = "You are {agent_name}, a helpful assistant with access to tools.\n\
Current date and time: {current_date_and_time}\n\n\
What you know about the user:\n{long_term_memory}";

/// 根据配置选择模型客户端：有 API Key 走 OpenAI 兼容端点，否则 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.resolved_api_key() {
        Some(key) => {
            tracing::info!(
                base_url = cfg.llm.base_url.as_deref().unwrap_or("default"),
                models = cfg.llm.models.len(),
                "using_openai_backends"
            );
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &key))
        }
        None => {
            tracing::warn!("no_api_key_using_mock_llm");
            Arc::new(MockLlmClient)
        }
    }
}

/// 内置工具表
pub fn default_tools() -> Result<ToolRegistry, AgentError> {
    let search = DuckDuckGoSearchTool::new(10).map_err(|e| AgentError::Config(e.to_string()))?;
    Ok(ToolRegistry::new().with_tool(search))
}

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    llm_client: Option<Arc<dyn LlmClient>>,
    retry: Option<RetryPolicy>,
    tools: Option<ToolRegistry>,
    prompt: Option<PromptTemplate>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    memory: Option<Arc<dyn LongTermMemory>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm_client: None,
            retry: None,
            tools: None,
            prompt: None,
            checkpointer: None,
            memory: None,
        }
    }

    /// 所有后端共用的模型客户端
    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm_client = Some(client);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 加载提示词模板；文件不可用时退回内置模板
    pub fn build_prompt(&self) -> PromptTemplate {
        PromptTemplate::load(&self.config.app.prompt_path, &self.config.app.name).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "prompt_file_missing_using_fallback");
            PromptTemplate::new(FALLBACK_SYSTEM_PROMPT, &self.config.app.name)
        })
    }

    /// 模型注册表 + 重试/降级韧性层
    pub fn build_llm(&self) -> Result<LlmService, AgentError> {
        let client = self
            .llm_client
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let registry = ModelRegistry::from_config(&self.config.llm, client);
        if let Some(start) = registry.get_by_name(&self.config.llm.default_model) {
            tracing::info!(
                start = %start.name,
                backends = ?registry.names(),
                "model_registry_built"
            );
        }
        let retry = self
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from_config(&self.config.llm));
        LlmService::new(registry, retry)
    }

    /// 组装编排器
    pub async fn build(self) -> Result<AgentOrchestrator, AgentError> {
        let llm = self.build_llm()?;
        let tools = match &self.tools {
            Some(tools) => tools.clone(),
            None => default_tools()?,
        };
        let prompt = match &self.prompt {
            Some(prompt) => prompt.clone(),
            None => self.build_prompt(),
        };

        let (checkpointer, memory) = self.build_persistence().await?;

        Ok(AgentOrchestrator::new(
            llm,
            crate::tools::ToolExecutor::new(tools),
            prompt,
            checkpointer,
            memory,
        )
        .with_recursion_limit(self.config.app.graph_recursion_limit)
        .with_context_window(self.config.llm.context_window_tokens))
    }

    /// 检查点存储与长期记忆；两者都未覆盖时才打开数据库
    #[cfg(feature = "async-sqlite")]
    async fn build_persistence(
        &self,
    ) -> Result<(Arc<dyn Checkpointer>, Arc<dyn LongTermMemory>), AgentError> {
        let need_db = self.checkpointer.is_none() || self.memory.is_none();
        let db = if need_db {
            Some(Database::connect(&self.config.database).await?)
        } else {
            None
        };

        let checkpointer: Arc<dyn Checkpointer> = match (&self.checkpointer, &db) {
            (Some(cp), _) => cp.clone(),
            (None, Some(db)) => Arc::new(SqliteCheckpointer::new(db.pool().clone())),
            (None, None) => Arc::new(InMemoryCheckpointer::new()),
        };

        let memory = match &self.memory {
            Some(memory) => memory.clone(),
            None => self.build_memory(db.as_ref()).await?,
        };
        Ok((checkpointer, memory))
    }

    #[cfg(not(feature = "async-sqlite"))]
    async fn build_persistence(
        &self,
    ) -> Result<(Arc<dyn Checkpointer>, Arc<dyn LongTermMemory>), AgentError> {
        let checkpointer = self
            .checkpointer
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointer::new()));
        let memory = match &self.memory {
            Some(memory) => memory.clone(),
            None => self.build_memory().await?,
        };
        Ok((checkpointer, memory))
    }

    /// 记忆关闭 → Noop；有嵌入 → 向量（有数据库时持久化）；否则关键词内存实现
    #[cfg(feature = "async-sqlite")]
    async fn build_memory(&self, db: Option<&Database>) -> Result<Arc<dyn LongTermMemory>, AgentError> {
        let section = &self.config.memory;
        if !section.enabled {
            return Ok(Arc::new(NoopLongTerm));
        }
        let Some(embedder) = create_embedder_from_config(&self.config) else {
            tracing::info!("long_term_memory_keyword_fallback");
            return Ok(Arc::new(InMemoryLongTerm::new(section.max_facts_per_user, section.search_limit)));
        };
        let vector = VectorLongTerm::new(embedder, section);
        let vector = match db {
            Some(db) => vector
                .with_pool(db.pool().clone())
                .await
                .map_err(|e| AgentError::Storage(e.to_string()))?,
            None => vector,
        };
        Ok(Arc::new(vector))
    }

    #[cfg(not(feature = "async-sqlite"))]
    async fn build_memory(&self) -> Result<Arc<dyn LongTermMemory>, AgentError> {
        let section = &self.config.memory;
        if !section.enabled {
            return Ok(Arc::new(NoopLongTerm));
        }
        Ok(match create_embedder_from_config(&self.config) {
            Some(embedder) => Arc::new(VectorLongTerm::new(embedder, section)),
            None => Arc::new(InMemoryLongTerm::new(section.max_facts_per_user, section.search_limit)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntry;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::Message;

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.database.url = format!("sqlite://{}", dir.path().join("agent.db").display());
        cfg.database.pool_size = 2;
        cfg.memory.enabled = false;
        cfg.llm.models = vec![ModelEntry::named("primary"), ModelEntry::named("backup")];
        cfg.llm.default_model = "primary".to_string();
        cfg
    }

    #[test]
    fn test_default_tools_has_search() {
        let tools = default_tools().unwrap();
        assert_eq!(tools.tool_names(), vec!["duckduckgo_results_json".to_string()]);
    }

    #[test]
    fn test_missing_prompt_falls_back() {
        let mut cfg = AppConfig::default();
        cfg.app.prompt_path = "/definitely/missing/system.md".into();
        let prompt = AgentBuilder::new(cfg).build_prompt();
        let text = prompt.render(&[("long_term_memory", "* x")]);
        assert!(text.contains("AgentStack Agent"));
        assert!(text.contains("* x"));
    }

    #[test]
    fn test_build_llm_uses_configured_ranking() {
        let dir = tempfile::TempDir::new().unwrap();
        let llm = AgentBuilder::new(test_config(&dir))
            .with_llm_client(Arc::new(MockLlmClient))
            .build_llm()
            .unwrap();
        assert_eq!(llm.registry().names(), vec!["primary", "backup"]);
        assert_eq!(llm.current_backend(), "primary");
    }

    #[tokio::test]
    async fn test_build_with_sqlite_checkpoints() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok(Message::assistant("hello"))]));

        let orch = AgentBuilder::new(test_config(&dir))
            .with_llm_client(client.clone())
            .with_retry(RetryPolicy::immediate(1))
            .with_tools(ToolRegistry::new())
            .build()
            .await
            .unwrap();

        let reply = orch.handle_turn(vec![Message::user("hi")], "s", "u").await.unwrap();
        assert_eq!(reply[0].content, "hello");
        assert!(dir.path().join("agent.db").exists());
        assert_eq!(orch.get_chat_history("s").await.unwrap().len(), 2);
    }
}
