//! Agent 编排器：一轮对话的入口
//!
//! handle_turn(messages, session_id, user_id)：
//! 1. 懒初始化状态机与检查点存储（只做一次，并发安全）
//! 2. 以最新一条 user 消息检索长期记忆，拼成上下文（无结果用占位串）
//! 3. 以 session_id 为 thread_id 运行状态机到结束
//! 4. 后台（fire-and-forget）用完整消息列表更新长期记忆，调用方不等待也看不到其结果
//! 5. 返回本轮新增的 user/assistant 可见消息

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::core::{AgentError, AgentGraph, Checkpointer, PromptTemplate};
use crate::llm::LlmService;
use crate::memory::{relevant_context, LongTermMemory, Message, ResponseMessage, Role};
use crate::tools::ToolExecutor;

/// 编排器
pub struct AgentOrchestrator {
    llm: LlmService,
    tools: ToolExecutor,
    prompt: PromptTemplate,
    checkpointer: Arc<dyn Checkpointer>,
    memory: Arc<dyn LongTermMemory>,
    recursion_limit: usize,
    context_window_tokens: usize,
    graph: OnceCell<AgentGraph>,
}

impl AgentOrchestrator {
    pub fn new(
        llm: LlmService,
        tools: ToolExecutor,
        prompt: PromptTemplate,
        checkpointer: Arc<dyn Checkpointer>,
        memory: Arc<dyn LongTermMemory>,
    ) -> Self {
        let llm = llm.bind_tools(tools.registry().specs());
        tracing::info!(
            model = %llm.current_backend(),
            tools = tools.registry().len(),
            "agent_initialized"
        );
        Self {
            llm,
            tools,
            prompt,
            checkpointer,
            memory,
            recursion_limit: 25,
            context_window_tokens: 2000,
            graph: OnceCell::new(),
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn llm(&self) -> &LlmService {
        &self.llm
    }

    /// 状态机（首次调用时完成检查点 setup 并编译）
    pub async fn graph(&self) -> Result<&AgentGraph, AgentError> {
        self.graph
            .get_or_try_init(|| async {
                self.checkpointer.setup().await?;
                tracing::info!("graph_created");
                let graph = AgentGraph::new(
                    self.llm.clone(),
                    self.tools.clone(),
                    self.prompt.clone(),
                    self.checkpointer.clone(),
                )
                .with_recursion_limit(self.recursion_limit)
                .with_context_window(self.context_window_tokens);
                Ok::<_, AgentError>(graph)
            })
            .await
    }

    /// 处理一轮对话
    pub async fn handle_turn(
        &self,
        messages: Vec<Message>,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<ResponseMessage>, AgentError> {
        // 只有 system 消息的输入等同于空输入
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| messages.iter().rev().find(|m| m.role != Role::System))
            .map(|m| m.content.clone())
            .ok_or(AgentError::EmptyInput)?;

        let graph = self.graph().await?;
        let context = relevant_context(self.memory.as_ref(), user_id, &query).await;

        let state = graph.invoke(session_id, &messages, context).await.map_err(|e| {
            tracing::error!(session_id, error = %e, "turn_failed");
            e
        })?;

        self.spawn_memory_update(user_id, state.messages.clone());
        Ok(state.response())
    }

    /// 线程的完整可见记录；没有记录时为空
    pub async fn get_chat_history(&self, session_id: &str) -> Result<Vec<ResponseMessage>, AgentError> {
        let graph = self.graph().await?;
        Ok(graph
            .get_state(session_id)
            .await?
            .map(|cp| cp.state.history())
            .unwrap_or_default())
    }

    /// 后台更新长期记忆；句柄直接丢弃，不保证在响应返回前完成
    fn spawn_memory_update(&self, user_id: &str, messages: Vec<Message>) {
        if !self.memory.enabled() {
            return;
        }
        let memory = self.memory.clone();
        let user_id = user_id.to_string();
        let task = async move {
            match memory.add(&user_id, &messages).await {
                Ok(added) => tracing::debug!(user_id = %user_id, added, "memory_updated"),
                Err(e) => tracing::error!(user_id = %user_id, error = %e, "memory_update_failed"),
            }
        };
        drop(tokio::spawn(task.instrument(tracing::Span::current())));
    }
}
