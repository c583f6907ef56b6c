//! Mock LLM 客户端（用于测试，无需 API）
//!
//! - MockLlmClient：无 API Key 时的本地后端，回显最后一条用户消息；若上一条是工具结果则复述结果。
//! - ScriptedLlmClient：按脚本依次返回预设结果，并记录每次请求，供集成测试驱动状态机。
//! - FailingLlmClient：始终返回同一个错误，并统计调用次数，供降级测试使用。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::{LlmClient, LlmError, ModelParams, ToolSpec};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
        _params: &ModelParams,
    ) -> Result<Message, LlmError> {
        if let Some(last) = messages.last().filter(|m| m.role == Role::Tool) {
            return Ok(Message::assistant(format!("Tool result: {}", last.content)));
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(Message::assistant(format!("Echo from Mock: {}", last_user)))
    }
}

/// 脚本客户端：每次调用弹出一个预设结果；脚本耗尽后返回 InvalidRequest
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<Message, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    tools: Mutex<Vec<Vec<String>>>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<Message, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub async fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().await.clone()
    }

    /// 每次调用绑定的工具名
    pub async fn seen_tools(&self) -> Vec<Vec<String>> {
        self.tools.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        _params: &ModelParams,
    ) -> Result<Message, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(messages.to_vec());
        self.tools
            .lock()
            .await
            .push(tools.iter().map(|t| t.name.clone()).collect());

        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidRequest("script exhausted".to_string())))
    }
}

/// 始终失败的客户端
#[derive(Debug)]
pub struct FailingLlmClient {
    error: LlmError,
    calls: AtomicUsize,
}

impl FailingLlmClient {
    pub fn new(error: LlmError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FailingLlmClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _params: &ModelParams,
    ) -> Result<Message, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}
