//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：给定消息与已绑定的工具描述，返回一条 assistant 消息
//! （可能携带工具调用请求）。LlmError 区分瞬时错误（可重试、可降级）与非瞬时错误。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

/// 后端级错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimited,

    #[error("Request timed out")]
    Timeout,

    /// 通用 API 故障（5xx、网络抖动等）
    #[error("API error: {0}")]
    Api(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Context length exceeded")]
    ContextLengthExceeded,

    #[error("Failed to parse response: {0}")]
    Deserialization(String),
}

impl LlmError {
    /// 瞬时错误：限流、超时、通用 API 故障
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited | LlmError::Timeout | LlmError::Api(_))
    }
}

/// 绑定到模型的工具描述（name / description / JSON Schema 参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单个后端的调用参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 推理强度（low / medium / high），仅推理模型使用
    pub reasoning_effort: Option<String>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成：返回一条 assistant 消息
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        params: &ModelParams,
    ) -> Result<Message, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Api("502".into()).is_transient());
        assert!(!LlmError::Authentication.is_transient());
        assert!(!LlmError::InvalidRequest("bad".into()).is_transient());
        assert!(!LlmError::ContextLengthExceeded.is_transient());
    }
}
