//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。同一个客户端服务所有后端，
//! 模型名与采样参数由每次调用的 ModelParams 决定。请求体经 JSON 构造后反序列化为
//! CreateChatCompletionRequest，工具调用从响应消息的 JSON 形态中解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::CreateChatCompletionRequest;
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, ModelParams, ToolSpec};
use crate::memory::{Message, Role, ToolCall};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端
///
/// 关闭 async-openai 自带的退避重试：每次 complete 只发一次 HTTP 请求，重试与降级统一由 LlmService 负责。
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Self {
            client: Client::with_config(config).with_backoff(no_retry),
            usage: TokenUsage::new(),
        }
    }
}

/// 内部消息转为 Chat Completions 的消息 JSON
fn message_to_json(m: &Message) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.content}),
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Assistant if m.has_tool_calls() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.args.to_string()},
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Assistant => json!({"role": "assistant", "content": m.content}),
        Role::Tool => json!({
            "role": "tool",
            "content": m.content,
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
        }),
    }
}

fn tool_to_json(t: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

/// 构造请求体；推理模型用 max_completion_tokens 与 reasoning_effort，其余用 max_tokens
pub(crate) fn build_request_json(messages: &[Message], tools: &[ToolSpec], params: &ModelParams) -> Value {
    let mut body = json!({
        "model": params.model,
        "messages": messages.iter().map(message_to_json).collect::<Vec<_>>(),
    });

    if let Some(t) = params.temperature {
        body["temperature"] = json!(t);
    }
    match (&params.reasoning_effort, params.max_tokens) {
        (Some(effort), max) => {
            body["reasoning_effort"] = json!(effort);
            if let Some(max) = max {
                body["max_completion_tokens"] = json!(max);
            }
        }
        (None, Some(max)) => body["max_tokens"] = json!(max),
        (None, None) => {}
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.iter().map(tool_to_json).collect());
    }
    body
}

/// 从响应消息 JSON 解析 assistant 消息（文本 + 工具调用）
pub(crate) fn parse_response_message(value: &Value) -> Message {
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls: Vec<ToolCall> = value
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let id = c.get("id")?.as_str()?;
                    let function = c.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let raw = function.get("arguments").and_then(Value::as_str).unwrap_or("{}");
                    // 非法 JSON 参数原样保留，交给工具自己报错
                    let args = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                    Some(ToolCall::new(id, name, args))
                })
                .collect()
        })
        .unwrap_or_default();

    if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_tool_calls(content, tool_calls)
    }
}

/// OpenAIError 映射为 LlmError（瞬时 / 非瞬时）
fn map_openai_error(err: OpenAIError) -> LlmError {
    match &err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "invalid_api_key"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
            {
                LlmError::Authentication
            } else if code == "rate_limit_exceeded" || error_type == "rate_limit_error" {
                LlmError::RateLimited
            } else if code == "context_length_exceeded"
                || api_err.message.contains("maximum context length")
            {
                LlmError::ContextLengthExceeded
            } else if error_type == "invalid_request_error" {
                LlmError::InvalidRequest(api_err.message.clone())
            } else {
                LlmError::Api(api_err.message.clone())
            }
        }
        OpenAIError::Reqwest(reqwest_err) => {
            if reqwest_err.is_timeout() {
                return LlmError::Timeout;
            }
            match reqwest_err.status().map(|s| s.as_u16()) {
                Some(401) | Some(403) => LlmError::Authentication,
                Some(429) => LlmError::RateLimited,
                Some(400) | Some(404) | Some(422) => LlmError::InvalidRequest(err.to_string()),
                _ => LlmError::Api(err.to_string()),
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg.clone()),
        _ => LlmError::Api(err.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        params: &ModelParams,
    ) -> Result<Message, LlmError> {
        let body = build_request_json(messages, tools, params);
        let request: CreateChatCompletionRequest =
            serde_json::from_value(body).map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            tracing::debug!(
                model = %params.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "llm_usage"
            );
        }

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::Deserialization("response has no choices".to_string()))?;
        let value = serde_json::to_value(&choice.message)
            .map_err(|e| LlmError::Deserialization(e.to_string()))?;

        Ok(parse_response_message(&value))
    }
}
