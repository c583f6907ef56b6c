//! 模型调用韧性层
//!
//! 对有序后端列表执行调用：每个后端内部按 RetryPolicy 重试瞬时错误；重试耗尽后
//! 粘性下标前移到 (i + 1) mod N 并在新后端上重跑，最多遍历 N 个后端，全部耗尽返回
//! AllBackendsExhausted。非瞬时错误不重试，但同样切换到下一个后端。
//!
//! 粘性下标保存在可注入的 ResilienceState 中：成功后不回拨，后续调用继续使用降级后的后端，
//! 直到再次失败轮转回来或显式 reset()。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::{LlmError, ModelRegistry, RetryPolicy, ToolSpec};
use crate::memory::Message;

/// 韧性层可变状态：当前后端下标与累计降级次数
#[derive(Debug, Default)]
pub struct ResilienceState {
    current: AtomicUsize,
    start: usize,
    fallbacks: AtomicU64,
}

impl ResilienceState {
    pub fn new(start: usize) -> Self {
        Self {
            current: AtomicUsize::new(start),
            start,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// 从 from 前移一位；若其他并发调用已先行前移则沿用对方结果
    pub fn advance(&self, from: usize, len: usize) -> usize {
        let next = (from + 1) % len.max(1);
        match self
            .current
            .compare_exchange(from, next, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
                next
            }
            Err(actual) => actual,
        }
    }

    /// 已发生的降级切换次数
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.current.store(self.start, Ordering::SeqCst);
    }
}

/// 带重试与循环降级的模型服务
#[derive(Clone)]
pub struct LlmService {
    registry: Arc<ModelRegistry>,
    retry: RetryPolicy,
    state: Arc<ResilienceState>,
    tools: Arc<Vec<ToolSpec>>,
}

impl LlmService {
    /// 后端列表为空时返回配置错误
    pub fn new(registry: ModelRegistry, retry: RetryPolicy) -> Result<Self, AgentError> {
        let state = Arc::new(ResilienceState::new(registry.default_index()));
        Self::with_state(registry, retry, state)
    }

    /// 注入外部持有的状态（测试中观察降级次数）
    pub fn with_state(
        registry: ModelRegistry,
        retry: RetryPolicy,
        state: Arc<ResilienceState>,
    ) -> Result<Self, AgentError> {
        if registry.is_empty() {
            return Err(AgentError::Config("no model backends configured".to_string()));
        }
        Ok(Self {
            registry: Arc::new(registry),
            retry,
            state,
            tools: Arc::new(Vec::new()),
        })
    }

    /// 绑定工具描述，之后每次调用都会带上
    pub fn bind_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn state(&self) -> Arc<ResilienceState> {
        self.state.clone()
    }

    /// 当前首选后端名称
    pub fn current_backend(&self) -> &str {
        let index = self.state.current() % self.registry.len();
        self.registry
            .get(index)
            .map(|b| b.name.as_str())
            .unwrap_or_default()
    }

    /// 回到起始后端（default_model）
    pub fn reset(&self) {
        self.state.reset();
    }

    /// 调用当前首选后端；失败则按环形顺序切换到下一个，直到每个后端都试过一次
    ///
    /// 瞬时错误在单个后端内按 RetryPolicy 重试，非瞬时错误不重试，两者都会触发降级。
    /// 最后一个后端失败后不再切换，粘性下标停留在该后端上。
    pub async fn call(&self, messages: &[Message]) -> Result<Message, AgentError> {
        let total = self.registry.len();

        for tried in 1..=total {
            let index = self.state.current() % total;
            let Some(backend) = self.registry.get(index) else {
                break;
            };

            tracing::debug!(model = %backend.name, messages = messages.len(), "llm_call");
            let result = self
                .retry
                .execute(
                    || backend.client.complete(messages, &self.tools, &backend.params),
                    LlmError::is_transient,
                )
                .await;

            let err = match result {
                Ok(message) => return Ok(message),
                Err(e) => e,
            };
            if err.is_transient() {
                tracing::error!(
                    model = %backend.name,
                    attempts = self.retry.max_attempts,
                    error = %err,
                    "model_failed_exhausted_retries"
                );
            } else {
                tracing::error!(model = %backend.name, error = %err, "model_call_failed");
            }

            if tried == total {
                break;
            }
            let next = self.state.advance(index, total);
            let next_name = self.registry.get(next).map(|b| b.name.as_str()).unwrap_or_default();
            tracing::warn!(from = %backend.name, to = %next_name, "switching_model_fallback");
        }

        tracing::error!(backends = total, "all_models_exhausted");
        Err(AgentError::AllBackendsExhausted { attempts: total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FailingLlmClient, ModelBackend, ScriptedLlmClient};

    fn failing(name: &str, err: LlmError) -> (ModelBackend, Arc<FailingLlmClient>) {
        let client = Arc::new(FailingLlmClient::new(err));
        (ModelBackend::new(name, client.clone()), client)
    }

    #[tokio::test]
    async fn test_fallback_is_sticky_across_calls() {
        let (a, a_client) = failing("a", LlmError::RateLimited);
        let b_client = Arc::new(ScriptedLlmClient::new(vec![
            Ok(Message::assistant("first")),
            Ok(Message::assistant("second")),
        ]));
        let registry = ModelRegistry::new(vec![a, ModelBackend::new("b", b_client.clone())]);
        let service = LlmService::new(registry, RetryPolicy::immediate(2)).unwrap();

        let first = service.call(&[Message::user("hi")]).await.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(service.current_backend(), "b");

        // 第二次直接使用 b，不再尝试 a
        let second = service.call(&[Message::user("again")]).await.unwrap();
        assert_eq!(second.content, "second");
        assert_eq!(a_client.calls(), 2);
        assert_eq!(b_client.calls(), 2);
        assert_eq!(service.state().fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_error_falls_over_without_retry() {
        let (a, a_client) = failing("a", LlmError::Authentication);
        let b_client = Arc::new(ScriptedLlmClient::new(vec![Ok(Message::assistant("from b"))]));
        let registry = ModelRegistry::new(vec![a, ModelBackend::new("b", b_client.clone())]);
        let service = LlmService::new(registry, RetryPolicy::immediate(3)).unwrap();

        let reply = service.call(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply.content, "from b");
        // 鉴权错误不重试，直接切到下一个后端
        assert_eq!(a_client.calls(), 1);
        assert_eq!(b_client.calls(), 1);
        assert_eq!(service.current_backend(), "b");
        assert_eq!(service.state().fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_all_backends_exhausted() {
        let (a, a_client) = failing("a", LlmError::Timeout);
        let (b, b_client) = failing("b", LlmError::Api("503".into()));
        let service =
            LlmService::new(ModelRegistry::new(vec![a, b]), RetryPolicy::immediate(3)).unwrap();

        let err = service.call(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, AgentError::AllBackendsExhausted { attempts: 2 }));
        assert_eq!(a_client.calls(), 3);
        assert_eq!(b_client.calls(), 3);
        // 最后一个后端失败后不再绕回起点
        assert_eq!(service.current_backend(), "b");
        assert_eq!(service.state().fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_starts_from_default_and_wraps_around() {
        let a_client = Arc::new(ScriptedLlmClient::new(vec![Ok(Message::assistant("from a"))]));
        let (b, _) = failing("b", LlmError::RateLimited);
        let registry = ModelRegistry::new(vec![ModelBackend::new("a", a_client), b]).with_default("b");
        let service = LlmService::new(registry, RetryPolicy::immediate(1)).unwrap();
        assert_eq!(service.current_backend(), "b");

        let reply = service.call(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply.content, "from a");
        assert_eq!(service.current_backend(), "a");

        service.reset();
        assert_eq!(service.current_backend(), "b");
    }

    #[test]
    fn test_empty_registry_rejected() {
        let result = LlmService::new(ModelRegistry::default(), RetryPolicy::default());
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_concurrent_advance_keeps_single_step() {
        let state = ResilienceState::new(0);
        assert_eq!(state.advance(0, 3), 1);
        // 另一个调用者仍以为当前是 0
        assert_eq!(state.advance(0, 3), 1);
        assert_eq!(state.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_bound_tools_are_sent() {
        let client = Arc::new(ScriptedLlmClient::new(vec![Ok(Message::assistant("ok"))]));
        let service = LlmService::new(
            ModelRegistry::new(vec![ModelBackend::new("a", client.clone())]),
            RetryPolicy::immediate(1),
        )
        .unwrap()
        .bind_tools(vec![ToolSpec {
            name: "search".into(),
            description: "web search".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);

        service.call(&[Message::user("hi")]).await.unwrap();
        let seen = client.seen_tools().await;
        assert_eq!(seen, vec![vec!["search".to_string()]]);
    }
}
