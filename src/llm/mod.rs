//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock、模型注册表与重试/降级韧性层

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod registry;
pub mod retry;
pub mod service;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::{FailingLlmClient, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use registry::{ModelBackend, ModelRegistry};
pub use retry::RetryPolicy;
pub use service::{LlmService, ResilienceState};
pub use traits::{LlmClient, LlmError, ModelParams, ToolSpec};
