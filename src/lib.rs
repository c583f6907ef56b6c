//! AgentStack - Rust 对话智能体服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量 + APP_ENV 环境档位）
//! - **core**: 会话状态、检查点、状态机（chat / tool_call）、编排器与构建器
//! - **llm**: 模型客户端抽象、OpenAI 兼容实现、Mock、重试与降级韧性层
//! - **memory**: 消息模型、上下文窗口裁剪、长期记忆
//! - **observability**: tracing 日志初始化
//! - **storage**: SQLite 用户/会话存储（`async-sqlite` feature）
//! - **tools**: 工具 trait、注册表、执行器与 DuckDuckGo 搜索

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
#[cfg(feature = "async-sqlite")]
pub mod storage;
pub mod tools;

pub use crate::core::{AgentBuilder, AgentError, AgentOrchestrator};
