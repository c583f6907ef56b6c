//! Agent 错误类型
//!
//! 一轮对话（turn）内可能出现的致命错误：模型全部耗尽、未知工具、工具失败、检查点写入失败等。
//! 记忆检索/写入失败不在此列，由记忆适配层就地吞掉。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// 所有后端都已耗尽重试预算，本轮终止
    #[error("Failed to get response from any LLM after exhausting all {attempts} backends")]
    AllBackendsExhausted { attempts: usize },

    /// 模型请求了未注册的工具
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool {tool} failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    /// 检查点读写失败：无法保证可恢复性，必须上抛
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Graph recursion limit of {0} reached without hitting a stop condition")]
    RecursionLimit(usize),

    #[error("No input messages")]
    EmptyInput,

    #[error("Prompt error: {0}")]
    Prompt(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for AgentError {
    fn from(e: sqlx::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}
