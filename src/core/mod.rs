//! 核心编排层：错误、会话状态、检查点、提示词、状态机、编排器与构建器

pub mod builder;
pub mod checkpoint;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod prompts;
pub mod state;

pub use builder::{create_llm_from_config, default_tools, AgentBuilder};
pub use checkpoint::{Checkpoint, Checkpointer, InMemoryCheckpointer};
#[cfg(feature = "async-sqlite")]
pub use checkpoint::SqliteCheckpointer;
pub use error::AgentError;
pub use graph::AgentGraph;
pub use orchestrator::AgentOrchestrator;
pub use prompts::PromptTemplate;
pub use state::{ConversationState, NextNode};
