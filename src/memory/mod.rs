//! 记忆层：消息模型、上下文窗口裁剪、长期记忆（跨会话检索）

pub mod conversation;
pub mod long_term;
pub mod window;

pub use conversation::{Message, ResponseMessage, Role, ToolCall};
pub use long_term::{
    format_facts, relevant_context, InMemoryLongTerm, LongTermMemory, MemoryError, MemoryFact,
    NoopLongTerm, VectorLongTerm, NO_RELEVANT_MEMORY,
};
pub use window::{prepare_messages, TokenEstimator};
