//! 状态机的状态：消息历史 + 本轮注入的长期记忆上下文，以及下一节点
//!
//! 负责输入合并（客户端重发完整历史时只追加新增部分）与对外响应的投影。

use serde::{Deserialize, Serialize};

use crate::memory::{Message, ResponseMessage, Role};

/// 下一个要执行的节点
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextNode {
    Chat,
    ToolCall,
    /// 本轮已结束
    End,
}

impl NextNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextNode::Chat => "chat",
            NextNode::ToolCall => "tool_call",
            NextNode::End => "end",
        }
    }
}

/// 会话状态（随检查点持久化）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// 只追加的消息历史
    pub messages: Vec<Message>,
    #[serde(default)]
    pub long_term_memory: String,
}

impl ConversationState {
    /// 对外可见的 user/assistant 记录
    pub fn transcript(&self) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.is_visible()).collect()
    }

    /// 计算输入中真正新增的消息
    ///
    /// - 输入以已持久化的可见记录开头：只取剩余部分
    /// - 输入是已持久化记录的前缀，且恰好止于最后一条 user 消息（原样重发上一轮）：没有新增
    /// - 其余情况（包括只发最新一条、内容恰好等于更早某轮的客户端）：整份输入都是新的
    pub fn new_input(&self, input: &[Message]) -> Vec<Message> {
        let persisted = self.transcript();
        let input: Vec<&Message> = input.iter().filter(|m| m.role != Role::System).collect();

        let common = persisted
            .iter()
            .zip(input.iter())
            .take_while(|(p, i)| p.same_content(i))
            .count();

        if common == input.len() && common > 0 {
            let last_user = persisted.iter().rposition(|m| m.role == Role::User);
            if last_user == Some(common - 1) {
                return Vec::new();
            }
        }
        let from = if common == persisted.len() { common } else { 0 };
        input[from..]
            .iter()
            .filter(|m| !(m.role == Role::User && m.content.trim().is_empty()))
            .map(|m| (*m).clone())
            .collect()
    }

    /// 最近一条 assistant 消息上的待执行工具调用
    pub fn pending_tool_calls(&self) -> &[crate::memory::ToolCall] {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.tool_calls.as_slice())
            .unwrap_or(&[])
    }

    /// 本轮响应：最后一条 user 消息之后的可见消息
    pub fn response(&self) -> Vec<ResponseMessage> {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages[start..]
            .iter()
            .filter(|m| m.is_visible())
            .map(ResponseMessage::from)
            .collect()
    }

    /// 完整可见历史
    pub fn history(&self) -> Vec<ResponseMessage> {
        self.transcript().into_iter().map(ResponseMessage::from).collect()
    }
}
