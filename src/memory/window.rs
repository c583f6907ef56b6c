//! 上下文窗口裁剪
//!
//! 发送给模型前：system prompt 固定在首位，其后保留能放进预算的最近消息，
//! 且窗口总是从一条 user 消息开始（不会以孤立的工具结果或 assistant 回复开头）。

use crate::memory::{Message, Role};

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：文本 + 工具调用参数 + 固定结构开销
    pub fn estimate_message(message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| Self::estimate(&c.name) + Self::estimate(&c.args.to_string()))
            .sum();
        Self::estimate(&message.content) + calls + 4
    }
}

/// 组装模型输入：system prompt + 预算内最近的消息
///
/// 历史中的 system 消息会被丢弃（由 system_prompt 取代）。若最近一条 user 消息之后的内容
/// 已超出预算，仍从该 user 消息开始完整保留，保证模型总能看到当前问题。
pub fn prepare_messages(messages: &[Message], system_prompt: &str, budget: usize) -> Vec<Message> {
    let system = Message::system(system_prompt);
    let remaining = budget.saturating_sub(TokenEstimator::estimate_message(&system));

    let history: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();

    let mut used = 0;
    let mut start = history.len();
    for (i, m) in history.iter().enumerate().rev() {
        let cost = TokenEstimator::estimate_message(m);
        if used + cost > remaining {
            break;
        }
        used += cost;
        start = i;
    }

    // 窗口起点对齐到 user 消息
    let aligned = history[start..]
        .iter()
        .position(|m| m.role == Role::User)
        .map(|offset| start + offset)
        .or_else(|| history.iter().rposition(|m| m.role == Role::User));

    let mut out = Vec::with_capacity(history.len() + 1);
    out.push(system);
    if let Some(from) = aligned {
        out.extend(history[from..].iter().map(|m| (*m).clone()));
    }
    out
}
