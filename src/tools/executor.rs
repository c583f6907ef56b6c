//! 工具执行器
//!
//! 持有 ToolRegistry，execute(call) 按名解析并调用工具：未注册返回 UnknownTool，
//! 工具返回 Err 转为 ToolExecutionFailed；每次调用输出结构化审计日志（JSON）。
//! 不设超时，挂起的工具会阻塞所属的这一轮对话。

use std::time::Instant;

use crate::core::AgentError;
use crate::memory::{Message, ToolCall};
use crate::tools::ToolRegistry;

/// 工具执行器
#[derive(Clone, Default)]
pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行单个调用，结果包装为 call-id 相同的工具结果消息
    pub async fn execute(&self, call: &ToolCall) -> Result<Message, AgentError> {
        let tool = match self.registry.resolve(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                audit(&call.name, false, "unknown", 0, &call.args);
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = tool.invoke(call.args.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(_) => (false, "error"),
        };
        audit(&call.name, ok, outcome, duration_ms, &call.args);

        match result {
            Ok(content) => Ok(Message::tool_result(call.id.clone(), content)),
            Err(reason) => Err(AgentError::ToolExecutionFailed {
                tool: call.name.clone(),
                reason,
            }),
        }
    }

    /// 按请求顺序执行整批调用；任一失败即中止
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Result<Vec<Message>, AgentError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call).await?);
        }
        Ok(results)
    }
}

fn audit(tool: &str, ok: bool, outcome: &str, duration_ms: u64, args: &serde_json::Value) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit, "tool_audit");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
