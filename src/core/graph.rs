//! 对话状态机
//!
//! 两个节点：
//! - chat：渲染系统提示词（注入长期记忆）→ 裁剪上下文窗口 → 韧性层调用模型；
//!   回复带工具调用则转 tool_call，否则本轮结束
//! - tool_call：依次执行最近一条 assistant 消息上的全部工具调用，结果按 call-id 回填，然后回到 chat
//!
//! 每个节点完成后立即写检查点（以 thread_id 为键），中途崩溃可从最后一个完成的节点恢复。
//! 单轮执行的节点数超过 recursion_limit 视为失控，返回 RecursionLimit。

use std::sync::Arc;

use crate::core::{AgentError, Checkpoint, Checkpointer, ConversationState, NextNode, PromptTemplate};
use crate::llm::LlmService;
use crate::memory::{prepare_messages, Message};
use crate::tools::ToolExecutor;

/// 编译后的状态机
#[derive(Clone)]
pub struct AgentGraph {
    llm: LlmService,
    tools: ToolExecutor,
    prompt: PromptTemplate,
    checkpointer: Arc<dyn Checkpointer>,
    recursion_limit: usize,
    context_window_tokens: usize,
}

impl AgentGraph {
    pub fn new(
        llm: LlmService,
        tools: ToolExecutor,
        prompt: PromptTemplate,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            llm,
            tools,
            prompt,
            checkpointer,
            recursion_limit: 25,
            context_window_tokens: 2000,
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit.max(1);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn llm(&self) -> &LlmService {
        &self.llm
    }

    /// 线程最新检查点
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        self.checkpointer.get(thread_id).await
    }

    /// 运行一轮直到结束，返回最终状态
    ///
    /// 恢复规则：
    /// - 上一轮已结束且输入没有新增消息：直接返回已保存的状态
    /// - 停在 tool_call 前：先执行挂起的工具批次，再追加新输入
    /// - 其余情况：追加新输入后从 chat 开始
    pub async fn invoke(
        &self,
        thread_id: &str,
        input: &[Message],
        long_term_memory: String,
    ) -> Result<ConversationState, AgentError> {
        let (mut state, mut next, mut step) = match self.checkpointer.get(thread_id).await? {
            Some(cp) => (cp.state, cp.next, cp.step),
            None => (ConversationState::default(), NextNode::Chat, 0),
        };

        let mut pending_input = state.new_input(input);
        if next == NextNode::End && pending_input.is_empty() {
            tracing::info!(thread_id, step, "turn_already_completed");
            return Ok(state);
        }
        state.long_term_memory = long_term_memory;

        if next == NextNode::End {
            next = NextNode::Chat;
        }
        if next == NextNode::Chat && !pending_input.is_empty() {
            state.messages.append(&mut pending_input);
            step += 1;
            self.save(thread_id, step, next, &state).await?;
        }

        let mut executed = 0;
        while next != NextNode::End {
            if executed >= self.recursion_limit {
                tracing::error!(thread_id, limit = self.recursion_limit, "graph_recursion_limit_reached");
                return Err(AgentError::RecursionLimit(self.recursion_limit));
            }

            next = match next {
                NextNode::Chat => {
                    let reply = self.chat(&state).await?;
                    let goto = if reply.has_tool_calls() {
                        NextNode::ToolCall
                    } else {
                        NextNode::End
                    };
                    state.messages.push(reply);
                    goto
                }
                NextNode::ToolCall => {
                    let results = self.tool_call(&state).await?;
                    state.messages.extend(results);
                    state.messages.append(&mut pending_input);
                    NextNode::Chat
                }
                NextNode::End => NextNode::End,
            };

            executed += 1;
            step += 1;
            self.save(thread_id, step, next, &state).await?;
        }

        tracing::info!(thread_id, steps = executed, messages = state.messages.len(), "turn_completed");
        Ok(state)
    }

    /// chat 节点：返回模型回复
    async fn chat(&self, state: &ConversationState) -> Result<Message, AgentError> {
        let system_prompt = self
            .prompt
            .render(&[("long_term_memory", state.long_term_memory.as_str())]);
        let window = prepare_messages(&state.messages, &system_prompt, self.context_window_tokens);

        self.llm.call(&window).await.map_err(|e| {
            tracing::error!(error = %e, "llm_call_node_failed");
            e
        })
    }

    /// tool_call 节点：返回与请求一一对应的工具结果消息
    async fn tool_call(&self, state: &ConversationState) -> Result<Vec<Message>, AgentError> {
        let calls = state.pending_tool_calls();
        tracing::debug!(calls = calls.len(), "tool_call_node");
        self.tools.execute_all(calls).await
    }

    async fn save(
        &self,
        thread_id: &str,
        step: u64,
        next: NextNode,
        state: &ConversationState,
    ) -> Result<(), AgentError> {
        let checkpoint = Checkpoint::new(thread_id, step, next, state.clone());
        self.checkpointer.put(&checkpoint).await.map_err(|e| {
            tracing::error!(thread_id, step, error = %e, "checkpoint_write_failed");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InMemoryCheckpointer;
    use crate::llm::{ModelBackend, ModelRegistry, RetryPolicy, ScriptedLlmClient};
    use crate::memory::{Role, ToolCall};
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        async fn invoke(&self, args: Value) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn graph_with(
        script: Vec<Message>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> (AgentGraph, Arc<ScriptedLlmClient>) {
        let client = Arc::new(ScriptedLlmClient::new(script.into_iter().map(Ok).collect()));
        let registry = ModelRegistry::new(vec![ModelBackend::new("scripted", client.clone())]);
        let tools = ToolRegistry::new().with_tool(Echo);
        let llm = LlmService::new(registry, RetryPolicy::immediate(1))
            .unwrap()
            .bind_tools(tools.specs());
        let prompt = PromptTemplate::new("You are {agent_name}.\n{long_term_memory}", "Test");
        let graph = AgentGraph::new(llm, ToolExecutor::new(tools), prompt, checkpointer);
        (graph, client)
    }

    fn echo_call(id: &str, text: &str) -> ToolCall {
        ToolCall::new(id, "echo", json!({"text": text}))
    }

    #[tokio::test]
    async fn test_two_tool_calls_produce_two_matched_results() {
        let store = Arc::new(InMemoryCheckpointer::new());
        let (graph, _client) = graph_with(
            vec![
                Message::assistant_with_tool_calls("", vec![echo_call("a", "one"), echo_call("b", "two")]),
                Message::assistant("done"),
            ],
            store.clone(),
        );

        let state = graph.invoke("t", &[Message::user("go")], "mem".into()).await.unwrap();
        let tool_msgs: Vec<_> = state.messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_msgs.len(), 2);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("a"));
        assert_eq!(tool_msgs[0].content, "one");
        assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("b"));

        // 输入、chat、tool_call、chat 各一条检查点
        let nexts: Vec<_> = store.history("t").await.unwrap().iter().map(|c| c.next).collect();
        assert_eq!(
            nexts,
            vec![NextNode::Chat, NextNode::ToolCall, NextNode::Chat, NextNode::End]
        );
    }

    #[tokio::test]
    async fn test_system_prompt_carries_memory() {
        let (graph, client) = graph_with(vec![Message::assistant("hi")], Arc::new(InMemoryCheckpointer::new()));
        graph
            .invoke("t", &[Message::user("hello")], "* likes tea".into())
            .await
            .unwrap();

        let requests = client.requests().await;
        assert_eq!(requests[0][0].role, Role::System);
        assert!(requests[0][0].content.contains("You are Test Agent."));
        assert!(requests[0][0].content.contains("* likes tea"));
    }

    #[tokio::test]
    async fn test_recursion_limit() {
        let looping: Vec<Message> = (0..10)
            .map(|i| Message::assistant_with_tool_calls("", vec![echo_call(&format!("c{i}"), "x")]))
            .collect();
        let (graph, _) = graph_with(looping, Arc::new(InMemoryCheckpointer::new()));
        let graph = graph.with_recursion_limit(3);

        let err = graph.invoke("t", &[Message::user("loop")], String::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::RecursionLimit(3)));
    }

    #[tokio::test]
    async fn test_resume_pending_tool_batch() {
        let store = Arc::new(InMemoryCheckpointer::new());
        // 模拟 tool_call 之前崩溃的线程
        let state = ConversationState {
            messages: vec![
                Message::user("go"),
                Message::assistant_with_tool_calls("", vec![echo_call("a", "resumed")]),
            ],
            long_term_memory: String::new(),
        };
        store
            .put(&Checkpoint::new("t", 2, NextNode::ToolCall, state))
            .await
            .unwrap();

        let (graph, client) = graph_with(vec![Message::assistant("finished")], store);
        let state = graph.invoke("t", &[Message::user("go")], String::new()).await.unwrap();

        assert_eq!(client.calls(), 1);
        let roles: Vec<_> = state.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(state.messages[2].content, "resumed");
    }

    #[tokio::test]
    async fn test_completed_turn_is_not_rerun() {
        let store = Arc::new(InMemoryCheckpointer::new());
        let (graph, client) = graph_with(vec![Message::assistant("hello")], store);

        let first = graph.invoke("t", &[Message::user("hi")], String::new()).await.unwrap();
        let second = graph.invoke("t", &[Message::user("hi")], String::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.calls(), 1);
    }
}
