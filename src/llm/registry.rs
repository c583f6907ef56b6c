//! 模型注册表
//!
//! 按配置顺序保存后端（名称、客户端、调用参数）。顺序即降级顺序；
//! 起始下标为 default_model 所在位置（不在列表中则为 0）。

use std::sync::Arc;

use crate::config::LlmSection;
use crate::llm::{LlmClient, ModelParams};

/// 单个后端：模型名 + 客户端 + 该模型的调用参数
#[derive(Clone)]
pub struct ModelBackend {
    pub name: String,
    pub client: Arc<dyn LlmClient>,
    pub params: ModelParams,
}

impl std::fmt::Debug for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBackend")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

impl ModelBackend {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        let name = name.into();
        Self {
            params: ModelParams::new(name.clone()),
            name,
            client,
        }
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }
}

/// 有序后端列表
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    backends: Vec<ModelBackend>,
    default_index: usize,
}

impl ModelRegistry {
    pub fn new(backends: Vec<ModelBackend>) -> Self {
        Self {
            backends,
            default_index: 0,
        }
    }

    /// 按 [llm].models 建表，所有后端共用同一客户端；推理模型不下发 temperature
    pub fn from_config(section: &LlmSection, client: Arc<dyn LlmClient>) -> Self {
        let backends = section
            .models
            .iter()
            .map(|entry| {
                let temperature = if entry.reasoning_effort.is_some() {
                    None
                } else {
                    Some(entry.temperature.unwrap_or(section.temperature))
                };
                let params = ModelParams {
                    model: entry.name.clone(),
                    temperature,
                    max_tokens: Some(entry.max_tokens.unwrap_or(section.max_tokens)),
                    reasoning_effort: entry.reasoning_effort.clone(),
                };
                ModelBackend::new(entry.name.clone(), client.clone()).with_params(params)
            })
            .collect();
        Self::new(backends).with_default(&section.default_model)
    }

    /// 设定起始后端；名称不存在时保持 0
    pub fn with_default(mut self, name: &str) -> Self {
        self.default_index = self.index_of(name).unwrap_or(0);
        self
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&ModelBackend> {
        self.backends.get(index)
    }

    /// 按名称取后端；未知名称返回第一个
    pub fn get_by_name(&self, name: &str) -> Option<&ModelBackend> {
        self.index_of(name)
            .and_then(|i| self.backends.get(i))
            .or_else(|| self.backends.first())
    }

    pub fn default_index(&self) -> usize {
        self.default_index
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_from_config_keeps_order_and_default_index() {
        let section = LlmSection::default();
        let registry = ModelRegistry::from_config(&section, Arc::new(MockLlmClient));

        assert_eq!(registry.names(), vec!["gpt-5-mini", "gpt-4o", "gpt-4o-mini"]);
        // default_model = gpt-4o-mini
        assert_eq!(registry.default_index(), 2);
    }

    #[test]
    fn test_reasoning_model_drops_temperature() {
        let section = LlmSection::default();
        let registry = ModelRegistry::from_config(&section, Arc::new(MockLlmClient));

        let reasoning = registry.get(0).unwrap();
        assert_eq!(reasoning.params.temperature, None);
        assert_eq!(reasoning.params.reasoning_effort.as_deref(), Some("low"));
        assert_eq!(reasoning.params.max_tokens, Some(2000));

        let chat = registry.get(1).unwrap();
        assert_eq!(chat.params.temperature, Some(0.2));
    }

    #[test]
    fn test_unknown_default_falls_back_to_first() {
        let registry = ModelRegistry::new(vec![
            ModelBackend::new("a", Arc::new(MockLlmClient)),
            ModelBackend::new("b", Arc::new(MockLlmClient)),
        ])
        .with_default("missing");
        assert_eq!(registry.default_index(), 0);
        assert_eq!(registry.get_by_name("b").unwrap().name, "b");
        assert_eq!(registry.get_by_name("nope").unwrap().name, "a");
    }
}
