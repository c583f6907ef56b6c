//! 系统提示词模板
//!
//! 模板为 Markdown 文件，`{name}` 形式的占位符在渲染时替换。agent_name 与 current_date_and_time
//! 总是提供；其余变量（如 long_term_memory）由调用方传入。未知占位符原样保留。

use std::path::Path;

/// 系统提示词模板
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    agent_name: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>, app_name: &str) -> Self {
        Self {
            template: template.into(),
            agent_name: format!("{} Agent", app_name),
        }
    }

    /// 从文件加载；文件缺失或不可读返回 AgentError::Prompt
    pub fn load(path: impl AsRef<Path>, app_name: &str) -> Result<Self, crate::core::AgentError> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| {
            crate::core::AgentError::Prompt(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self::new(template, app_name))
    }

    /// 渲染模板
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut out = self
            .template
            .replace("{agent_name}", &self.agent_name)
            .replace("{current_date_and_time}", &now);
        for (name, value) in vars {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_render_builtin_and_custom_vars() {
        let prompt = PromptTemplate::new(
            "You are {agent_name}. Now: {current_date_and_time}.\nMemory:\n{long_term_memory}\n{unknown}",
            "AgentStack",
        );
        let out = prompt.render(&[("long_term_memory", "* likes tea")]);
        assert!(out.starts_with("You are AgentStack Agent."));
        assert!(out.contains("* likes tea"));
        assert!(out.contains("{unknown}"));
        assert!(!out.contains("{current_date_and_time}"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PromptTemplate::load("/definitely/missing/system.md", "X").unwrap_err();
        assert!(matches!(err, crate::core::AgentError::Prompt(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Hello from {{agent_name}}").unwrap();
        let prompt = PromptTemplate::load(file.path(), "Demo").unwrap();
        assert_eq!(prompt.render(&[]), "Hello from Demo Agent");
    }
}
