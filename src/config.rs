//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGENTSTACK__*` 覆盖（双下划线表示嵌套，如 `AGENTSTACK__LLM__DEFAULT_MODEL=gpt-4o`）。
//! 运行环境由 `APP_ENV` 决定（development / staging / production / test），加载后按环境覆盖日志级别与格式。

use std::path::PathBuf;

use serde::Deserialize;

/// 运行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    /// 解析 APP_ENV；未知值视为 development
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("APP_ENV")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub database: DatabaseSection,
    pub memory: MemorySection,
    pub logging: LoggingSection,
    /// 不从文件读取，由 APP_ENV 决定
    #[serde(skip)]
    pub environment: Environment,
}

/// [app] 段：应用名、版本、系统提示词模板路径、状态机步数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub version: String,
    pub prompt_path: PathBuf,
    /// 单轮对话内节点执行的最大步数
    pub graph_recursion_limit: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "AgentStack".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            prompt_path: PathBuf::from("config/prompts/system.md"),
            graph_recursion_limit: 25,
        }
    }
}

/// [llm] 段：凭证、默认模型、采样参数、重试与降级序列
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 单个后端的最大尝试次数
    pub max_call_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// 发送给模型的消息窗口 token 预算
    pub context_window_tokens: usize,
    /// 降级顺序即列表顺序
    pub models: Vec<ModelEntry>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            max_call_retries: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 10_000,
            context_window_tokens: 2000,
            models: default_models(),
        }
    }
}

impl LlmSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [[llm.models]]：一个后端。未设置的 temperature / max_tokens 沿用 [llm] 段
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

impl ModelEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperature: None,
            max_tokens: None,
            reasoning_effort: None,
        }
    }
}

fn default_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            reasoning_effort: Some("low".to_string()),
            ..ModelEntry::named("gpt-5-mini")
        },
        ModelEntry::named("gpt-4o"),
        ModelEntry::named("gpt-4o-mini"),
    ]
}

/// [database] 段：SQLite 连接串与连接池大小（检查点、用户/会话、记忆共用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub pool_size: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite://data/agentstack.db".to_string(),
            pool_size: 20,
        }
    }
}

/// [memory] 段：长期记忆检索参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub embedding_model: String,
    pub search_limit: usize,
    /// 向量检索的最低余弦相似度
    pub min_score: f32,
    pub max_facts_per_user: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            embedding_model: "text-embedding-3-small".to_string(),
            search_limit: 5,
            min_score: 0.3,
            max_facts_per_user: 500,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

impl LoggingSection {
    /// 按环境得出最终 (level, format)：development 固定 debug/console，production 固定 warn/json
    pub fn resolve(&self, env: Environment) -> (String, LogFormat) {
        match env {
            Environment::Development => ("debug".to_string(), LogFormat::Console),
            Environment::Production => ("warn".to_string(), LogFormat::Json),
            Environment::Staging | Environment::Test => (
                self.level.clone().unwrap_or_else(|| "info".to_string()),
                self.format.unwrap_or_default(),
            ),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AGENTSTACK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGENTSTACK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGENTSTACK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    cfg.environment = Environment::from_env();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse("Production"), Environment::Production);
        assert_eq!(Environment::parse("stage"), Environment::Staging);
        assert_eq!(Environment::parse("test"), Environment::Test);
        assert_eq!(Environment::parse("whatever"), Environment::Development);
    }

    #[test]
    fn test_default_model_ranking() {
        let cfg = AppConfig::default();
        let names: Vec<_> = cfg.llm.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-5-mini", "gpt-4o", "gpt-4o-mini"]);
        assert_eq!(cfg.llm.max_call_retries, 3);
        assert_eq!(cfg.llm.retry_base_delay_ms, 2000);
        assert_eq!(cfg.llm.retry_max_delay_ms, 10_000);
        assert_eq!(cfg.app.graph_recursion_limit, 25);
    }

    #[test]
    fn test_logging_resolve_by_environment() {
        let section = LoggingSection {
            level: Some("error".to_string()),
            format: Some(LogFormat::Json),
        };
        assert_eq!(
            section.resolve(Environment::Development),
            ("debug".to_string(), LogFormat::Console)
        );
        assert_eq!(
            section.resolve(Environment::Production),
            ("warn".to_string(), LogFormat::Json)
        );
        assert_eq!(
            section.resolve(Environment::Staging),
            ("error".to_string(), LogFormat::Json)
        );
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[llm]
default_model = "gpt-4o"
max_call_retries = 5

[[llm.models]]
name = "primary"

[[llm.models]]
name = "secondary"
temperature = 0.7
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.default_model, "gpt-4o");
        assert_eq!(cfg.llm.max_call_retries, 5);
        assert_eq!(cfg.llm.models.len(), 2);
        assert_eq!(cfg.llm.models[1].temperature, Some(0.7));
        // 未出现的段落保持默认
        assert_eq!(cfg.memory.search_limit, 5);
    }
}
