//! 可观测性：tracing 订阅器初始化
//!
//! 日志事件名使用 snake_case（如 `switching_model_fallback`），附带结构化字段。
//! 级别与格式由 [logging] 段和运行环境共同决定，RUST_LOG 优先。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Environment, LogFormat, LoggingSection};

/// 计算过滤规则：RUST_LOG 存在时优先，否则使用解析出的级别
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器并返回携带 `environment` 字段的根 span
///
/// 重复调用（例如测试中）不会报错，后续调用只返回新的根 span。
pub fn init_logging(section: &LoggingSection, env: Environment) -> tracing::Span {
    let (level, format) = section.resolve(env);
    let filter = build_filter(&level);

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Console => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(level = %level, environment = env.as_str(), "logging_initialized");
    }

    tracing::info_span!("agentstack", environment = env.as_str())
}
