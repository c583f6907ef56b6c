//! 工具层：Tool trait、静态注册表、执行器（审计日志）与内置的 DuckDuckGo 搜索

pub mod executor;
pub mod registry;
pub mod schema;
pub mod search;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::parameters_for;
pub use search::{DuckDuckGoSearchTool, SearchArgs, SearchHit};
