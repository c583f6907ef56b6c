//! 工具参数 JSON Schema 生成（schemars）
//!
//! 由参数结构体派生 JsonSchema，转为模型可接受的 function parameters 对象。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 生成 T 的参数 schema，去掉 $schema / title 等顶层元信息
pub fn parameters_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 搜索词
        query: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_parameters_for_struct() {
        let schema = parameters_for::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["query"].is_object());
        assert_eq!(schema["required"], serde_json::json!(["query"]));
        assert!(schema.get("$schema").is_none());
    }
}
