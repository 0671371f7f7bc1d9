//! 工具调用相关的数据类型
//!
//! ToolCall 由 Model Client 产出，之后只读；ToolResult 由 ToolDispatcher 产出，
//! 每个 ToolCall 对应恰好一个 ToolResult（步骤完整时）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ToolError, ToolExecutionError};

/// 工具参数：名称 -> JSON 值
pub type ToolArguments = serde_json::Map<String, Value>;

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => ToolArguments::new(),
            other => {
                let mut map = ToolArguments::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 一次工具调用的结果：output 与 error 二选一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: Some(output.into()),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(call: &ToolCall, error: ToolError, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: None,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 写回对话时使用的文本（错误以 "Error: " 前缀呈现给模型）
    pub fn to_observation(&self) -> String {
        match (&self.output, &self.error) {
            (_, Some(e)) => format!("Error: {}", e),
            (Some(out), None) => out.clone(),
            (None, None) => String::new(),
        }
    }
}

/// 提供给模型的工具描述（name / description / 参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 取必填字符串参数
pub fn required_str<'a>(args: &'a ToolArguments, key: &str) -> Result<&'a str, ToolExecutionError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolExecutionError::InvalidArguments(format!("missing string field `{key}`")))
}

/// 取可选字符串参数
pub fn optional_str<'a>(args: &'a ToolArguments, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_wraps_non_object_arguments() {
        let call = ToolCall::new("c1", "bash", json!("ls"));
        assert_eq!(call.arguments.get("value"), Some(&json!("ls")));

        let call = ToolCall::new("c2", "task_done", Value::Null);
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn test_observation_prefers_error() {
        let call = ToolCall::new("c1", "read_file", json!({"path": "a.txt"}));
        let ok = ToolResult::success(&call, "hello", 3);
        assert_eq!(ok.to_observation(), "hello");
        assert!(!ok.is_error());

        let err = ToolResult::failure(&call, ToolError::Timeout, 120_000);
        assert!(err.to_observation().starts_with("Error: "));
        assert!(err.is_error());
    }

    #[test]
    fn test_required_str() {
        let call = ToolCall::new("c1", "read_file", json!({"path": "a.rs", "n": 3}));
        assert_eq!(required_str(&call.arguments, "path").unwrap(), "a.rs");
        assert!(matches!(
            required_str(&call.arguments, "n"),
            Err(ToolExecutionError::InvalidArguments(_))
        ));
        assert_eq!(optional_str(&call.arguments, "missing"), None);
    }
}
