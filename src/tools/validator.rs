//! 工具调用校验
//!
//! 纯函数：派发前检查调用是否指向已注册工具、必填参数是否齐全且类型正确，以及跨类别的启发式不匹配
//! （例如把时间值当作设备名传给设备控制工具）。从不修改调用；失败时返回带提示的 Rejection。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::tools::{ToolCall, ToolDescriptor, ToolFamily, ToolRegistry};

/// 校验失败原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("arguments for '{tool}' are not a JSON object")]
    MalformedArguments { tool: String },

    #[error("'{tool}' requires parameter '{param}'")]
    MissingParameter { tool: String, param: String },

    #[error("'{tool}' parameter '{param}' should be {expected}, got {found}")]
    TypeMismatch {
        tool: String,
        param: String,
        expected: String,
        found: String,
    },

    #[error("'{tool}' parameter '{param}' looks wrong: {detail}")]
    CrossFamilyMismatch {
        tool: String,
        param: String,
        detail: String,
    },
}

impl Rejection {
    /// 写回给 Broker / Responder 的纠正提示
    pub fn hint(&self) -> String {
        match self {
            Rejection::UnknownTool(tool) => format!(
                "'{tool}' is not an available tool. Use only the listed tools; \
                 if you need an identifier you do not know, call the discovery tool first."
            ),
            Rejection::MalformedArguments { tool } => {
                format!("Call '{tool}' again with arguments as a JSON object.")
            }
            Rejection::MissingParameter { tool, param } => format!(
                "'{tool}' needs '{param}'. If you do not know the exact value, \
                 call the discovery tool first and copy it from the result."
            ),
            Rejection::TypeMismatch {
                tool,
                param,
                expected,
                ..
            } => format!("Pass '{param}' to '{tool}' as {expected}."),
            Rejection::CrossFamilyMismatch { tool, param, .. } => format!(
                "'{param}' for '{tool}' must be a device name, not a time. \
                 Call the discovery tool first to get the exact device name."
            ),
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            Rejection::UnknownTool(tool)
            | Rejection::MalformedArguments { tool }
            | Rejection::MissingParameter { tool, .. }
            | Rejection::TypeMismatch { tool, .. }
            | Rejection::CrossFamilyMismatch { tool, .. } => tool,
        }
    }
}

/// 设备控制工具中表示「目标设备」的参数名
const DEVICE_TARGET_PARAMS: [&str; 6] = ["name", "entity_id", "entity", "device", "device_name", "area"];

fn time_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?ix)
                ^\d{1,2}:\d{2}(:\d{2})?(\s*(am|pm))?$
                | ^\d{4}-\d{2}-\d{2}([t\s]\d{2}:\d{2}.*)?$
                | ^(now|today|tomorrow|tonight|adesso|oggi|domani|stasera)$
                | \b(o'clock|in\s+\d+\s+(minutes?|hours?|minuti|ore))\b
                ",
            )
            .ok()
        })
        .as_ref()
}

/// 是否像时间/日期值
pub fn looks_time_shaped(value: &str) -> bool {
    time_pattern().is_some_and(|re| re.is_match(value.trim()))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// 校验一次调用；PASS 当且仅当工具存在、必填参数齐全且类型正确、无跨类别不匹配
pub fn validate(call: &ToolCall, registry: &ToolRegistry) -> Result<(), Rejection> {
    let descriptor = registry
        .get(&call.tool)
        .ok_or_else(|| Rejection::UnknownTool(call.tool.clone()))?;
    validate_against(call, descriptor)
}

/// 针对已知描述校验
pub fn validate_against(call: &ToolCall, descriptor: &ToolDescriptor) -> Result<(), Rejection> {
    let tool = descriptor.name.clone();
    let empty = serde_json::Map::new();
    let args = match &call.arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(Rejection::MalformedArguments { tool }),
    };

    for param in descriptor.required_params() {
        let missing = match args.get(param) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if missing {
            return Err(Rejection::MissingParameter {
                tool,
                param: param.to_string(),
            });
        }
    }

    for (param, value) in args {
        if value.is_null() {
            continue;
        }
        if let Some(expected) = descriptor.param_type(param) {
            if !type_matches(expected, value) {
                return Err(Rejection::TypeMismatch {
                    tool,
                    param: param.clone(),
                    expected: expected.to_string(),
                    found: json_type(value).to_string(),
                });
            }
        }
    }

    match descriptor.family {
        ToolFamily::DeviceControl => {
            for param in DEVICE_TARGET_PARAMS {
                if let Some(s) = args.get(param).and_then(Value::as_str) {
                    if looks_time_shaped(s) {
                        return Err(Rejection::CrossFamilyMismatch {
                            tool,
                            param: param.to_string(),
                            detail: format!("'{s}' is a time, not a device"),
                        });
                    }
                }
            }
        }
        ToolFamily::Search => {
            if let Some(q) = args.get("query").and_then(Value::as_str) {
                if looks_time_shaped(q) {
                    tracing::warn!(tool = %descriptor.name, query = %q, "search query looks like a bare time value");
                }
            }
        }
        ToolFamily::Time | ToolFamily::Other => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EffectClass;
    use serde_json::json;

    fn turn_off() -> ToolDescriptor {
        ToolDescriptor {
            name: "HassTurnOff".into(),
            remote_name: "HassTurnOff".into(),
            origin: "home".into(),
            description: "Turns off a device".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "brightness": {"type": "integer"}
                },
                "required": ["name"]
            }),
            effect: EffectClass::Action,
            family: ToolFamily::DeviceControl,
        }
    }

    fn call(args: Value) -> ToolCall {
        ToolCall::new("t1", "HassTurnOff", args)
    }

    #[test]
    fn test_pass_with_required_present() {
        assert!(validate_against(&call(json!({"name": "Speaker"})), &turn_off()).is_ok());
    }

    #[test]
    fn test_missing_and_empty_required() {
        let d = turn_off();
        assert!(matches!(
            validate_against(&call(json!({})), &d),
            Err(Rejection::MissingParameter { ref param, .. }) if param == "name"
        ));
        assert!(matches!(
            validate_against(&call(json!({"name": "  "})), &d),
            Err(Rejection::MissingParameter { .. })
        ));
        assert!(matches!(
            validate_against(&call(Value::Null), &d),
            Err(Rejection::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate_against(
            &call(json!({"name": "Speaker", "brightness": "high"})),
            &turn_off(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Rejection::TypeMismatch {
                tool: "HassTurnOff".into(),
                param: "brightness".into(),
                expected: "integer".into(),
                found: "string".into(),
            }
        );
    }

    #[test]
    fn test_malformed_arguments() {
        assert!(matches!(
            validate_against(&call(json!("Speaker")), &turn_off()),
            Err(Rejection::MalformedArguments { .. })
        ));
    }

    #[test]
    fn test_time_passed_as_device_name() {
        let err = validate_against(&call(json!({"name": "22:30"})), &turn_off()).unwrap_err();
        assert!(matches!(err, Rejection::CrossFamilyMismatch { .. }));
        assert!(err.hint().contains("discovery tool"));
    }

    #[test]
    fn test_time_shapes() {
        assert!(looks_time_shaped("7:05"));
        assert!(looks_time_shaped("2024-05-01T10:00:00Z"));
        assert!(looks_time_shaped("domani"));
        assert!(!looks_time_shaped("Living Room Speaker"));
        assert!(!looks_time_shaped("light.kitchen"));
    }

    #[test]
    fn test_validation_never_mutates_call() {
        let c = call(json!({"name": ""}));
        let before = c.clone();
        let _ = validate_against(&c, &turn_off());
        assert_eq!(c, before);
    }
}
