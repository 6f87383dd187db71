//! 时钟工具：当前时间（可选 UTC 偏移）

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{json, Value};

use crate::tools::{EffectClass, Tool};

pub struct CurrentTimeTool;

/// 解析 "+02:00" / "-0530" / "UTC" 形式的偏移
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
    let (h, m) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if h > 14 || m > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optional utc_offset like \"+02:00\"."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset": {"type": "string", "description": "Offset from UTC, e.g. +02:00"}
            },
            "required": []
        })
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Discovery
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let raw = args.get("utc_offset").and_then(Value::as_str).unwrap_or("UTC");
        let offset = parse_offset(raw).ok_or_else(|| format!("invalid utc_offset: {raw}"))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "datetime": now.to_rfc3339(),
            "time": now.format("%H:%M").to_string(),
            "date": now.format("%Y-%m-%d").to_string(),
            "weekday": now.format("%A").to_string(),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("-0530"), FixedOffset::east_opt(-19800));
        assert_eq!(parse_offset("+99"), None);
        assert_eq!(parse_offset("Rome"), None);
    }

    #[tokio::test]
    async fn test_current_time_payload() {
        let out = CurrentTimeTool.execute(json!({"utc_offset": "+01:00"})).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["datetime"].as_str().unwrap().ends_with("+01:00"));
        assert!(CurrentTimeTool.execute(json!({"utc_offset": "x"})).await.is_err());
    }
}
