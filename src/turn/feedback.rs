//! 语音反馈文本：工具路径上的确认语与工具执行状态
//!
//! 均为模板，不调用模型；确认语按轮次轮换，结果可复现。

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::tools::{EffectClass, ToolDescriptor, ToolFamily};

pub const DEFAULT_ACKNOWLEDGMENTS: [&str; 7] = [
    "Perfetto, lo faccio subito!",
    "Va bene, un attimo!",
    "Certo, ci penso io!",
    "Subito!",
    "Ci sto lavorando!",
    "Un momento...",
    "Okay, procedo!",
];

/// 确认语轮换器
#[derive(Debug)]
pub struct Acknowledger {
    templates: Vec<String>,
    next: AtomicUsize,
}

impl Acknowledger {
    /// templates 为空时使用内置模板
    pub fn new(templates: Vec<String>) -> Self {
        let templates = if templates.is_empty() {
            DEFAULT_ACKNOWLEDGMENTS.iter().map(|s| s.to_string()).collect()
        } else {
            templates
        };
        Self {
            templates,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> String {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.templates[i % self.templates.len()].clone()
    }
}

impl Default for Acknowledger {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 工具执行中的状态文本；不包含工具名
pub fn tool_status(descriptor: Option<&ToolDescriptor>, args: &Value) -> String {
    let Some(d) = descriptor else {
        return "Ci sto lavorando...".to_string();
    };
    let lower = d.remote_name.to_lowercase();
    match (d.family, d.effect) {
        (ToolFamily::Search, _) => match str_arg(args, "query") {
            Some(q) => format!("Sto cercando '{q}'..."),
            None => "Sto cercando...".to_string(),
        },
        (ToolFamily::Time, _) if lower.contains("convert") => {
            "Sto convertendo il fuso orario...".to_string()
        }
        (ToolFamily::Time, _) => "Controllo l'orario...".to_string(),
        (ToolFamily::DeviceControl, EffectClass::Discovery) | (ToolFamily::Other, EffectClass::Discovery) => {
            match str_arg(args, "area") {
                Some(area) => format!("Controllo i dispositivi in {area}..."),
                None => "Controllo i dispositivi disponibili...".to_string(),
            }
        }
        (ToolFamily::DeviceControl, EffectClass::Action) => {
            let name = str_arg(args, "name");
            if lower.contains("turnon") || lower.contains("turn_on") {
                name.map(|n| format!("Accendo {n}..."))
                    .unwrap_or_else(|| "Sto accendendo...".to_string())
            } else if lower.contains("turnoff") || lower.contains("turn_off") {
                name.map(|n| format!("Spengo {n}..."))
                    .unwrap_or_else(|| "Sto spegnendo...".to_string())
            } else {
                name.map(|n| format!("Regolo {n}..."))
                    .unwrap_or_else(|| "Sto regolando il dispositivo...".to_string())
            }
        }
        (ToolFamily::Other, EffectClass::Action) => "Ci sto lavorando...".to_string(),
    }
}
