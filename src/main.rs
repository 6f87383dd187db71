//! Duet - 语音陪伴助手编排核心
//!
//! 入口：初始化日志、加载配置、创建会话，从标准输入逐行读取转写文本并打印叙述与过程事件。
//! 以 `/` 开头的行是控制命令：/interrupt <已播出文本>、/clear、/tools、/quit。

use std::path::PathBuf;

use anyhow::Context;
use duet::config::load_config;
use duet::core::{build_session, spawn_session, Command, SessionOutput};
use duet::observability;
use duet::turn::TurnEventKind;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let session = build_session(&config).await.context("Failed to create session")?;
    let mut handle = spawn_session(session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    handle.disconnect();
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let command = match line.split_once(' ').unwrap_or((line, "")) {
                    ("/quit", _) => {
                        handle.disconnect();
                        break;
                    }
                    ("/interrupt", heard) => Command::Interrupt { heard: heard.to_string() },
                    ("/clear", _) => Command::Clear,
                    ("/tools", _) => Command::RefreshTools,
                    _ => Command::Submit(line.into()),
                };
                handle.send(command);
            }
            Some(event) = handle.events.recv() => match event.kind {
                TurnEventKind::Acknowledgment { text } | TurnEventKind::ToolStatus { text } => println!("  ({text})"),
                TurnEventKind::NarrationChunk { .. } | TurnEventKind::NarrationDone => {}
                _ => tracing::debug!(event = ?event, "turn event"),
            },
            Some(output) = handle.outputs.recv() => print_output(output),
            _ = tokio::signal::ctrl_c() => {
                handle.disconnect();
                break;
            }
        }
    }

    while let Some(output) = handle.outputs.recv().await {
        print_output(output);
    }
    Ok(())
}

fn print_output(output: SessionOutput) {
    match output {
        SessionOutput::Outcome(outcome) => {
            if let Some(text) = outcome.text() {
                println!("duet> {text}");
            }
        }
        SessionOutput::Error { message } => eprintln!("error: {message}"),
        SessionOutput::Cleared => println!("(conversation cleared)"),
        SessionOutput::ToolsRefreshed(report) => {
            println!("({} tools, {} servers degraded)", report.tool_count, report.degraded.len())
        }
        SessionOutput::Closed(stats) => println!("(session closed: {stats:?})"),
    }
}
