//! 工具执行器
//!
//! 将已通过校验的调用派发到所属服务器，每次调用施加超时；成功取载荷，失败转为归一化错误文本。
//! 执行器本身不重试。同批次中互不依赖的调用并发执行（受 max_in_flight 限制），结果按派发顺序返回；
//! 声明了依赖的调用等待依赖完成，依赖失败则不派发。每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, TaskScheduler};
use crate::tools::server::ServerError;
use crate::tools::{Rejection, ToolCall, ToolRegistry, ToolResult};

pub struct ToolExecutor {
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            timeout,
            scheduler: TaskScheduler::new(max_in_flight),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 派发一批调用；返回与 calls 一一对应、顺序一致的结果
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        registry: &ToolRegistry,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let position = |id: &str| calls.iter().position(|c| c.id == id);

        loop {
            let pending: Vec<usize> = (0..calls.len()).filter(|&i| results[i].is_none()).collect();
            if pending.is_empty() {
                break;
            }

            let mut wave = Vec::new();
            for &i in &pending {
                let deps: Vec<usize> = calls[i]
                    .depends_on
                    .iter()
                    .filter_map(|d| position(d))
                    .filter(|&j| j != i)
                    .collect();
                if deps.iter().any(|&j| results[j].is_none()) {
                    continue;
                }
                let failed_dep = deps
                    .iter()
                    .find(|&&j| results[j].as_ref().is_some_and(|r| !r.success));
                match failed_dep {
                    Some(&j) => {
                        let err = AgentError::DependencyFailed {
                            tool: calls[i].tool.clone(),
                            dependency: calls[j].tool.clone(),
                        };
                        tracing::warn!(tool = %calls[i].tool, dependency = %calls[j].tool, "dependency failed, not dispatching");
                        results[i] = Some(ToolResult::failed(&calls[i], err));
                    }
                    None => wave.push(i),
                }
            }

            if wave.is_empty() {
                // 依赖成环：剩余调用全部判失败
                if pending.iter().all(|&i| results[i].is_none()) {
                    for &i in &pending {
                        let err = AgentError::DependencyFailed {
                            tool: calls[i].tool.clone(),
                            dependency: calls[i].depends_on.join(","),
                        };
                        results[i] = Some(ToolResult::failed(&calls[i], err));
                    }
                }
                continue;
            }

            let outcomes = join_all(
                wave.iter()
                    .map(|&i| self.execute_one(&calls[i], registry, cancel)),
            )
            .await;
            for (i, outcome) in wave.into_iter().zip(outcomes) {
                results[i] = Some(outcome);
            }
        }

        results
            .into_iter()
            .zip(calls)
            .map(|(r, call)| r.unwrap_or_else(|| ToolResult::failed(call, AgentError::Cancelled)))
            .collect()
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let start = Instant::now();
        let outcome = self.invoke(call, registry, cancel).await;

        let (ok, label) = match &outcome {
            Ok(_) => (true, "ok"),
            Err(AgentError::ToolTimeout { .. }) => (false, "timeout"),
            Err(AgentError::Cancelled) => (false, "cancelled"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "turn_id": call.turn_id,
            "call_id": call.id,
            "tool": call.tool,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(content) => ToolResult::ok(call, content),
            Err(e) => ToolResult::failed(call, e),
        }
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let descriptor = registry
            .get(&call.tool)
            .ok_or_else(|| AgentError::Rejected(Rejection::UnknownTool(call.tool.clone())))?;
        let server = registry
            .server_for(descriptor)
            .ok_or_else(|| AgentError::ToolServerUnreachable {
                server: descriptor.origin.clone(),
                reason: "server no longer registered".into(),
            })?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            permit = self.scheduler.acquire_tool() => permit,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            res = timeout(self.timeout, server.invoke(&descriptor.remote_name, &call.arguments)) => match res {
                Ok(Ok(content)) => Ok(content),
                Ok(Err(ServerError::Unreachable(reason))) => Err(AgentError::ToolServerUnreachable {
                    server: descriptor.origin.clone(),
                    reason,
                }),
                Ok(Err(ServerError::Execution { message, transient })) => {
                    Err(AgentError::ToolExecutionError { message, transient })
                }
                Ok(Err(ServerError::Protocol(message))) => Err(AgentError::ToolExecutionError {
                    message,
                    transient: false,
                }),
                Err(_) => Err(AgentError::ToolTimeout {
                    tool: call.tool.clone(),
                    after_ms: self.timeout.as_millis() as u64,
                }),
            },
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
