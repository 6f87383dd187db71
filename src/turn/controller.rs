//! 续接控制器（单轮状态机）
//!
//! IDLE → DISPATCHED → {SETTLED, AWAITING_FOLLOWUP} → DONE，内含 RETRY 子循环。
//! - 本批只有一个发现类调用、没有动作调用、执行成功且同来源有可用的动作工具时进入 AWAITING_FOLLOWUP：把发现结果与续接指令写回
//!   上下文，重新调用 Broker；每轮最多 max_followups 跳。
//! - 续接没有产出调用：软完成，只带发现结果结束，不伪造成功。
//! - 可重试的失败且预算未用完：重新派发失败的调用（错误原因随 Retry 事件发出）；依赖失败的调用只随其依赖一起重派。
//!   否则带错误结束。结束状态取自本批最后一条记录。
//! - 校验未通过的调用直接变成失败结果，从不派发。
//!
//! DONE 时按派发顺序汇总所有跳的 (ToolCall, ToolResult)，最后一条即最终可叙述的结果。

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryEngine};
use crate::memory::Turn;
use crate::tools::{validate, EffectClass, ToolCall, ToolDescriptor, ToolExecutor, ToolRegistry, ToolResult};
use crate::turn::broker::{followup_directive, ToolBroker};
use crate::turn::events::{EventSink, TurnEventKind};
use crate::turn::feedback::tool_status;

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;
/// 退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Dispatched,
    Retrying,
    AwaitingFollowup,
    Settled,
    Done,
}

/// 每轮预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnPolicy {
    pub max_followups: usize,
    pub max_retries: u32,
    /// 第 n 次重试前等待 min(base * 2^(n-1), 5s)
    pub retry_backoff: Duration,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_followups: 1,
            max_retries: 1,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl TurnPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// 剩余预算；重试与续接各自计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub followups_left: usize,
    pub retries_left: u32,
}

impl RetryBudget {
    pub fn from_policy(policy: &TurnPolicy) -> Self {
        Self {
            followups_left: policy.max_followups,
            retries_left: policy.max_retries,
        }
    }

    fn take_retry(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            true
        } else {
            false
        }
    }

    fn take_followup(&mut self) -> bool {
        if self.followups_left > 0 {
            self.followups_left -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub call: ToolCall,
    pub result: ToolResult,
    /// 0 为首跳，1 为续接跳
    pub hop: usize,
    /// 发现类（只读）调用
    pub discovery: bool,
}

/// 结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// 最终结果成功
    Complete,
    /// Broker 判断不需要工具
    NoToolCalls,
    /// 续接没有产出调用，只有发现结果
    FollowupExhausted,
    /// 最终一批存在失败（校验、执行、Broker 错误）
    Failed(AgentError),
    Cancelled,
}

/// 一轮的汇总
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    pub records: Vec<CallRecord>,
    pub completion: Completion,
    pub hops: usize,
    pub retries_used: u32,
    pub states: Vec<TurnState>,
}

impl TurnReport {
    /// 最终可叙述的结果（最后一条）
    pub fn final_record(&self) -> Option<&CallRecord> {
        self.records.last()
    }

    pub fn followup_happened(&self) -> bool {
        self.records.iter().any(|r| r.hop > 0)
    }

    pub fn any_failed(&self) -> bool {
        self.records.iter().any(|r| !r.result.success)
    }
}

/// 单轮所需的协作者
pub struct TurnContext<'a> {
    pub turn_id: &'a str,
    pub original_request: &'a str,
    /// 最近对话（含本轮用户输入）
    pub window: &'a [Turn],
    /// 本轮可用工具（可能已按意图收窄）
    pub tools: &'a [ToolDescriptor],
    pub registry: &'a ToolRegistry,
    pub broker: &'a ToolBroker,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub events: &'a EventSink,
    pub cancel: &'a CancellationToken,
}

pub struct ContinuationController {
    policy: TurnPolicy,
    budget: RetryBudget,
    states: Vec<TurnState>,
    scratch: Vec<Turn>,
    retries_used: u32,
}

impl ContinuationController {
    pub fn new(policy: TurnPolicy) -> Self {
        Self {
            policy,
            budget: RetryBudget::from_policy(&policy),
            states: vec![TurnState::Idle],
            scratch: Vec::new(),
            retries_used: 0,
        }
    }

    fn enter(&mut self, state: TurnState) {
        tracing::debug!(?state, "turn state");
        self.states.push(state);
    }

    /// 运行整轮，直到 DONE
    pub async fn run(mut self, ctx: TurnContext<'_>) -> TurnReport {
        let mut records: Vec<CallRecord> = Vec::new();
        let mut hop = 0usize;

        let completion = match self.propose(&ctx).await {
            Err(e) => Self::failure_completion(e),
            Ok(calls) if calls.is_empty() => Completion::NoToolCalls,
            Ok(mut calls) => loop {
                self.enter(TurnState::Dispatched);
                let batch = self.execute_batch(&ctx, calls, hop).await;
                let start = records.len();
                records.extend(batch);
                let batch_records = &records[start..];

                if ctx.cancel.is_cancelled() {
                    break Completion::Cancelled;
                }

                // 只有本轮工具中存在同来源的动作工具时才续接（时间、搜索查询到发现即结束）
                let awaiting = batch_records.len() == 1
                    && batch_records[0].result.success
                    && batch_records[0].discovery
                    && has_followup_action(&ctx, &batch_records[0].call);

                if !awaiting || !self.budget.take_followup() {
                    self.enter(TurnState::Settled);
                    // 以最后一条记录为准；前面的失败只作为叙述中的步骤
                    break match batch_records.last().and_then(|r| r.result.failure.clone()) {
                        Some(AgentError::Cancelled) => Completion::Cancelled,
                        Some(err) => Completion::Failed(err),
                        None => Completion::Complete,
                    };
                }

                self.enter(TurnState::AwaitingFollowup);
                let discovery = &batch_records[0];
                self.scratch.push(Turn::assistant(format!(
                    "Tool call: {} | Result: {}",
                    discovery.call.tool, discovery.result.content
                )));
                self.scratch.push(Turn::user(format!(
                    "Observation from {}: {}\n\n{}",
                    discovery.call.tool,
                    discovery.result.content,
                    followup_directive(ctx.original_request)
                )));
                hop += 1;

                match self.propose(&ctx).await {
                    Ok(next) if !next.is_empty() => calls = next,
                    Ok(_) => {
                        tracing::warn!(turn_id = ctx.turn_id, "follow-up produced no tool calls, completing with discovery result");
                        ctx.events.send(
                            ctx.turn_id,
                            TurnEventKind::FollowupWarning {
                                detail: AgentError::FollowupExhausted.to_string(),
                            },
                        );
                        self.enter(TurnState::Settled);
                        break Completion::FollowupExhausted;
                    }
                    Err(AgentError::Cancelled) => break Completion::Cancelled,
                    Err(e) => {
                        tracing::warn!(turn_id = ctx.turn_id, error = %e, "follow-up proposal failed");
                        ctx.events.send(
                            ctx.turn_id,
                            TurnEventKind::FollowupWarning {
                                detail: e.to_string(),
                            },
                        );
                        self.enter(TurnState::Settled);
                        break Completion::FollowupExhausted;
                    }
                }
            },
        };

        self.enter(TurnState::Done);
        tracing::info!(
            turn_id = ctx.turn_id,
            hops = hop,
            calls = records.len(),
            retries = self.retries_used,
            completion = ?completion,
            "turn settled"
        );
        TurnReport {
            turn_id: ctx.turn_id.to_string(),
            records,
            completion,
            hops: hop,
            retries_used: self.retries_used,
            states: self.states,
        }
    }

    fn failure_completion(e: AgentError) -> Completion {
        match e {
            AgentError::Cancelled => Completion::Cancelled,
            other => Completion::Failed(other),
        }
    }

    /// 调用 Broker；可重试的模型错误（超时、网络）消耗重试预算
    async fn propose(&mut self, ctx: &TurnContext<'_>) -> Result<Vec<ToolCall>, AgentError> {
        let mut attempt = 1u32;
        loop {
            let proposed = ctx
                .broker
                .propose(ctx.turn_id, ctx.window, &self.scratch, ctx.tools, ctx.cancel)
                .await;
            match proposed {
                Ok(calls) => return Ok(calls),
                Err(e) if ctx.recovery.is_retryable(&e) && self.budget.take_retry() => {
                    self.retries_used += 1;
                    tracing::warn!(turn_id = ctx.turn_id, error = %e, attempt, "broker failed, retrying");
                    ctx.events.send(
                        ctx.turn_id,
                        TurnEventKind::Retry {
                            attempt: attempt + 1,
                            reason: e.to_string(),
                        },
                    );
                    self.sleep_backoff(attempt, ctx.cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sleep_backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        let wait = self.policy.backoff(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// 校验 → 派发 → 重试子循环；返回与 calls 同序的记录
    async fn execute_batch(
        &mut self,
        ctx: &TurnContext<'_>,
        calls: Vec<ToolCall>,
        hop: usize,
    ) -> Vec<CallRecord> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut rejected: HashSet<String> = HashSet::new();

        for (i, call) in calls.iter().enumerate() {
            if let Err(rejection) = validate(call, ctx.registry) {
                tracing::warn!(turn_id = ctx.turn_id, tool = %call.tool, reason = %rejection, "call rejected");
                ctx.events.send(
                    ctx.turn_id,
                    TurnEventKind::Rejected {
                        tool: call.tool.clone(),
                        reason: rejection.to_string(),
                    },
                );
                rejected.insert(call.id.clone());
                results[i] = Some(ToolResult::failed(call, AgentError::Rejected(rejection)));
            }
        }
        // 依赖被拒绝的调用同样不派发
        for (i, call) in calls.iter().enumerate() {
            if results[i].is_none() {
                if let Some(dep) = call.depends_on.iter().find(|d| rejected.contains(*d)) {
                    let dependency = calls
                        .iter()
                        .find(|c| &c.id == dep)
                        .map(|c| c.tool.clone())
                        .unwrap_or_else(|| dep.clone());
                    results[i] = Some(ToolResult::failed(
                        call,
                        AgentError::DependencyFailed {
                            tool: call.tool.clone(),
                            dependency,
                        },
                    ));
                }
            }
        }

        let mut pending: Vec<usize> = (0..calls.len()).filter(|&i| results[i].is_none()).collect();
        let mut attempt = 1u32;
        while !pending.is_empty() {
            let batch: Vec<ToolCall> = pending.iter().map(|&i| calls[i].clone()).collect();
            for call in &batch {
                ctx.events.send(
                    ctx.turn_id,
                    TurnEventKind::ToolCall {
                        call_id: call.id.clone(),
                        tool: call.tool.clone(),
                        args: call.arguments.clone(),
                        hop,
                    },
                );
                ctx.events.send(
                    ctx.turn_id,
                    TurnEventKind::ToolStatus {
                        text: tool_status(ctx.registry.get(&call.tool), &call.arguments),
                    },
                );
            }

            let outcomes = ctx.executor.dispatch(&batch, ctx.registry, ctx.cancel).await;
            for (&i, outcome) in pending.iter().zip(outcomes) {
                let outcome = outcome.with_attempt(attempt);
                ctx.events.send(
                    ctx.turn_id,
                    TurnEventKind::ToolResult {
                        call_id: outcome.call_id.clone(),
                        tool: outcome.tool.clone(),
                        success: outcome.success,
                        preview: preview(&outcome.content),
                    },
                );
                results[i] = Some(outcome);
            }

            let retryable = retry_set(ctx.recovery, &calls, &pending, &results);
            if retryable.is_empty() || ctx.cancel.is_cancelled() || !self.budget.take_retry() {
                break;
            }

            self.enter(TurnState::Retrying);
            self.retries_used += 1;
            for &i in &retryable {
                if let Some(r) = &results[i] {
                    tracing::warn!(turn_id = ctx.turn_id, tool = %r.tool, error = %r.content, attempt, "retrying tool call");
                    ctx.events.send(
                        ctx.turn_id,
                        TurnEventKind::Retry {
                            attempt: attempt + 1,
                            reason: r.content.clone(),
                        },
                    );
                }
            }
            if self.sleep_backoff(attempt, ctx.cancel).await.is_err() {
                break;
            }
            attempt += 1;
            pending = retryable;
            self.enter(TurnState::Dispatched);
        }

        calls
            .into_iter()
            .zip(results)
            .map(|(call, result)| {
                let result = result.unwrap_or_else(|| ToolResult::failed(&call, AgentError::Cancelled));
                let discovery = ctx.registry.get(&call.tool).is_some_and(ToolDescriptor::is_discovery);
                CallRecord {
                    call,
                    result,
                    hop,
                    discovery,
                }
            })
            .collect()
    }
}

/// 需要重派的调用（升序）。依赖失败的调用只在其依赖本身也重派时才跟随重派，
/// 且依赖与它同批，由执行器保证顺序；依赖不可重试时它保持失败，不会单独派发。
fn retry_set(
    recovery: &RecoveryEngine,
    calls: &[ToolCall],
    pending: &[usize],
    results: &[Option<ToolResult>],
) -> Vec<usize> {
    let failure = |i: usize| results[i].as_ref().and_then(|r| r.failure.as_ref());
    let mut set: Vec<usize> = pending
        .iter()
        .copied()
        .filter(|&i| {
            failure(i).is_some_and(|e| {
                !matches!(e, AgentError::DependencyFailed { .. }) && recovery.is_retryable(e)
            })
        })
        .collect();

    loop {
        let before = set.len();
        for &i in pending {
            if set.contains(&i) || !matches!(failure(i), Some(AgentError::DependencyFailed { .. })) {
                continue;
            }
            let deps: Vec<usize> = calls[i]
                .depends_on
                .iter()
                .filter_map(|d| calls.iter().position(|c| &c.id == d))
                .collect();
            let rerun = deps.iter().any(|j| set.contains(j));
            let ready = deps
                .iter()
                .all(|j| set.contains(j) || results[*j].as_ref().is_some_and(|r| r.success));
            if rerun && ready {
                set.push(i);
            }
        }
        if set.len() == before {
            break;
        }
    }
    set.sort_unstable();
    set
}

fn has_followup_action(ctx: &TurnContext<'_>, discovery: &ToolCall) -> bool {
    let Some(origin) = ctx.registry.get(&discovery.tool).map(|d| d.origin.as_str()) else {
        return false;
    };
    ctx.tools
        .iter()
        .any(|d| d.effect == EffectClass::Action && d.origin == origin)
}

fn preview(content: &str) -> String {
    if content.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", content.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        content.to_string()
    }
}
