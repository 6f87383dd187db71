//! 会话编排器：每个连接一个 Session
//!
//! Session 独占对话记忆、工具注册表与各阶段组件，负责单轮的完整流程：
//! 记录用户输入 → 意图路由 → （工具路径）确认语 + 续接控制器 → 叙述 → 记录回复。
//! spawn_session 在后台任务中消费命令（Submit / Interrupt / Clear / RefreshTools / Disconnect），
//! 进行中的轮次遇到新的 Submit 或打断时被取消。

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::builder::SessionBuilder;
use crate::core::{AgentError, RecoveryEngine, SessionSupervisor};
use crate::intent::{Classification, IntentRouter, RoutingHints};
use crate::memory::{ConversationMemory, TranscriptStore, Turn};
use crate::tools::{DiscoveryReport, ToolExecutor, ToolRegistry};
use crate::turn::{
    Acknowledger, Completion, ContinuationController, ConversationResponder, EventSink, Narration, ToolBroker,
    TurnContext, TurnEvent, TurnEventKind, TurnPolicy, TurnReport,
};

/// 上游发往会话的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 一条转写好的用户输入
    Submit(TurnInput),
    /// 用户打断播报；heard 为已经播出的部分
    Interrupt { heard: String },
    /// 清空对话（保留人设）
    Clear,
    /// 重新发现工具
    RefreshTools,
    /// 断开连接，结束会话
    Disconnect,
}

/// 用户输入 + 可选路由提示
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub text: String,
    pub hints: RoutingHints,
}

impl TurnInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hints: RoutingHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: RoutingHints) -> Self {
        self.hints = hints;
        self
    }
}

impl From<&str> for TurnInput {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// 单轮结果；被取消时 narration 为 None，已完成的工具结果仍保留在 report 中
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub classification: Classification,
    pub narration: Option<Narration>,
    pub report: Option<TurnReport>,
    pub cancelled: bool,
}

impl TurnOutcome {
    pub fn text(&self) -> Option<&str> {
        self.narration.as_ref().map(|n| n.text.as_str())
    }
}

/// 会话统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub direct_turns: u64,
    pub tool_turns: u64,
    pub followups: u64,
    pub retries: u64,
    pub cancelled_turns: u64,
}

/// 会话输出（叙述与控制结果；过程事件走单独的事件通道）
#[derive(Debug, Clone)]
pub enum SessionOutput {
    Outcome(TurnOutcome),
    /// 会话级错误（只有模型后端完全不可用时出现）
    Error { message: String },
    Cleared,
    ToolsRefreshed(DiscoveryReport),
    Closed(SessionStats),
}

pub struct Session {
    pub(crate) id: String,
    pub(crate) memory: ConversationMemory,
    pub(crate) registry: ToolRegistry,
    pub(crate) discovery: DiscoveryReport,
    pub(crate) router: IntentRouter,
    pub(crate) broker: ToolBroker,
    pub(crate) responder: ConversationResponder,
    pub(crate) executor: ToolExecutor,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) policy: TurnPolicy,
    pub(crate) acknowledger: Option<Acknowledger>,
    pub(crate) events: EventSink,
    pub(crate) supervisor: Arc<SessionSupervisor>,
    pub(crate) stats: SessionStats,
    pub(crate) turn_counter: u64,
    pub(crate) transcript: Option<TranscriptStore>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryReport {
        &self.discovery
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn supervisor(&self) -> Arc<SessionSupervisor> {
        self.supervisor.clone()
    }

    pub fn set_events(&mut self, events: EventSink) {
        self.events = events;
    }

    fn next_turn_id(&mut self) -> String {
        self.turn_counter += 1;
        let prefix = self.id.split('-').next().unwrap_or(&self.id);
        format!("{prefix}-{}", self.turn_counter)
    }

    /// 处理一轮；同一会话同一时刻只有一个进行中的轮次
    pub async fn handle_turn(&mut self, input: TurnInput) -> Result<TurnOutcome, AgentError> {
        let cancel = self.supervisor.begin_turn();
        self.handle_turn_with(input, cancel).await
    }

    /// cancel 由调用方预先通过 SessionSupervisor::begin_turn 取得
    pub async fn handle_turn_with(&mut self, input: TurnInput, cancel: CancellationToken) -> Result<TurnOutcome, AgentError> {
        let turn_id = self.next_turn_id();
        let span = tracing::info_span!("turn", turn_id = %turn_id);
        self.run_turn(turn_id, input, cancel).instrument(span).await
    }

    async fn run_turn(
        &mut self,
        turn_id: String,
        input: TurnInput,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let text = input.text.trim().to_string();
        self.memory.push(Turn::user(&text));

        let history = self.memory.recent(self.broker.window());
        let classification = self.router.route(&text, &history, &input.hints).await;
        tracing::info!(intent = ?classification.intent, signal = ?classification.signal, "turn routed");
        self.events.send(
            &turn_id,
            TurnEventKind::Classified {
                classification: classification.clone(),
            },
        );

        let report = if classification.is_tool() {
            self.stats.tool_turns += 1;
            Some(self.run_tools(&turn_id, &text, &classification, &history, &cancel).await)
        } else {
            self.stats.direct_turns += 1;
            None
        };

        if cancel.is_cancelled() {
            return Ok(self.cancelled(turn_id, classification, report));
        }

        // 没有产生任何调用（Broker 判断无需工具或 Broker 本身失败）时按直接对话叙述
        let narrated = report.as_ref().filter(|r| !r.records.is_empty());
        let mut hidden = self.registry.tool_names();
        hidden.extend(self.registry.descriptors().iter().map(|d| d.remote_name.clone()));
        let narration = self
            .responder
            .narrate(
                &self.memory.turns(),
                narrated,
                &hidden,
                &turn_id,
                &self.events,
                &cancel,
            )
            .await;

        match narration {
            Ok(narration) => {
                self.memory.push(Turn::assistant(&narration.text));
                self.persist();
                Ok(TurnOutcome {
                    turn_id,
                    classification,
                    narration: Some(narration),
                    report,
                    cancelled: false,
                })
            }
            Err(AgentError::Cancelled) => Ok(self.cancelled(turn_id, classification, report)),
            Err(e) => {
                tracing::error!(error = %e, "narration failed");
                self.events.send(&turn_id, TurnEventKind::Error { text: e.to_string() });
                self.persist();
                Err(e)
            }
        }
    }

    async fn run_tools(
        &mut self,
        turn_id: &str,
        text: &str,
        classification: &Classification,
        window: &[Turn],
        cancel: &CancellationToken,
    ) -> TurnReport {
        if let Some(ack) = &self.acknowledger {
            self.events.send(turn_id, TurnEventKind::Acknowledgment { text: ack.next() });
        }
        let tools = self.registry.descriptors_for(&classification.tool_scope());
        tracing::debug!(tools = tools.len(), scope = ?classification.tool_scope(), "tool enumeration scoped");

        let report = ContinuationController::new(self.policy)
            .run(TurnContext {
                turn_id,
                original_request: text,
                window,
                tools: &tools,
                registry: &self.registry,
                broker: &self.broker,
                executor: &self.executor,
                recovery: &self.recovery,
                events: &self.events,
                cancel,
            })
            .await;

        self.stats.followups += report.hops as u64;
        self.stats.retries += u64::from(report.retries_used);
        if let Completion::Failed(e) = &report.completion {
            if report.records.is_empty() {
                tracing::warn!(error = %e, "tool broker failed, answering directly");
            }
        }
        report
    }

    fn cancelled(&mut self, turn_id: String, classification: Classification, report: Option<TurnReport>) -> TurnOutcome {
        tracing::info!(turn_id = %turn_id, "turn cancelled, narration discarded");
        self.stats.cancelled_turns += 1;
        TurnOutcome {
            turn_id,
            classification,
            narration: None,
            report,
            cancelled: true,
        }
    }

    /// 用户打断：取消进行中的轮次，并记录已播出的部分与中断标记
    pub fn interrupt(&mut self, heard: &str) {
        let cancelled = self.supervisor.cancel_turn();
        self.memory.interrupt(heard);
        tracing::info!(cancelled, "user interrupted");
        self.persist();
    }

    pub fn clear(&mut self) {
        self.memory.clear();
        self.persist();
    }

    /// 重新发现工具；有服务器不可用时推送 degraded 事件
    pub async fn refresh_tools(&mut self) -> DiscoveryReport {
        let report = self.registry.refresh().await;
        self.report_degraded(&report);
        self.discovery = report.clone();
        report
    }

    fn report_degraded(&self, report: &DiscoveryReport) {
        if report.is_degraded() {
            self.events.send(
                &self.id,
                TurnEventKind::DegradedTools {
                    servers: report.degraded.clone(),
                },
            );
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.transcript {
            if let Err(e) = store.save(&self.memory) {
                tracing::warn!(error = %e, path = %store.path().display(), "Failed to save transcript");
            }
        }
    }

    /// 断开连接
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        self.persist();
    }
}

/// 按配置创建会话（后端与工具服务器全部来自配置）
pub async fn build_session(config: &AppConfig) -> anyhow::Result<Session> {
    SessionBuilder::new(config.clone()).build().await
}

/// 后台会话的句柄
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
    pub outputs: mpsc::UnboundedReceiver<SessionOutput>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    /// 发送命令；会话已结束时返回 false
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn submit(&self, input: impl Into<TurnInput>) -> bool {
        self.send(Command::Submit(input.into()))
    }

    pub fn interrupt(&self, heard: impl Into<String>) -> bool {
        self.send(Command::Interrupt { heard: heard.into() })
    }

    pub fn disconnect(&self) -> bool {
        self.send(Command::Disconnect)
    }
}

/// 在后台任务中运行会话
pub fn spawn_session(mut session: Session) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    session.set_events(EventSink::new(event_tx));

    let task = tokio::spawn(run_session(session, cmd_rx, out_tx));
    SessionHandle {
        commands: cmd_tx,
        events: event_rx,
        outputs: out_rx,
        task,
    }
}

async fn run_session(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    out: mpsc::UnboundedSender<SessionOutput>,
) {
    let supervisor = session.supervisor();
    let discovery = session.discovery.clone();
    session.report_degraded(&discovery);
    tracing::info!(session = %session.id, tools = session.registry.len(), "session started");

    let mut queued: VecDeque<Command> = VecDeque::new();
    let mut closed = false;
    loop {
        let command = match queued.pop_front() {
            Some(c) => c,
            None if closed => break,
            None => match commands.recv().await {
                Some(c) => c,
                None => break,
            },
        };

        match command {
            Command::Submit(input) => {
                let cancel = supervisor.begin_turn();
                let result = {
                    let turn = session.handle_turn_with(input, cancel.clone());
                    tokio::pin!(turn);
                    loop {
                        tokio::select! {
                            r = &mut turn => break r,
                            next = commands.recv(), if !closed => match next {
                                Some(c) => {
                                    if matches!(c, Command::Submit(_) | Command::Interrupt { .. } | Command::Disconnect) {
                                        cancel.cancel();
                                    }
                                    queued.push_back(c);
                                }
                                None => {
                                    closed = true;
                                    cancel.cancel();
                                }
                            },
                        }
                    }
                };
                let output = match result {
                    Ok(outcome) => SessionOutput::Outcome(outcome),
                    Err(e) => SessionOutput::Error { message: e.to_string() },
                };
                let _ = out.send(output);
            }
            Command::Interrupt { heard } => session.interrupt(&heard),
            Command::Clear => {
                session.clear();
                let _ = out.send(SessionOutput::Cleared);
            }
            Command::RefreshTools => {
                let report = session.refresh_tools().await;
                let _ = out.send(SessionOutput::ToolsRefreshed(report));
            }
            Command::Disconnect => break,
        }
    }

    session.shutdown();
    tracing::info!(session = %session.id, stats = ?session.stats, "session closed");
    let _ = out.send(SessionOutput::Closed(session.stats));
}
