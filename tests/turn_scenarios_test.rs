//! 单轮编排集成测试：脚本化模型后端 + 进程内工具服务器

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duet::config::AppConfig;
use duet::core::{spawn_session, AgentError, Session, SessionBuilder, SessionOutput, TurnInput};
use duet::intent::{Intent, RoutingHints};
use duet::llm::{ProposedCall, ScriptedBackend, ScriptedReply};
use duet::memory::{Role, INTERRUPT_MARKER};
use duet::tools::{CurrentTimeTool, LocalToolServer, RemoteTool, ServerError, ToolFamily, ToolServer};
use duet::turn::{Completion, EventSink, TurnEvent, TurnEventKind, TurnState};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const LIVE_CONTEXT: &str = "- names: Speaker\n  domain: media_player\n  state: 'on'\n  areas: Soggiorno";

/// 模拟家居服务器：一个发现工具 + 一个动作工具
struct HomeServer {
    off_delay: Duration,
    lookup_fails: bool,
    /// 发现工具第一次返回可重试错误
    lookup_flaky: AtomicBool,
    calls: Mutex<Vec<(String, Value)>>,
}

impl HomeServer {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(off_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            off_delay,
            lookup_fails: false,
            lookup_flaky: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn with_flaky_lookup() -> Arc<Self> {
        Arc::new(Self {
            off_delay: Duration::ZERO,
            lookup_fails: false,
            lookup_flaky: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// 发现工具返回不可重试的错误
    fn with_failing_lookup() -> Arc<Self> {
        Arc::new(Self {
            off_delay: Duration::ZERO,
            lookup_fails: true,
            lookup_flaky: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn invoked(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl ToolServer for HomeServer {
    fn name(&self) -> &str {
        "home"
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ServerError> {
        Ok(vec![
            RemoteTool {
                name: "GetLiveContext".into(),
                description: "Current state of all devices in the home".into(),
                parameters: json!({"type": "object", "properties": {}, "required": []}),
                effect: None,
            },
            RemoteTool {
                name: "HassTurnOff".into(),
                description: "Turns off a device".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}, "area": {"type": "string"}},
                    "required": ["name"]
                }),
                effect: None,
            },
        ])
    }

    async fn invoke(&self, tool: &str, arguments: &Value) -> Result<String, ServerError> {
        self.calls.lock().unwrap().push((tool.to_string(), arguments.clone()));
        match tool {
            "GetLiveContext" if self.lookup_fails => Err(ServerError::Execution {
                message: "area registry unavailable".into(),
                transient: false,
            }),
            "GetLiveContext" if self.lookup_flaky.swap(false, Ordering::SeqCst) => {
                Err(ServerError::Unreachable("connection reset".into()))
            }
            "GetLiveContext" => Ok(LIVE_CONTEXT.to_string()),
            "HassTurnOff" => {
                tokio::time::sleep(self.off_delay).await;
                let name = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
                if name == "Speaker" {
                    Ok(format!("Turned off {name}"))
                } else {
                    Err(ServerError::Execution {
                        message: format!("no device named '{name}'"),
                        transient: false,
                    })
                }
            }
            other => Err(ServerError::Protocol(format!("unknown tool {other}"))),
        }
    }
}

/// 发现阶段就不可达的服务器
struct DownServer;

#[async_trait]
impl ToolServer for DownServer {
    fn name(&self) -> &str {
        "garage"
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ServerError> {
        Err(ServerError::Unreachable("connection refused".into()))
    }

    async fn invoke(&self, _tool: &str, _arguments: &Value) -> Result<String, ServerError> {
        Err(ServerError::Unreachable("connection refused".into()))
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.persona = "Sei Duet.".into();
    cfg.turn.retry_backoff_ms = 10;
    cfg.tools.tool_timeout_secs = 1;
    cfg
}

async fn session_with(
    cfg: AppConfig,
    tool_llm: Arc<ScriptedBackend>,
    chat_llm: Arc<ScriptedBackend>,
    servers: Vec<Arc<dyn ToolServer>>,
    events: EventSink,
) -> Session {
    SessionBuilder::new(cfg)
        .with_tool_backend(tool_llm)
        .with_conversation_backend(chat_llm)
        .with_servers(servers)
        .with_events(events)
        .build()
        .await
        .unwrap()
}

/// 一次回复中同时给出多个调用
fn bundled(calls: &[(&str, &str, Value)]) -> ScriptedReply {
    ScriptedReply::Calls(
        calls
            .iter()
            .map(|(id, name, arguments)| ProposedCall {
                id: Some(id.to_string()),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
    )
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEventKind> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev.kind);
    }
    out
}

#[tokio::test]
async fn test_discovery_then_action_copies_identifier() {
    let home = HomeServer::new();
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("GetLiveContext", json!({})),
        ScriptedReply::call("HassTurnOff", json!({"name": "Speaker"})),
    ]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text(
        "Ho controllato con GetLiveContext e ho spento la cassa.",
    )]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        chat_llm.clone(),
        vec![home.clone()],
        EventSink::new(tx),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    assert_eq!(outcome.classification.intent, Intent::Tool);
    assert_eq!(outcome.classification.family, Some(ToolFamily::DeviceControl));

    let report = outcome.report.as_ref().unwrap();
    assert_eq!(report.completion, Completion::Complete);
    assert_eq!(report.hops, 1);
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].call.tool, "GetLiveContext");
    assert!(report.records[0].discovery);
    assert_eq!(report.records[1].call.tool, "HassTurnOff");
    assert_eq!(report.records[1].call.arguments["name"], "Speaker");
    assert_eq!(report.records[1].hop, 1);
    assert_eq!(report.final_record().unwrap().result.content, "Turned off Speaker");
    assert!(report.states.contains(&TurnState::AwaitingFollowup));
    assert_eq!(home.invoked(), vec!["GetLiveContext", "HassTurnOff"]);

    // 续接请求带有发现结果与原始请求
    let followup = &tool_llm.requests()[1];
    let scratch: Vec<&str> = followup.turns.iter().map(|t| t.content.as_str()).collect();
    assert!(scratch.iter().any(|c| c.starts_with("Tool call: GetLiveContext | Result:")));
    assert!(scratch
        .iter()
        .any(|c| c.contains("Observation from GetLiveContext") && c.contains("\"spegni la cassa\"")));
    assert!(!followup.system.contains("Sei Duet."));

    // 叙述只依据最终结果，不暴露内部标识
    let text = outcome.text().unwrap();
    assert!(!text.contains("GetLiveContext"));
    assert!(text.contains("ho spento la cassa"));
    let narration_request = &chat_llm.requests()[0];
    assert!(narration_request.system.starts_with("Sei Duet."));
    assert!(!narration_request.system.contains("GetLiveContext"));
    assert!(!narration_request.system.contains("HassTurnOff"));

    let last = session.memory().iter().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, text);

    let events = drain(&mut rx);
    assert!(matches!(events[0], TurnEventKind::Classified { .. }));
    assert!(matches!(events[1], TurnEventKind::Acknowledgment { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEventKind::ToolStatus { text } if text == "Spengo Speaker...")));
    assert!(matches!(events.last(), Some(TurnEventKind::NarrationDone)));
    assert_eq!(session.stats().followups, 1);
}

#[tokio::test]
async fn test_action_timeout_retries_once_then_reports_failure() {
    let home = HomeServer::with_delay(Duration::from_secs(3));
    let tool_llm = Arc::new(ScriptedBackend::new([ScriptedReply::call(
        "HassTurnOff",
        json!({"name": "Speaker"}),
    )]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text(
        "Mi dispiace, la cassa non risponde.",
    )]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        chat_llm.clone(),
        vec![home.clone()],
        EventSink::new(tx),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.as_ref().unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.retries_used, 1);
    let result = &report.records[0].result;
    assert!(!result.success);
    assert_eq!(result.attempt, 2);
    assert!(matches!(result.failure, Some(AgentError::ToolTimeout { .. })));
    assert!(matches!(report.completion, Completion::Failed(AgentError::ToolTimeout { .. })));
    assert_eq!(home.invoked(), vec!["HassTurnOff", "HassTurnOff"]);
    // 重试不重新调用 Broker
    assert_eq!(tool_llm.requests().len(), 1);

    let guidance = &chat_llm.requests()[0].system;
    assert!(guidance.contains("Error:"));
    assert!(guidance.contains("could not be completed"));
    assert_eq!(outcome.text(), Some("Mi dispiace, la cassa non risponde."));

    let retries = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, TurnEventKind::Retry { attempt: 2, .. }))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn test_ambiguous_time_words_resolve_both_directions() {
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("get_current_time", json!({})),
        ScriptedReply::Calls(Vec::new()),
    ]));
    let chat_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::text("Sono le dieci."),
        ScriptedReply::text("Dipende da quanto studi."),
        ScriptedReply::text("A Roma c'è il sole."),
    ]));
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        chat_llm,
        vec![
            Arc::new(LocalToolServer::new("builtin").with_tool(CurrentTimeTool)),
            HomeServer::new(),
        ],
        EventSink::disabled(),
    )
    .await;

    // 询问时钟：时间工具，发现即结束，不续接
    let clock = session.handle_turn("che ore sono?".into()).await.unwrap();
    assert_eq!(clock.classification.intent, Intent::Tool);
    assert_eq!(clock.classification.family, Some(ToolFamily::Time));
    let report = clock.report.unwrap();
    assert_eq!(report.completion, Completion::Complete);
    assert_eq!(report.hops, 0);
    let offered: Vec<String> = tool_llm.requests()[0]
        .tools
        .as_ref()
        .unwrap()
        .iter()
        .map(|d| d.name.clone())
        .collect();
    assert_eq!(offered, vec!["get_current_time"]);

    // 抽象的"时间"：直接对话
    let abstract_time = session.handle_turn("quanto tempo ci vuole per imparare?".into()).await.unwrap();
    assert_eq!(abstract_time.classification.intent, Intent::Direct);
    assert!(abstract_time.report.is_none());

    // 天气里的"tempo"：搜索范围
    let weather = session.handle_turn("che tempo fa a Roma?".into()).await.unwrap();
    assert_eq!(weather.classification.intent, Intent::Tool);
    assert_eq!(weather.classification.family, Some(ToolFamily::Search));
    assert_eq!(weather.report.as_ref().unwrap().completion, Completion::NoToolCalls);
    assert_eq!(weather.text(), Some("A Roma c'è il sole."));
    assert_eq!(tool_llm.requests().len(), 2);
}

#[tokio::test]
async fn test_memory_cap_evicts_oldest_turns() {
    let mut cfg = test_config();
    cfg.app.memory_cap = 10;
    let mut session = session_with(
        cfg,
        Arc::new(ScriptedBackend::new([])),
        Arc::new(ScriptedBackend::new([])),
        vec![],
        EventSink::disabled(),
    )
    .await;

    for i in 1..=20 {
        let outcome = session.handle_turn(TurnInput::new(format!("messaggio {i}"))).await.unwrap();
        assert_eq!(outcome.classification.intent, Intent::Direct);
        assert!(session.memory().len() <= 10);
    }

    let turns = session.memory().turns();
    assert_eq!(turns.len(), 10);
    assert_eq!(turns[0].role, Role::System);
    assert_eq!(turns[0].content, "Sei Duet.");
    assert!(!turns.iter().any(|t| t.content == "messaggio 1"));
    assert_eq!(turns[2].content, "messaggio 17");
    assert_eq!(turns[9].role, Role::Assistant);
    assert_eq!(session.stats().direct_turns, 20);
}

#[tokio::test]
async fn test_at_most_one_followup_hop() {
    let home = HomeServer::new();
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("GetLiveContext", json!({})),
        ScriptedReply::call("GetLiveContext", json!({})),
        ScriptedReply::call("HassTurnOff", json!({"name": "Speaker"})),
    ]));
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        Arc::new(ScriptedBackend::new([])),
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.hops, 1);
    assert_eq!(report.records.len(), 2);
    assert_eq!(tool_llm.requests().len(), 2);
    assert_eq!(home.invoked(), vec!["GetLiveContext", "GetLiveContext"]);
}

#[tokio::test]
async fn test_followup_without_calls_completes_softly() {
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("GetLiveContext", json!({})),
        ScriptedReply::text("La cassa risulta già spenta."),
    ]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text(
        "Ho controllato la cassa ma non l'ho spenta.",
    )]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = session_with(
        test_config(),
        tool_llm,
        chat_llm.clone(),
        vec![HomeServer::new()],
        EventSink::new(tx),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.completion, Completion::FollowupExhausted);
    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].result.success);
    assert!(chat_llm.requests()[0].system.contains("partially completed"));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, TurnEventKind::FollowupWarning { .. })));
}

#[tokio::test]
async fn test_rejected_call_is_never_dispatched() {
    let home = HomeServer::new();
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("HassTurnOff", json!({"name": "14:30"})),
    ]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text("Quale dispositivo?")]));
    let mut session = session_with(
        test_config(),
        tool_llm,
        chat_llm,
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni alle 14:30".into()).await.unwrap();
    let report = outcome.report.unwrap();
    assert!(matches!(
        report.records[0].result.failure,
        Some(AgentError::Rejected(_))
    ));
    assert_eq!(report.retries_used, 0);
    assert!(home.invoked().is_empty());
}

#[tokio::test]
async fn test_unreachable_server_degrades_discovery() {
    let session = session_with(
        test_config(),
        Arc::new(ScriptedBackend::new([])),
        Arc::new(ScriptedBackend::new([])),
        vec![Arc::new(DownServer), HomeServer::new()],
        EventSink::disabled(),
    )
    .await;

    assert!(session.discovery().is_degraded());
    assert_eq!(session.discovery().degraded[0].server, "garage");
    assert!(session.registry().contains("HassTurnOff"));

    let mut handle = spawn_session(session);
    let first = handle.events.recv().await.unwrap();
    assert!(matches!(first.kind, TurnEventKind::DegradedTools { .. }));
    handle.disconnect();
}

#[tokio::test]
async fn test_new_submit_cancels_in_flight_turn() {
    let chat_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::Stall,
        ScriptedReply::text("Sto bene, grazie!"),
    ]));
    let session = session_with(
        test_config(),
        Arc::new(ScriptedBackend::new([])),
        chat_llm.clone(),
        vec![],
        EventSink::disabled(),
    )
    .await;

    let mut handle = spawn_session(session);
    assert!(handle.submit("ciao"));
    // 等第一轮进入叙述阶段再打断
    while chat_llm.requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(handle.submit("come stai?"));

    let first = match handle.outputs.recv().await {
        Some(SessionOutput::Outcome(o)) => o,
        other => panic!("unexpected output: {other:?}"),
    };
    assert!(first.cancelled);
    assert!(first.narration.is_none());

    let second = match handle.outputs.recv().await {
        Some(SessionOutput::Outcome(o)) => o,
        other => panic!("unexpected output: {other:?}"),
    };
    assert_eq!(second.text(), Some("Sto bene, grazie!"));

    handle.disconnect();
    match handle.outputs.recv().await {
        Some(SessionOutput::Closed(stats)) => {
            assert_eq!(stats.cancelled_turns, 1);
            assert_eq!(stats.direct_turns, 2);
        }
        other => panic!("unexpected output: {other:?}"),
    }
}

#[tokio::test]
async fn test_forced_intent_and_backend_failure() {
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::Fail(
        duet::llm::LlmError::Unavailable("no model".into()),
    )]));
    let mut session = session_with(
        test_config(),
        Arc::new(ScriptedBackend::new([])),
        chat_llm,
        vec![],
        EventSink::disabled(),
    )
    .await;

    let input = TurnInput::new("spegni la cassa").with_hints(RoutingHints {
        force_intent: Some(Intent::Direct),
    });
    let err = session.handle_turn(input).await.unwrap_err();
    assert!(matches!(err, AgentError::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_interrupt_records_heard_text() {
    let mut session = session_with(
        test_config(),
        Arc::new(ScriptedBackend::new([])),
        Arc::new(ScriptedBackend::new([ScriptedReply::text("C'era una volta un re.")])),
        vec![],
        EventSink::disabled(),
    )
    .await;

    session.handle_turn("raccontami una storia".into()).await.unwrap();
    session.interrupt("C'era una volta");

    let turns = session.memory().turns();
    let n = turns.len();
    assert_eq!(turns[n - 2].role, Role::Assistant);
    assert_eq!(turns[n - 2].content, "C'era una volta...");
    assert_eq!(turns[n - 1].role, Role::User);
    assert_eq!(turns[n - 1].content, INTERRUPT_MARKER);
}

#[tokio::test]
async fn test_bundled_lookup_and_action_skip_followup() {
    let home = HomeServer::new();
    let tool_llm = Arc::new(ScriptedBackend::new([bundled(&[
        ("c1", "GetLiveContext", json!({})),
        ("c2", "HassTurnOff", json!({"name": "Speaker"})),
    ])]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text("Ho spento la cassa.")]));
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        chat_llm,
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.as_ref().unwrap();
    assert_eq!(report.completion, Completion::Complete);
    assert_eq!(report.hops, 0);
    assert!(!report.states.contains(&TurnState::AwaitingFollowup));
    assert_eq!(tool_llm.requests().len(), 1);
    assert_eq!(home.invoked(), vec!["GetLiveContext", "HassTurnOff"]);
    assert_eq!(report.records[1].call.depends_on, vec!["c1".to_string()]);
    assert_eq!(report.final_record().unwrap().result.content, "Turned off Speaker");
}

#[tokio::test]
async fn test_failed_lookup_blocks_bundled_action() {
    let home = HomeServer::with_failing_lookup();
    let tool_llm = Arc::new(ScriptedBackend::new([bundled(&[
        ("c1", "GetLiveContext", json!({})),
        ("c2", "HassTurnOff", json!({"name": "Speaker"})),
    ])]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text(
        "Mi dispiace, non sono riuscita a spegnere la cassa.",
    )]));
    let mut session = session_with(
        test_config(),
        tool_llm,
        chat_llm.clone(),
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.as_ref().unwrap();

    // 依赖失败且不可重试：动作从未派发，也不会单独重派
    assert_eq!(home.invoked(), vec!["GetLiveContext"]);
    assert_eq!(report.retries_used, 0);
    assert!(!report.records[1].result.success);
    assert!(matches!(
        report.records[1].result.failure,
        Some(AgentError::DependencyFailed { .. })
    ));
    assert!(matches!(
        report.completion,
        Completion::Failed(AgentError::DependencyFailed { .. })
    ));
    assert!(chat_llm.requests()[0].system.contains("could not be completed"));
}

#[tokio::test]
async fn test_completion_follows_last_record() {
    let home = HomeServer::new();
    let tool_llm = Arc::new(ScriptedBackend::new([bundled(&[
        ("c1", "HassTurnOff", json!({"name": "Lampada"})),
        ("c2", "HassTurnOff", json!({"name": "Speaker"})),
    ])]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text(
        "Ho spento la cassa, la lampada non l'ho trovata.",
    )]));
    let mut session = session_with(
        test_config(),
        tool_llm,
        chat_llm.clone(),
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni la lampada e la cassa".into()).await.unwrap();
    let report = outcome.report.as_ref().unwrap();

    assert!(!report.records[0].result.success);
    assert!(report.records[1].result.success);
    assert_eq!(report.completion, Completion::Complete);

    // 前面的失败仍作为步骤交给叙述，但不标记整轮失败
    let system = &chat_llm.requests()[0].system;
    assert!(system.contains("Step 1 (action): Error:"));
    assert!(!system.contains("could not be completed"));
}

#[tokio::test]
async fn test_retried_lookup_keeps_followup_prompt_clean() {
    let home = HomeServer::with_flaky_lookup();
    let tool_llm = Arc::new(ScriptedBackend::new([
        ScriptedReply::call("GetLiveContext", json!({})),
        ScriptedReply::call("HassTurnOff", json!({"name": "Speaker"})),
    ]));
    let chat_llm = Arc::new(ScriptedBackend::new([ScriptedReply::text("Ho spento la cassa.")]));
    let mut session = session_with(
        test_config(),
        tool_llm.clone(),
        chat_llm,
        vec![home.clone()],
        EventSink::disabled(),
    )
    .await;

    let outcome = session.handle_turn("spegni la cassa".into()).await.unwrap();
    let report = outcome.report.as_ref().unwrap();
    assert_eq!(home.invoked(), vec!["GetLiveContext", "GetLiveContext", "HassTurnOff"]);
    assert_eq!(report.retries_used, 1);
    assert_eq!(report.hops, 1);
    assert_eq!(report.records[0].result.attempt, 2);
    assert_eq!(report.completion, Completion::Complete);

    // 续接请求只带发现结果，不带重试过程
    let followup = &tool_llm.requests()[1];
    assert!(followup
        .turns
        .iter()
        .all(|t| !t.content.contains("connection reset") && !t.content.contains("retried")));
}
