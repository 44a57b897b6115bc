use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use super::*;
use async_trait::async_trait;
use axum::{
    extract::ws::{WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use shared::domain::AgentProgressStatus;

use tokio::net::TcpListener;

use crate::payload::Commentary;

struct ScriptedSource {
    kind: SourceKind,
    events: broadcast::Sender<SourceEvent>,
    sent: StdMutex<Vec<ClientRequest>>,
    fail_sends: AtomicBool,
}

impl ScriptedSource {
    fn live() -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::Live,
            events: broadcast::channel(64).0,
            sent: StdMutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::Live,
            events: broadcast::channel(64).0,
            sent: StdMutex::new(Vec::new()),
            fail_sends: AtomicBool::new(true),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl AnalysisSource for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn send(&self, request: ClientRequest) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("socket closed"));
        }
        self.sent.lock().expect("sent lock").push(request);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn controller_for(source: &Arc<ScriptedSource>) -> SessionController {
    controller_with_settings(source, ClientSettings::default())
}

fn controller_with_settings(
    source: &Arc<ScriptedSource>,
    settings: ClientSettings,
) -> SessionController {
    SessionController::new(source.clone(), ClientId::generate(), settings)
}

fn drain(ui: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    while let Ok(event) = ui.try_recv() {
        events.push(event);
    }
    events
}

fn agent_event(agent: AgentId, status: AgentProgressStatus) -> ServerEvent {
    ServerEvent::AgentProgress {
        agent: agent.wire_name().to_string(),
        status,
        message: None,
        progress: None,
    }
}

fn battle_results() -> ServerEvent {
    ServerEvent::BattleResults {
        final_decision: Some("bullish".into()),
        vote_count: Some([("bullish".to_string(), 4), ("bearish".to_string(), 2)].into()),
        debate_rounds: Some(2),
    }
}

fn analysis_complete() -> ServerEvent {
    analysis_complete_for("2330")
}

fn analysis_complete_for(code: &str) -> ServerEvent {
    ServerEvent::AnalysisComplete {
        stock_code: Some(code.into()),
        results: json!({
            "stock_code": code,
            "research": {
                "sentiment": {
                    "agent_output": "Market tone around the company stays constructive this quarter."
                },
                "technical": {
                    "agent_output": "Price holds above its 20-day average with improving momentum.",
                    "tool_data": { "daily_kline": [
                        { "date": "2024-01-02", "close": 590 },
                        { "date": "2024-01-03", "close": 593 }
                    ] }
                }
            }
        }),
        timestamp: None,
    }
}

fn count(events: &[UiEvent], predicate: impl Fn(&UiEvent) -> bool) -> usize {
    events.iter().filter(|event| predicate(event)).count()
}

async fn started_controller(source: &Arc<ScriptedSource>) -> SessionController {
    let mut controller = controller_for(source);
    controller.start_analysis("2330").await.expect("start");
    controller.handle_server_event(ServerEvent::AnalysisStarted {
        stock_code: Some("2330".into()),
        timestamp: Some("2024-05-01T08:00:00+00:00".into()),
    });
    controller
}

async fn run_to_completion(battle_first: bool) -> (SessionController, Vec<UiEvent>) {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    for agent in AgentId::ALL {
        controller.handle_server_event(agent_event(agent, AgentProgressStatus::Started));
        controller.handle_server_event(agent_event(agent, AgentProgressStatus::Completed));
    }
    controller.handle_server_event(ServerEvent::BattleStarted { message: None });

    if battle_first {
        controller.handle_server_event(battle_results());
        assert!(!controller.session().results_displayed());
        controller.handle_server_event(analysis_complete());
    } else {
        controller.handle_server_event(analysis_complete());
        assert!(controller.session().pending_success);
        assert!(!controller.session().results_displayed());
        controller.handle_server_event(battle_results());
    }
    let events = drain(&mut ui);
    (controller, events)
}

#[tokio::test]
async fn completion_order_does_not_change_outcome() {
    let (battle_first, battle_first_events) = run_to_completion(true).await;
    let (analysis_first, analysis_first_events) = run_to_completion(false).await;

    for (controller, events) in [
        (&battle_first, &battle_first_events),
        (&analysis_first, &analysis_first_events),
    ] {
        let session = controller.session();
        assert!(session.results_displayed());
        assert!(!session.pending_success);
        assert!(!session.run_active);
        assert!(session.analysis_control_enabled);
        assert!(!session.progress_panel_visible);
        assert_eq!(session.analysis_phase, AnalysisPhase::Complete);
        assert_eq!(session.progress_percent, 100.0);
        assert_eq!(session.connection_status, ConnectionStatus::Connected);
        assert_eq!(
            count(events, |event| matches!(event, UiEvent::ResultsReady(_))),
            1
        );
        assert_eq!(
            count(events, |event| matches!(
                event,
                UiEvent::Toast {
                    level: ToastLevel::Success,
                    ..
                }
            )),
            1
        );
    }
    assert_eq!(battle_first.session().report, analysis_first.session().report);
    assert_eq!(battle_first.session().battle, analysis_first.session().battle);

    let report = battle_first.session().report.clone().expect("report");
    assert!(matches!(
        report.agent(AgentId::Sentiment).map(|agent| &agent.commentary),
        Some(Commentary::Text(_))
    ));
    assert_eq!(report.chart.map(|chart| chart.len()), Some(2));
}

#[tokio::test]
async fn duplicate_completion_signals_display_once() {
    let (mut controller, _) = run_to_completion(true).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(analysis_complete());
    controller.handle_server_event(battle_results());

    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::ResultsReady(_))),
        0
    );
}

#[tokio::test]
async fn progress_reports_completed_share_and_never_regresses() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    for (completed, agent) in AgentId::ALL.into_iter().take(3).enumerate() {
        controller.handle_server_event(agent_event(agent, AgentProgressStatus::Started));
        controller.handle_server_event(agent_event(agent, AgentProgressStatus::Completed));
        assert_eq!(
            controller.session().progress_percent,
            (completed + 1) as f64 / 6.0 * 100.0
        );
    }
    assert_eq!(controller.session().progress_percent, 50.0);

    drain(&mut ui);
    controller.handle_server_event(agent_event(AgentId::Sentiment, AgentProgressStatus::Started));
    assert_eq!(
        controller.session().progress.status(AgentId::Sentiment),
        AgentStatus::Completed
    );
    assert!(drain(&mut ui).is_empty());

    controller.handle_server_event(agent_event(AgentId::BigDeal, AgentProgressStatus::Error));
    assert_eq!(
        controller.session().progress.status(AgentId::BigDeal),
        AgentStatus::Failed
    );
    assert_eq!(controller.session().progress_percent, 50.0);
}

#[tokio::test]
async fn battle_milestone_holds_progress_at_eighty() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::BattleStarted {
        message: Some("debate".into()),
    });
    assert!(controller.session().battle_revealed);
    assert_eq!(controller.session().progress_percent, 80.0);

    controller.handle_server_event(agent_event(AgentId::Risk, AgentProgressStatus::Completed));
    assert_eq!(controller.session().progress_percent, 80.0);

    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::BattleRevealed));
    assert!(events.contains(&UiEvent::ProgressMilestone {
        percent: 80.0,
        text: "debate".into(),
    }));
}

#[tokio::test]
async fn unknown_agent_is_dropped() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::AgentProgress {
        agent: "astrology".into(),
        status: AgentProgressStatus::Completed,
        message: None,
        progress: None,
    });
    assert!(drain(&mut ui).is_empty());
    assert_eq!(controller.session().progress.completed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn report_watchdog_fires_exactly_once() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::PhaseCompleted {
        phase: PhaseKind::Report,
        message: None,
    });
    assert!(controller.watchdog_deadline().is_some());

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!controller.check_watchdog(Instant::now()));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(controller.check_watchdog(Instant::now()));
    assert!(!controller.check_watchdog(Instant::now()));
    assert!(controller.watchdog_deadline().is_none());

    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        1
    );
    assert!(events.contains(&UiEvent::AnalysisControl { enabled: true }));
    assert!(controller.session().analysis_control_enabled);

    controller.start_analysis("2330").await.expect("restart after watchdog");
}

#[tokio::test(start_paused = true)]
async fn watchdog_stays_quiet_when_results_arrive() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::PhaseCompleted {
        phase: PhaseKind::Report,
        message: None,
    });
    tokio::time::advance(Duration::from_secs(10)).await;
    controller.handle_server_event(analysis_complete());
    assert!(controller.watchdog_deadline().is_none());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(!controller.check_watchdog(Instant::now()));
    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        0
    );
}

#[tokio::test]
async fn cancel_returns_to_idle_and_ignores_stale_events() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    controller.handle_server_event(agent_event(AgentId::Sentiment, AgentProgressStatus::Started));
    let mut ui = controller.subscribe_ui();

    controller.cancel_analysis().await.expect("cancel");

    let session = controller.session();
    assert!(session.analysis_control_enabled);
    assert!(!session.progress_panel_visible);
    assert!(!session.run_active);
    assert_eq!(session.analysis_phase, AnalysisPhase::Idle);
    assert!(matches!(
        source.sent().last(),
        Some(ClientRequest::CancelAnalysis { stock_code }) if stock_code.as_str() == "2330"
    ));
    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::AnalysisControl { enabled: true }));
    assert!(events.contains(&UiEvent::ProgressPanel { visible: false }));

    controller.handle_server_event(agent_event(AgentId::Sentiment, AgentProgressStatus::Completed));
    controller.handle_server_event(battle_results());
    assert!(drain(&mut ui).is_empty());
    assert!(controller.session().battle.is_none());
}

#[tokio::test]
async fn cancel_after_a_failed_start_restores_controls() {
    let source = ScriptedSource::failing();
    let mut controller = controller_for(&source);
    assert!(controller.start_analysis("2330").await.is_err());
    let mut ui = controller.subscribe_ui();

    controller.cancel_analysis().await.expect("cancel");

    assert!(controller.session().analysis_control_enabled);
    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::AnalysisControl { enabled: true }));
    assert!(events.contains(&UiEvent::ProgressPanel { visible: false }));
}

#[tokio::test]
async fn cancel_mid_run_resets_when_the_socket_is_gone() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    controller.handle_server_event(agent_event(AgentId::Sentiment, AgentProgressStatus::Started));
    assert!(controller.session().run_active);
    let mut ui = controller.subscribe_ui();

    source.set_failing(true);
    controller.cancel_analysis().await.expect("cancel");

    let session = controller.session();
    assert!(!session.run_active);
    assert!(session.analysis_control_enabled);
    assert!(!session.progress_panel_visible);
    assert_eq!(session.analysis_phase, AnalysisPhase::Idle);
    assert!(!source
        .sent()
        .iter()
        .any(|request| matches!(request, ClientRequest::CancelAnalysis { .. })));
    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::AnalysisControl { enabled: true }));
    assert!(events.contains(&UiEvent::ProgressPanel { visible: false }));
}

#[tokio::test]
async fn results_from_a_cancelled_run_never_reach_the_next_run() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    controller.cancel_analysis().await.expect("cancel");

    controller.start_analysis("2317").await.expect("restart");
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(agent_event(AgentId::Sentiment, AgentProgressStatus::Completed));
    controller.handle_server_event(battle_results());
    controller.handle_server_event(analysis_complete_for("2330"));
    controller.handle_server_event(ServerEvent::AnalysisStarted {
        stock_code: Some("2330".into()),
        timestamp: None,
    });

    let session = controller.session();
    assert!(session.run_active);
    assert!(!session.run_acknowledged);
    assert!(session.battle.is_none());
    assert!(session.raw_results.is_none());
    assert!(!session.analysis_completed());
    assert_eq!(session.progress.completed_count(), 0);
    assert!(drain(&mut ui).is_empty());

    controller.handle_server_event(ServerEvent::AnalysisStarted {
        stock_code: Some("2317".into()),
        timestamp: None,
    });
    assert_eq!(controller.session().connection_status, ConnectionStatus::Analyzing);

    controller.handle_server_event(analysis_complete_for("2330"));
    assert!(!controller.session().analysis_completed());

    controller.handle_server_event(battle_results());
    controller.handle_server_event(analysis_complete_for("2317"));
    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::ConnectionChanged(ConnectionStatus::Analyzing)));
    let reports: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            UiEvent::ResultsReady(report) => Some(report.stock_code.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reports, vec![Some("2317".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn report_watchdog_does_not_rearm_after_firing() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();
    let report_done = || ServerEvent::PhaseCompleted {
        phase: PhaseKind::Report,
        message: None,
    };

    controller.handle_server_event(report_done());
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(controller.check_watchdog(Instant::now()));

    controller.handle_server_event(report_done());
    assert!(controller.watchdog_deadline().is_none());
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!controller.check_watchdog(Instant::now()));

    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        1
    );

    controller.start_analysis("2330").await.expect("restart");
    controller.handle_server_event(ServerEvent::AnalysisStarted {
        stock_code: Some("2330".into()),
        timestamp: None,
    });
    controller.handle_server_event(report_done());
    assert!(controller.watchdog_deadline().is_some());
}

#[tokio::test(start_paused = true)]
async fn oversized_watchdog_timeout_leaves_the_watchdog_off() {
    let source = ScriptedSource::live();
    let settings = ClientSettings {
        report_watchdog: Duration::from_secs(u64::MAX),
        ..ClientSettings::default()
    };
    let mut controller = controller_with_settings(&source, settings);
    controller.start_analysis("2330").await.expect("start");
    controller.handle_server_event(ServerEvent::AnalysisStarted {
        stock_code: Some("2330".into()),
        timestamp: None,
    });

    controller.handle_server_event(ServerEvent::PhaseCompleted {
        phase: PhaseKind::Report,
        message: None,
    });

    assert!(controller.watchdog_deadline().is_none());
    assert!(!controller.check_watchdog(Instant::now()));
    assert!(controller.session().run_active);
}

#[tokio::test]
async fn backend_error_is_shown_verbatim_and_reenables_control() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::Error {
        message: "分析過程發生錯誤: timeout".into(),
    });

    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::Toast {
        level: ToastLevel::Error,
        message: "分析過程發生錯誤: timeout".into(),
    }));
    assert!(events.contains(&UiEvent::AnalysisControl { enabled: true }));
    assert!(controller.session().analysis_control_enabled);
    assert!(!controller.session().run_active);
}

#[tokio::test]
async fn invalid_codes_never_reach_the_source() {
    let source = ScriptedSource::live();
    let mut controller = controller_for(&source);

    assert!(matches!(
        controller.validate_stock("12a").await,
        Err(ControllerError::InvalidStockCode(_))
    ));
    assert!(matches!(
        controller.start_analysis("1234567").await,
        Err(ControllerError::InvalidStockCode(_))
    ));
    assert!(matches!(
        controller.start_analysis("  ").await,
        Err(ControllerError::NoStockSelected)
    ));
    assert!(source.sent().is_empty());
    assert!(controller.session().analysis_control_enabled);
}

#[tokio::test]
async fn validation_result_selects_stock() {
    let source = ScriptedSource::live();
    let mut controller = controller_for(&source);
    let mut ui = controller.subscribe_ui();

    controller.validate_stock(" 2330 ").await.expect("validate");
    assert_eq!(
        source.sent(),
        vec![ClientRequest::ValidateStock {
            stock_code: StockCode::parse("2330").expect("code"),
        }]
    );
    let info = StockInfo {
        code: "2330".into(),
        name: "台積電".into(),
        industry: "半導體業".into(),
    };
    controller.handle_server_event(ServerEvent::ValidationResult {
        valid: true,
        stock_info: Some(info.clone()),
        message: None,
    });

    assert_eq!(
        controller.session().current_stock.as_ref().map(StockCode::as_str),
        Some("2330")
    );
    assert_eq!(controller.session().stock_info, Some(info.clone()));
    assert!(drain(&mut ui).contains(&UiEvent::StockValidated(info)));

    controller.start_analysis("").await.expect("analyze validated stock");
    assert!(controller.session().run_active);
}

#[tokio::test]
async fn failed_validation_surfaces_message() {
    let source = ScriptedSource::live();
    let mut controller = controller_for(&source);
    let mut ui = controller.subscribe_ui();

    controller.handle_server_event(ServerEvent::ValidationResult {
        valid: false,
        stock_info: None,
        message: Some("查無此股票".into()),
    });

    assert!(drain(&mut ui).contains(&UiEvent::ValidationFailed("查無此股票".into())));
    assert!(controller.session().current_stock.is_none());
}

#[tokio::test]
async fn start_forwards_run_settings() {
    let source = ScriptedSource::live();
    let settings = ClientSettings {
        max_steps: Some(5),
        debate_rounds: Some(3),
        ..ClientSettings::default()
    };
    let mut controller = controller_with_settings(&source, settings);

    controller.start_analysis("2454").await.expect("start");

    assert_eq!(
        source.sent(),
        vec![ClientRequest::StartAnalysis {
            stock_code: StockCode::parse("2454").expect("code"),
            max_steps: Some(5),
            debate_rounds: Some(3),
        }]
    );
    assert!(matches!(
        controller.start_analysis("2330").await,
        Err(ControllerError::AnalysisInProgress(code)) if code == "2454"
    ));
}

#[tokio::test]
async fn api_results_are_surfaced() {
    let source = ScriptedSource::live();
    let mut controller = controller_for(&source);
    let mut ui = controller.subscribe_ui();

    controller
        .test_api(ApiCredentials::new("openai", "sk-test", "gpt-4o-mini", 0.3))
        .await
        .expect("test api");
    assert!(matches!(source.sent().last(), Some(ClientRequest::TestApi { .. })));

    controller.handle_server_event(ServerEvent::ApiTestResult {
        success: true,
        message: None,
        response_preview: Some("Hello".into()),
    });
    assert!(drain(&mut ui).contains(&UiEvent::ApiResult {
        test: true,
        success: true,
        message: "credential test succeeded".into(),
        preview: Some("Hello".into()),
    }));
}

#[tokio::test]
async fn live_disconnect_switches_to_simulated_once() {
    let source = ScriptedSource::live();
    let mut controller = started_controller(&source).await;
    let mut ui = controller.subscribe_ui();

    controller
        .handle_source_event(SourceEvent::ConnectionChanged(ConnectionStatus::Disconnected))
        .await;

    assert_eq!(controller.source_kind(), SourceKind::Simulated);
    assert!(controller.session().analysis_control_enabled);
    assert!(!controller.session().run_active);
    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        1
    );
    assert!(events.contains(&UiEvent::ConnectionChanged(ConnectionStatus::Disconnected)));

    controller
        .handle_source_event(SourceEvent::ConnectionChanged(ConnectionStatus::Disconnected))
        .await;
    let events = drain(&mut ui);
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        0
    );
}

fn connection_changes(events: &[UiEvent]) -> Vec<ConnectionStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            UiEvent::ConnectionChanged(status) => Some(*status),
            _ => None,
        })
        .collect()
}

fn local_settings(origin: String) -> ClientSettings {
    ClientSettings {
        page_host: "localhost".into(),
        local_origin: origin,
        connect_timeout: Duration::from_secs(5),
        ..ClientSettings::default()
    }
}

async fn hold_socket(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

#[tokio::test]
async fn connect_reports_connecting_before_the_live_socket_opens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws/:client_id", get(hold_socket));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (ui_events, mut ui) = broadcast::channel(64);
    let mut controller =
        SessionController::connect(local_settings(format!("http://{addr}")), ui_events).await;
    controller.announce();

    assert_eq!(controller.source_kind(), SourceKind::Live);
    assert_eq!(
        connection_changes(&drain(&mut ui)),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
}

#[tokio::test]
async fn connect_reports_failed_attempt_before_falling_back() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (ui_events, mut ui) = broadcast::channel(64);
    let mut controller =
        SessionController::connect(local_settings(format!("http://{addr}")), ui_events).await;
    controller.announce();

    assert_eq!(controller.source_kind(), SourceKind::Simulated);
    let events = drain(&mut ui);
    assert_eq!(
        connection_changes(&events),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connected,
        ]
    );
    assert_eq!(
        count(&events, |event| matches!(event, UiEvent::DegradedMode { .. })),
        1
    );
}

#[tokio::test]
async fn offline_connect_skips_the_connecting_state() {
    let settings = ClientSettings {
        offline: true,
        ..ClientSettings::default()
    };
    let (ui_events, mut ui) = broadcast::channel(64);
    let mut controller = SessionController::connect(settings, ui_events).await;
    controller.announce();

    assert_eq!(
        connection_changes(&drain(&mut ui)),
        vec![ConnectionStatus::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn run_loop_drives_a_simulated_analysis_to_results() {
    let settings = ClientSettings {
        offline: true,
        ..ClientSettings::default()
    };
    let controller = SessionController::new(
        Arc::new(SimulatedSource::new()),
        ClientId::generate(),
        settings,
    );
    let mut ui = controller.subscribe_ui();
    let (actions, actions_rx) = mpsc::channel(8);
    let running = tokio::spawn(controller.run(actions_rx));

    actions
        .send(UserAction::Validate("2330".into()))
        .await
        .expect("validate");

    let mut validated = false;
    let report = loop {
        let event = tokio::time::timeout(Duration::from_secs(120), ui.recv())
            .await
            .expect("ui event before timeout")
            .expect("ui channel open");
        match event {
            UiEvent::StockValidated(info) => {
                assert_eq!(info.name, "台積電");
                validated = true;
                actions
                    .send(UserAction::Analyze(String::new()))
                    .await
                    .expect("analyze");
            }
            UiEvent::ResultsReady(report) => break report,
            _ => {}
        }
    };
    assert!(validated);
    assert_eq!(report.stock_code.as_deref(), Some("2330"));
    assert_eq!(report.battle.and_then(|battle| battle.final_decision), Some("bullish".into()));

    drop(actions);
    running.await.expect("join").expect("controller stops cleanly");
}
