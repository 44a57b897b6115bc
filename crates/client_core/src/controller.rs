//! The session controller: owns [`Session`], turns user actions into requests
//! and server events into [`UiEvent`]s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{
        AgentId, AgentStatus, AnalysisPhase, ConnectionStatus, PhaseKind, StockCode,
    },
    protocol::{ApiCredentials, BattleResult, ClientRequest, ServerEvent, StockInfo},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    barrier::{BarrierOutcome, CompletionSignal},
    config::ClientSettings,
    endpoint::ClientId,
    error::ControllerError,
    payload::{normalize_results, AnalysisReport},
    progress::{ProgressUpdate, BATTLE_MILESTONE_PERCENT},
    session::Session,
    simulated::SimulatedSource,
    select_source, AnalysisSource, SourceEvent, SourceKind, SourceSelection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ConnectionChanged(ConnectionStatus),
    Toast {
        level: ToastLevel,
        message: String,
    },
    StockValidated(StockInfo),
    ValidationFailed(String),
    AnalysisControl {
        enabled: bool,
    },
    ProgressPanel {
        visible: bool,
    },
    PhaseChanged {
        phase: AnalysisPhase,
        message: Option<String>,
    },
    AgentProgress {
        agent: AgentId,
        status: AgentStatus,
        percent: f64,
    },
    ProgressMilestone {
        percent: f64,
        text: String,
    },
    BattleRevealed,
    BattleResult(BattleResult),
    ResultsReady(Box<AnalysisReport>),
    /// The client is running without a usable backend or gave up waiting on it.
    DegradedMode {
        reason: String,
    },
    ApiResult {
        test: bool,
        success: bool,
        message: String,
        preview: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum UserAction {
    Validate(String),
    /// An empty code analyzes the last validated stock.
    Analyze(String),
    Cancel,
    ConfigureApi(ApiCredentials),
    TestApi(ApiCredentials),
}

enum Input {
    Action(UserAction),
    Source(SourceEvent),
    SourceLagged(u64),
    SourceClosed,
    Watchdog,
    Shutdown,
}

pub struct SessionController {
    session: Session,
    settings: ClientSettings,
    client_id: ClientId,
    source: Arc<dyn AnalysisSource>,
    source_events: broadcast::Receiver<SourceEvent>,
    source_closed: bool,
    swapped_to_simulated: bool,
    ui: broadcast::Sender<UiEvent>,
    pending_validation: Option<StockCode>,
    watchdog: Option<Instant>,
    startup_notice: Option<String>,
}

impl SessionController {
    pub fn new(
        source: Arc<dyn AnalysisSource>,
        client_id: ClientId,
        settings: ClientSettings,
    ) -> Self {
        let (ui, _) = broadcast::channel(1024);
        Self::with_ui(source, client_id, settings, ui)
    }

    /// Builds a controller that publishes on an existing UI channel.
    pub fn with_ui(
        source: Arc<dyn AnalysisSource>,
        client_id: ClientId,
        settings: ClientSettings,
        ui: broadcast::Sender<UiEvent>,
    ) -> Self {
        let mut session = Session::default();
        session.connection_status = if source.is_open() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        Self {
            session,
            settings,
            client_id,
            source_events: source.subscribe_events(),
            source,
            source_closed: false,
            swapped_to_simulated: false,
            ui,
            pending_validation: None,
            watchdog: None,
            startup_notice: None,
        }
    }

    pub fn from_selection(selection: SourceSelection, settings: ClientSettings) -> Self {
        let (ui, _) = broadcast::channel(1024);
        Self::from_selection_with_ui(selection, settings, ui)
    }

    fn from_selection_with_ui(
        selection: SourceSelection,
        settings: ClientSettings,
        ui: broadcast::Sender<UiEvent>,
    ) -> Self {
        let mut controller = Self::with_ui(selection.source, selection.client_id, settings, ui);
        controller.startup_notice = selection.fallback_reason;
        controller
    }

    /// Selects the analysis source while reporting the attempt on `ui`.
    ///
    /// Subscribers of `ui` see `Connecting` before the backend is dialed and
    /// `Disconnected` when the attempt fails. [`announce`](Self::announce)
    /// then reports the state of the source actually in use.
    pub async fn connect(settings: ClientSettings, ui: broadcast::Sender<UiEvent>) -> Self {
        if !settings.offline {
            let _ = ui.send(UiEvent::ConnectionChanged(ConnectionStatus::Connecting));
        }
        let selection = select_source(&settings).await;
        if selection.fallback_reason.is_some() {
            let _ = ui.send(UiEvent::ConnectionChanged(ConnectionStatus::Disconnected));
        }
        Self::from_selection_with_ui(selection, settings, ui)
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.watchdog
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    fn toast(&self, level: ToastLevel, message: impl Into<String>) {
        self.emit(UiEvent::Toast {
            level,
            message: message.into(),
        });
    }

    fn show_idle_controls(&self) {
        self.emit(UiEvent::AnalysisControl { enabled: true });
        self.emit(UiEvent::ProgressPanel { visible: false });
    }

    /// Emits the initial connection state. Called once before the loop starts
    /// so subscribers created after construction see it.
    pub fn announce(&mut self) {
        self.emit(UiEvent::ConnectionChanged(self.session.connection_status));
        if self.source.kind() == SourceKind::Simulated {
            let reason = match self.startup_notice.take() {
                Some(reason) => {
                    self.toast(
                        ToastLevel::Warning,
                        format!("backend unavailable, running in simulated mode: {reason}"),
                    );
                    reason
                }
                None => "offline mode".to_string(),
            };
            self.emit(UiEvent::DegradedMode { reason });
        }
    }

    async fn send(&self, request: ClientRequest) -> Result<(), ControllerError> {
        let kind = request.kind();
        self.source.send(request).await.map_err(|err| {
            error!(kind, "failed to send request: {err:#}");
            self.toast(ToastLevel::Error, format!("failed to send {kind}: {err}"));
            ControllerError::Source(err)
        })
    }

    pub async fn apply(&mut self, action: UserAction) -> Result<(), ControllerError> {
        match action {
            UserAction::Validate(code) => self.validate_stock(&code).await,
            UserAction::Analyze(code) => self.start_analysis(&code).await,
            UserAction::Cancel => self.cancel_analysis().await,
            UserAction::ConfigureApi(config) => self.configure_api(config).await,
            UserAction::TestApi(config) => self.test_api(config).await,
        }
    }

    pub async fn validate_stock(&mut self, raw: &str) -> Result<(), ControllerError> {
        let code = match StockCode::parse(raw) {
            Ok(code) => code,
            Err(err) => {
                self.emit(UiEvent::ValidationFailed(err.to_string()));
                self.toast(ToastLevel::Error, err.to_string());
                return Err(err.into());
            }
        };
        info!(stock_code = %code, "validating stock");
        self.pending_validation = Some(code.clone());
        self.send(ClientRequest::ValidateStock { stock_code: code })
            .await
    }

    pub async fn start_analysis(&mut self, raw: &str) -> Result<(), ControllerError> {
        if self.session.run_active && !self.session.analysis_control_enabled {
            let current = self
                .session
                .current_stock
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.toast(ToastLevel::Warning, format!("analysis for {current} is still running"));
            return Err(ControllerError::AnalysisInProgress(current));
        }

        let code = if raw.trim().is_empty() {
            match self.session.current_stock.clone() {
                Some(code) => code,
                None => {
                    self.toast(ToastLevel::Error, ControllerError::NoStockSelected.to_string());
                    return Err(ControllerError::NoStockSelected);
                }
            }
        } else {
            match StockCode::parse(raw) {
                Ok(code) => code,
                Err(err) => {
                    self.toast(ToastLevel::Error, err.to_string());
                    return Err(err.into());
                }
            }
        };

        if self
            .session
            .stock_info
            .as_ref()
            .is_some_and(|info| info.code != code.as_str())
        {
            self.session.stock_info = None;
        }
        self.session.current_stock = Some(code.clone());
        self.session.begin_run();
        self.watchdog = None;
        self.emit(UiEvent::AnalysisControl { enabled: false });
        self.emit(UiEvent::ProgressPanel { visible: true });
        for agent in AgentId::ALL {
            self.emit(UiEvent::AgentProgress {
                agent,
                status: AgentStatus::Waiting,
                percent: 0.0,
            });
        }

        info!(stock_code = %code, "starting analysis");
        let request = ClientRequest::StartAnalysis {
            stock_code: code,
            max_steps: self.settings.max_steps,
            debate_rounds: self.settings.debate_rounds,
        };
        if let Err(err) = self.send(request).await {
            self.session.end_run();
            self.show_idle_controls();
            return Err(err);
        }
        Ok(())
    }

    /// Best-effort cancel. Local state returns to idle whether or not the
    /// request reaches the backend.
    pub async fn cancel_analysis(&mut self) -> Result<(), ControllerError> {
        let was_running = self.session.run_active;
        if let (true, Some(code)) = (was_running, self.session.current_stock.clone()) {
            info!(stock_code = %code, "cancelling analysis");
            if let Err(err) = self
                .source
                .send(ClientRequest::CancelAnalysis { stock_code: code })
                .await
            {
                warn!("cancel request was not delivered: {err:#}");
            }
        }

        self.watchdog = None;
        self.session.end_run();
        self.session.analysis_phase = AnalysisPhase::Idle;
        self.session.pending_success = false;
        self.show_idle_controls();
        self.emit(UiEvent::ConnectionChanged(self.session.connection_status));
        if was_running {
            self.toast(ToastLevel::Info, "analysis cancelled");
        }
        Ok(())
    }

    pub async fn configure_api(&mut self, config: ApiCredentials) -> Result<(), ControllerError> {
        info!(provider = %config.provider, model = %config.model, "configuring model credentials");
        self.send(ClientRequest::ConfigureApi { config }).await
    }

    pub async fn test_api(&mut self, config: ApiCredentials) -> Result<(), ControllerError> {
        info!(provider = %config.provider, model = %config.model, "testing model credentials");
        self.send(ClientRequest::TestApi { config }).await
    }

    pub async fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Server(event) => self.handle_server_event(event),
            SourceEvent::Error(message) => warn!("analysis source reported: {message}"),
            SourceEvent::ConnectionChanged(ConnectionStatus::Disconnected) => {
                self.on_source_disconnected().await;
            }
            SourceEvent::ConnectionChanged(status) => {
                self.session.connection_status = status;
                self.emit(UiEvent::ConnectionChanged(status));
            }
        }
    }

    /// A dropped live socket switches the controller to the simulated source,
    /// once per controller lifetime.
    async fn on_source_disconnected(&mut self) {
        self.session.connection_status = ConnectionStatus::Disconnected;
        self.emit(UiEvent::ConnectionChanged(ConnectionStatus::Disconnected));

        if self.source.kind() != SourceKind::Live || self.swapped_to_simulated {
            return;
        }
        warn!(client_id = %self.client_id, "live backend disconnected; switching to simulated mode");
        if let Err(err) = self.source.shutdown().await {
            debug!("live source shutdown failed: {err:#}");
        }
        self.swap_source(Arc::new(SimulatedSource::new()));

        if self.session.run_active {
            self.watchdog = None;
            self.session.end_run();
            self.show_idle_controls();
        }
        self.session.connection_status = ConnectionStatus::Connected;
        self.emit(UiEvent::ConnectionChanged(ConnectionStatus::Connected));
        let reason = "connection to the analysis backend was lost".to_string();
        self.toast(
            ToastLevel::Warning,
            format!("{reason}; continuing in simulated mode"),
        );
        self.emit(UiEvent::DegradedMode { reason });
    }

    fn swap_source(&mut self, source: Arc<dyn AnalysisSource>) {
        self.source_events = source.subscribe_events();
        self.source = source;
        self.source_closed = false;
        self.swapped_to_simulated = true;
    }

    pub fn handle_server_event(&mut self, event: ServerEvent) {
        debug!(kind = event.kind(), "handling server event");
        match event {
            ServerEvent::ValidationResult {
                valid,
                stock_info,
                message,
            } => self.on_validation_result(valid, stock_info, message),
            ServerEvent::Error { message } => self.on_backend_error(message),
            ServerEvent::ApiConfigResult {
                success, message, ..
            } => self.on_api_result(false, success, message, None),
            ServerEvent::ApiTestResult {
                success,
                message,
                response_preview,
            } => self.on_api_result(true, success, message, response_preview),
            event if !self.session.run_active => {
                debug!(kind = event.kind(), "ignoring event outside an active analysis");
            }
            event if !self.belongs_to_current_run(&event) => {
                debug!(
                    kind = event.kind(),
                    stock_code = ?self.session.current_stock,
                    "dropping event that does not belong to the current analysis"
                );
            }
            ServerEvent::AnalysisStarted { timestamp, .. } => self.on_analysis_started(timestamp),
            ServerEvent::PhaseStarted { phase, message } => {
                self.session.analysis_phase = phase.into();
                self.emit(UiEvent::PhaseChanged {
                    phase: self.session.analysis_phase,
                    message,
                });
            }
            ServerEvent::PhaseCompleted { phase, .. } => self.on_phase_completed(phase),
            ServerEvent::AgentProgress { agent, status, .. } => {
                self.on_agent_progress(&agent, status.into())
            }
            ServerEvent::BattleStarted { message } => self.on_battle_started(message),
            ServerEvent::BattleResults {
                final_decision,
                vote_count,
                debate_rounds,
            } => self.on_battle_results(BattleResult {
                final_decision,
                vote_count: vote_count.unwrap_or_default(),
                debate_rounds,
            }),
            ServerEvent::AnalysisComplete { results, .. } => self.on_analysis_complete(results),
        }
    }

    /// Until `analysis_started` names the current stock, nothing else of the
    /// run is trusted. Completion is also checked against the stock code.
    fn belongs_to_current_run(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::AnalysisStarted { stock_code, .. } => {
                self.is_current_stock(stock_code.as_deref())
            }
            ServerEvent::AnalysisComplete { stock_code, .. } => {
                self.session.run_acknowledged && self.is_current_stock(stock_code.as_deref())
            }
            _ => self.session.run_acknowledged,
        }
    }

    fn is_current_stock(&self, code: Option<&str>) -> bool {
        match (code, &self.session.current_stock) {
            (Some(code), Some(current)) => code.trim() == current.as_str(),
            _ => true,
        }
    }

    fn on_validation_result(
        &mut self,
        valid: bool,
        stock_info: Option<StockInfo>,
        message: Option<String>,
    ) {
        let pending = self.pending_validation.take();
        if !valid {
            let message = message.unwrap_or_else(|| "stock code not found".to_string());
            warn!("stock validation failed: {message}");
            self.emit(UiEvent::ValidationFailed(message.clone()));
            self.toast(ToastLevel::Error, message);
            return;
        }

        let mut info = stock_info.unwrap_or_default();
        if info.code.is_empty() {
            if let Some(code) = &pending {
                info.code = code.to_string();
            }
        }
        let code = StockCode::parse(&info.code).ok().or(pending);
        info!(stock_code = %info.code, name = %info.name, "stock validated");
        self.session.current_stock = code;
        self.session.stock_info = Some(info.clone());
        self.toast(
            ToastLevel::Success,
            format!("{} ({}) validated", info.name, info.code),
        );
        self.emit(UiEvent::StockValidated(info));
    }

    fn on_analysis_started(&mut self, timestamp: Option<String>) {
        self.session.run_acknowledged = true;
        self.session.started_at = Some(
            timestamp
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        );
        self.session.connection_status = ConnectionStatus::Analyzing;
        self.emit(UiEvent::ConnectionChanged(ConnectionStatus::Analyzing));
    }

    fn on_phase_completed(&mut self, phase: PhaseKind) {
        if phase != PhaseKind::Report
            || self.session.analysis_completed()
            || self.session.watchdog_fired
        {
            return;
        }
        let Some(deadline) = Instant::now().checked_add(self.settings.report_watchdog) else {
            warn!(
                timeout_secs = self.settings.report_watchdog.as_secs(),
                "report watchdog timeout out of range, not arming"
            );
            return;
        };
        debug!(
            timeout_secs = self.settings.report_watchdog.as_secs(),
            "report phase done, waiting for analysis_complete"
        );
        self.watchdog = Some(deadline);
    }

    fn on_agent_progress(&mut self, wire_name: &str, next: AgentStatus) {
        let Some(agent) = AgentId::from_wire(wire_name) else {
            warn!(agent = wire_name, "progress for unknown agent dropped");
            return;
        };
        match self.session.progress.advance(agent, next) {
            ProgressUpdate::Advanced { to, .. } => {
                self.session.progress_percent = self
                    .session
                    .progress_percent
                    .max(self.session.progress.percent());
                self.emit(UiEvent::AgentProgress {
                    agent,
                    status: to,
                    percent: self.session.progress_percent,
                });
            }
            ProgressUpdate::Ignored { current } => {
                warn!(agent = %agent, ?current, ?next, "ignoring agent status regression");
            }
        }
    }

    fn on_battle_started(&mut self, message: Option<String>) {
        self.session.progress_percent = self
            .session
            .progress_percent
            .max(BATTLE_MILESTONE_PERCENT);
        self.session.battle_revealed = true;
        self.emit(UiEvent::ProgressMilestone {
            percent: self.session.progress_percent,
            text: message.unwrap_or_else(|| "agents are debating".to_string()),
        });
        self.emit(UiEvent::BattleRevealed);
    }

    fn on_battle_results(&mut self, battle: BattleResult) {
        if self.session.is_battle_complete() {
            warn!("duplicate battle_results ignored");
            return;
        }
        info!(
            decision = battle.final_decision.as_deref().unwrap_or("unknown"),
            votes = battle.total_votes(),
            "battle finished"
        );
        self.session.battle = Some(battle.clone());
        self.emit(UiEvent::BattleResult(battle));
        self.mark_completion(CompletionSignal::Battle);
    }

    fn on_analysis_complete(&mut self, results: Value) {
        self.watchdog = None;
        self.session.raw_results = Some(results);
        self.mark_completion(CompletionSignal::Analysis);
    }

    fn mark_completion(&mut self, signal: CompletionSignal) {
        match self.session.barrier.mark(signal) {
            BarrierOutcome::Waiting => {
                if signal == CompletionSignal::Analysis {
                    self.session.pending_success = true;
                }
                debug!(?signal, "completion recorded, waiting for the other signal");
            }
            BarrierOutcome::Fire => self.display_results(),
            BarrierOutcome::AlreadyFired => debug!(?signal, "results already displayed"),
        }
    }

    fn display_results(&mut self) {
        let results = self.session.raw_results.clone().unwrap_or(Value::Null);
        let report = normalize_results(
            &results,
            self.session.battle.as_ref(),
            self.session.stock_info.as_ref(),
        );
        self.session.analysis_phase = AnalysisPhase::Complete;
        self.session.progress_percent = 100.0;
        self.session.pending_success = false;
        self.session.report = Some(report.clone());
        self.session.end_run();

        let code = self
            .session
            .current_stock
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(stock_code = %code, "analysis results displayed");
        self.emit(UiEvent::PhaseChanged {
            phase: AnalysisPhase::Complete,
            message: None,
        });
        self.emit(UiEvent::ResultsReady(Box::new(report)));
        self.show_idle_controls();
        self.emit(UiEvent::ConnectionChanged(self.session.connection_status));
        self.toast(ToastLevel::Success, format!("analysis of {code} complete"));
    }

    fn on_backend_error(&mut self, message: String) {
        error!("backend error: {message}");
        self.toast(ToastLevel::Error, message);
        if self.session.run_active {
            self.watchdog = None;
            self.session.end_run();
            self.emit(UiEvent::ConnectionChanged(self.session.connection_status));
        }
        self.session.analysis_control_enabled = true;
        self.show_idle_controls();
    }

    fn on_api_result(
        &mut self,
        test: bool,
        success: bool,
        message: Option<String>,
        preview: Option<String>,
    ) {
        let action = if test { "credential test" } else { "credential configuration" };
        let message = message.unwrap_or_else(|| {
            if success {
                format!("{action} succeeded")
            } else {
                format!("{action} failed")
            }
        });
        let level = if success {
            ToastLevel::Success
        } else {
            ToastLevel::Error
        };
        self.toast(level, message.clone());
        self.emit(UiEvent::ApiResult {
            test,
            success,
            message,
            preview,
        });
    }

    /// Fires the report watchdog if its deadline has passed. Returns whether
    /// it fired; a fired watchdog is disarmed.
    pub fn check_watchdog(&mut self, now: Instant) -> bool {
        match self.watchdog {
            Some(deadline) if deadline <= now => {
                self.on_watchdog_expired();
                true
            }
            _ => false,
        }
    }

    fn on_watchdog_expired(&mut self) {
        self.watchdog = None;
        if self.session.analysis_completed() || self.session.watchdog_fired {
            return;
        }
        self.session.watchdog_fired = true;
        let reason = format!(
            "no analysis_complete within {}s of the report phase",
            self.settings.report_watchdog.as_secs()
        );
        warn!("{reason}");
        self.session.analysis_control_enabled = true;
        self.emit(UiEvent::AnalysisControl { enabled: true });
        self.toast(
            ToastLevel::Warning,
            "the report is taking longer than expected; results may be incomplete",
        );
        self.emit(UiEvent::DegradedMode { reason });
    }

    async fn next_input(&mut self, actions: &mut mpsc::Receiver<UserAction>) -> Input {
        let deadline = self.watchdog;
        let source_open = !self.source_closed;
        tokio::select! {
            action = actions.recv() => match action {
                Some(action) => Input::Action(action),
                None => Input::Shutdown,
            },
            event = self.source_events.recv(), if source_open => match event {
                Ok(event) => Input::Source(event),
                Err(RecvError::Lagged(skipped)) => Input::SourceLagged(skipped),
                Err(RecvError::Closed) => Input::SourceClosed,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Input::Watchdog
            }
        }
    }

    /// Runs until the action channel closes, then shuts the source down.
    pub async fn run(mut self, mut actions: mpsc::Receiver<UserAction>) -> anyhow::Result<()> {
        self.announce();
        loop {
            match self.next_input(&mut actions).await {
                Input::Action(action) => {
                    if let Err(err) = self.apply(action).await {
                        debug!("user action rejected: {err}");
                    }
                }
                Input::Source(event) => self.handle_source_event(event).await,
                Input::SourceLagged(skipped) => {
                    warn!(skipped, "controller fell behind the analysis source");
                }
                Input::SourceClosed => {
                    self.source_closed = true;
                    self.handle_source_event(SourceEvent::ConnectionChanged(
                        ConnectionStatus::Disconnected,
                    ))
                    .await;
                }
                Input::Watchdog => {
                    self.check_watchdog(Instant::now());
                }
                Input::Shutdown => break,
            }
        }
        info!(client_id = %self.client_id, "session controller stopping");
        self.source.shutdown().await
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
