use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{AnalysisPhase, ConnectionStatus, StockCode},
    protocol::{BattleResult, StockInfo},
};

use crate::{barrier::CompletionBarrier, payload::AnalysisReport, progress::ProgressTracker};

/// Client-side state for one controller instance. Only the controller mutates it.
#[derive(Debug, Clone)]
pub struct Session {
    pub current_stock: Option<StockCode>,
    pub stock_info: Option<StockInfo>,
    pub connection_status: ConnectionStatus,
    pub analysis_phase: AnalysisPhase,
    pub progress: ProgressTracker,
    pub progress_percent: f64,
    pub barrier: CompletionBarrier,
    pub battle: Option<BattleResult>,
    pub battle_revealed: bool,
    pub raw_results: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set when `analysis_complete` arrived before the battle finished.
    pub pending_success: bool,
    pub report: Option<AnalysisReport>,
    pub analysis_control_enabled: bool,
    pub progress_panel_visible: bool,
    pub run_active: bool,
    /// Set once the backend confirms the current run with `analysis_started`.
    pub run_acknowledged: bool,
    pub watchdog_fired: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            current_stock: None,
            stock_info: None,
            connection_status: ConnectionStatus::Disconnected,
            analysis_phase: AnalysisPhase::Idle,
            progress: ProgressTracker::default(),
            progress_percent: 0.0,
            barrier: CompletionBarrier::default(),
            battle: None,
            battle_revealed: false,
            raw_results: None,
            started_at: None,
            pending_success: false,
            report: None,
            analysis_control_enabled: true,
            progress_panel_visible: false,
            run_active: false,
            run_acknowledged: false,
            watchdog_fired: false,
        }
    }
}

impl Session {
    /// Clears every per-run field and marks a run in flight.
    pub fn begin_run(&mut self) {
        self.analysis_phase = AnalysisPhase::Idle;
        self.progress.reset();
        self.progress_percent = 0.0;
        self.barrier.reset();
        self.battle = None;
        self.battle_revealed = false;
        self.raw_results = None;
        self.started_at = None;
        self.pending_success = false;
        self.report = None;
        self.analysis_control_enabled = false;
        self.progress_panel_visible = true;
        self.run_active = true;
        self.run_acknowledged = false;
        self.watchdog_fired = false;
    }

    /// Returns the view to its idle layout. Results already shown stay.
    pub fn end_run(&mut self) {
        self.run_active = false;
        self.analysis_control_enabled = true;
        self.progress_panel_visible = false;
        if self.connection_status == ConnectionStatus::Analyzing {
            self.connection_status = ConnectionStatus::Connected;
        }
    }

    pub fn is_battle_complete(&self) -> bool {
        self.barrier.battle_completed()
    }

    pub fn analysis_completed(&self) -> bool {
        self.barrier.analysis_completed()
    }

    pub fn results_displayed(&self) -> bool {
        self.barrier.has_fired()
    }
}
