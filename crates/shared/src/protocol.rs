use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::domain::{AgentProgressStatus, PhaseKind, StockCode};

/// Model credentials forwarded to the backend ahead of an analysis.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiCredentials {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

impl ApiCredentials {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        }
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Drop for ApiCredentials {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    ValidateStock {
        stock_code: StockCode,
    },
    StartAnalysis {
        stock_code: StockCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debate_rounds: Option<u32>,
    },
    CancelAnalysis {
        stock_code: StockCode,
    },
    ConfigureApi {
        config: ApiCredentials,
    },
    TestApi {
        config: ApiCredentials,
    },
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::ValidateStock { .. } => "validate_stock",
            ClientRequest::StartAnalysis { .. } => "start_analysis",
            ClientRequest::CancelAnalysis { .. } => "cancel_analysis",
            ClientRequest::ConfigureApi { .. } => "configure_api",
            ClientRequest::TestApi { .. } => "test_api",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub industry: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleResult {
    #[serde(default)]
    pub final_decision: Option<String>,
    #[serde(default)]
    pub vote_count: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debate_rounds: Option<u32>,
}

impl BattleResult {
    pub fn total_votes(&self) -> u32 {
        self.vote_count.values().sum()
    }

    /// Share of the vote for `label`, in percent rounded to one decimal.
    pub fn vote_share(&self, label: &str) -> f64 {
        let total = self.total_votes();
        if total == 0 {
            return 0.0;
        }
        let count = self.vote_count.get(label).copied().unwrap_or_default();
        (f64::from(count) / f64::from(total) * 1000.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ValidationResult {
        valid: bool,
        #[serde(default)]
        stock_info: Option<StockInfo>,
        #[serde(default)]
        message: Option<String>,
    },
    AnalysisStarted {
        #[serde(default)]
        stock_code: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    PhaseStarted {
        phase: PhaseKind,
        #[serde(default)]
        message: Option<String>,
    },
    PhaseCompleted {
        phase: PhaseKind,
        #[serde(default)]
        message: Option<String>,
    },
    AgentProgress {
        agent: String,
        status: AgentProgressStatus,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
    },
    BattleStarted {
        #[serde(default)]
        message: Option<String>,
    },
    BattleResults {
        #[serde(default)]
        final_decision: Option<String>,
        #[serde(default)]
        vote_count: Option<BTreeMap<String, u32>>,
        #[serde(default)]
        debate_rounds: Option<u32>,
    },
    AnalysisComplete {
        #[serde(default)]
        stock_code: Option<String>,
        #[serde(default)]
        results: serde_json::Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ApiConfigResult {
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    ApiTestResult {
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        response_preview: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ValidationResult { .. } => "validation_result",
            ServerEvent::AnalysisStarted { .. } => "analysis_started",
            ServerEvent::PhaseStarted { .. } => "phase_started",
            ServerEvent::PhaseCompleted { .. } => "phase_completed",
            ServerEvent::AgentProgress { .. } => "agent_progress",
            ServerEvent::BattleStarted { .. } => "battle_started",
            ServerEvent::BattleResults { .. } => "battle_results",
            ServerEvent::AnalysisComplete { .. } => "analysis_complete",
            ServerEvent::ApiConfigResult { .. } => "api_config_result",
            ServerEvent::ApiTestResult { .. } => "api_test_result",
            ServerEvent::Error { .. } => "error",
        }
    }
}
