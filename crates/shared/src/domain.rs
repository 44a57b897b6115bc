use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StockCodeError;

fn stock_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{4,6}$").expect("stock code pattern compiles"))
}

/// Returns true iff `code` is 4 to 6 ASCII digits with nothing else around it.
pub fn is_valid_format(code: &str) -> bool {
    stock_code_pattern().is_match(code)
}

/// Advisory feedback for partially typed input. Never blocks submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputHint {
    Empty,
    NonDigit,
    TooShort,
    TooLong,
    Ready,
}

impl InputHint {
    pub fn message(self) -> &'static str {
        match self {
            InputHint::Empty => "enter a stock code",
            InputHint::NonDigit => "stock codes contain digits only",
            InputHint::TooShort => "stock codes have at least 4 digits",
            InputHint::TooLong => "stock codes have at most 6 digits",
            InputHint::Ready => "press enter to validate",
        }
    }
}

pub fn input_hint(raw: &str) -> InputHint {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        InputHint::Empty
    } else if !trimmed.chars().all(|c| c.is_ascii_digit()) {
        InputHint::NonDigit
    } else if trimmed.len() < 4 {
        InputHint::TooShort
    } else if trimmed.len() > 6 {
        InputHint::TooLong
    } else {
        InputHint::Ready
    }
}

/// A syntactically valid exchange stock code (4 to 6 digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StockCode(String);

impl StockCode {
    pub fn parse(raw: &str) -> Result<Self, StockCodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StockCodeError::Empty);
        }
        if !is_valid_format(trimmed) {
            return Err(StockCodeError::InvalidFormat(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StockCode {
    type Err = StockCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StockCode {
    type Error = StockCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StockCode> for String {
    fn from(value: StockCode) -> Self {
        value.0
    }
}

/// The six analyst roles whose progress and output the backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Sentiment,
    Risk,
    InstitutionalInvestor,
    Technical,
    ChipAnalysis,
    BigDeal,
}

impl AgentId {
    pub const ALL: [AgentId; 6] = [
        AgentId::Sentiment,
        AgentId::Risk,
        AgentId::InstitutionalInvestor,
        AgentId::Technical,
        AgentId::ChipAnalysis,
        AgentId::BigDeal,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn wire_name(self) -> &'static str {
        match self {
            AgentId::Sentiment => "sentiment",
            AgentId::Risk => "risk",
            AgentId::InstitutionalInvestor => "institutional_investor",
            AgentId::Technical => "technical",
            AgentId::ChipAnalysis => "chip_analysis",
            AgentId::BigDeal => "big_deal",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentId::Sentiment => "Sentiment",
            AgentId::Risk => "Risk Control",
            AgentId::InstitutionalInvestor => "Institutional Investors",
            AgentId::Technical => "Technical Analysis",
            AgentId::ChipAnalysis => "Chip Distribution",
            AgentId::BigDeal => "Big Deal Flow",
        }
    }

    /// Accepts both the short result keys and the backend's `*_agent` names.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim() {
            "sentiment" | "sentiment_agent" => Some(AgentId::Sentiment),
            "risk" | "risk_control" | "risk_control_agent" => Some(AgentId::Risk),
            "institutional_investor" | "institutional_investor_agent" => {
                Some(AgentId::InstitutionalInvestor)
            }
            "technical" | "technical_analysis" | "technical_analysis_agent" => {
                Some(AgentId::Technical)
            }
            "chip_analysis" | "chip_analysis_agent" => Some(AgentId::ChipAnalysis),
            "big_deal" | "big_deal_analysis" | "big_deal_analysis_agent" => Some(AgentId::BigDeal),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            AgentId::Sentiment => 0,
            AgentId::Risk => 1,
            AgentId::InstitutionalInvestor => 2,
            AgentId::Technical => 3,
            AgentId::ChipAnalysis => 4,
            AgentId::BigDeal => 5,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Per-run progress of one agent. Ordered so that a transition is valid only
/// when it moves to a strictly greater rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentStatus {
    #[default]
    Waiting,
    Started,
    Completed,
    Failed,
}

impl AgentStatus {
    fn rank(self) -> u8 {
        match self {
            AgentStatus::Waiting => 0,
            AgentStatus::Started => 1,
            AgentStatus::Completed | AgentStatus::Failed => 2,
        }
    }

    pub fn can_advance_to(self, next: AgentStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }
}

/// Status values carried by `agent_progress` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProgressStatus {
    Started,
    Completed,
    Error,
}

impl From<AgentProgressStatus> for AgentStatus {
    fn from(value: AgentProgressStatus) -> Self {
        match value {
            AgentProgressStatus::Started => AgentStatus::Started,
            AgentProgressStatus::Completed => AgentStatus::Completed,
            AgentProgressStatus::Error => AgentStatus::Failed,
        }
    }
}

/// Backend pipeline stages announced by `phase_started` / `phase_completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Research,
    Battle,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisPhase {
    #[default]
    Idle,
    Research,
    Battle,
    Report,
    Complete,
}

impl From<PhaseKind> for AnalysisPhase {
    fn from(value: PhaseKind) -> Self {
        match value {
            PhaseKind::Research => AnalysisPhase::Research,
            PhaseKind::Battle => AnalysisPhase::Battle,
            PhaseKind::Report => AnalysisPhase::Report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Analyzing,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Analyzing => "analyzing",
        };
        f.write_str(label)
    }
}
