//! Boundary normalization of `analysis_complete` payloads.
//!
//! The backend reports each agent either as a bare string or as an object with
//! any of `agent_output`, `raw_output` and `tool_data`. Everything is folded
//! into [`AgentReport`] here so the view never inspects raw JSON.

use std::{collections::BTreeMap, sync::OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::AgentId,
    protocol::{BattleResult, StockInfo},
};
use tracing::warn;

use crate::chart::{extract_price_records, PriceChart};

/// Commentary shorter than this is treated as missing.
pub const MIN_COMMENTARY_CHARS: usize = 30;

const TOOL_SEGMENT_PREFIXES: [&str; 2] = ["Observed output of cmd", "Calling tool"];

fn step_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Step \d+:\s*").expect("step marker pattern compiles"))
}

fn blank_runs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n{3,}").expect("blank run pattern compiles"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commentary {
    Text(String),
    /// The agent itself failed; carries the backend's error text.
    Failed(String),
    /// Nothing readable was left after stripping tool transcripts.
    Insufficient,
}

impl Commentary {
    pub fn text(&self) -> Option<&str> {
        match self {
            Commentary::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub agent: AgentId,
    pub commentary: Commentary,
    pub raw_output: Option<String>,
    pub tool_data: Option<Value>,
}

impl AgentReport {
    pub fn missing(agent: AgentId) -> Self {
        Self {
            agent,
            commentary: Commentary::Insufficient,
            raw_output: None,
            tool_data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAgentPayload {
    Text(String),
    Structured {
        #[serde(default)]
        agent_output: Option<Value>,
        #[serde(default)]
        raw_output: Option<Value>,
        #[serde(default)]
        tool_data: Option<Value>,
    },
}

/// Normalized results of one analysis run, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub stock_code: Option<String>,
    pub stock_info: Option<StockInfo>,
    pub agents: BTreeMap<AgentId, AgentReport>,
    pub battle: Option<BattleResult>,
    pub chart: Option<PriceChart>,
    pub report_paths: BTreeMap<String, String>,
}

impl AnalysisReport {
    pub fn agent(&self, agent: AgentId) -> Option<&AgentReport> {
        self.agents.get(&agent)
    }
}

pub fn normalize_agent_payload(agent: AgentId, payload: &Value) -> AgentReport {
    let raw = match RawAgentPayload::deserialize(payload) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(agent = %agent, "unrecognized agent payload shape: {err}");
            return AgentReport::missing(agent);
        }
    };

    match raw {
        RawAgentPayload::Text(text) => {
            let commentary = match text.trim().strip_prefix("Error:") {
                Some(reason) => Commentary::Failed(reason.trim().to_string()),
                None => best_commentary([Some(text.as_str())]),
            };
            AgentReport {
                agent,
                commentary,
                raw_output: Some(text),
                tool_data: None,
            }
        }
        RawAgentPayload::Structured {
            agent_output,
            raw_output,
            tool_data,
        } => {
            let agent_output = agent_output.as_ref().and_then(value_text);
            let raw_output = raw_output.as_ref().and_then(value_text);
            let commentary = best_commentary([agent_output.as_deref(), raw_output.as_deref()]);
            AgentReport {
                agent,
                commentary,
                raw_output,
                tool_data: tool_data.and_then(normalize_tool_data),
            }
        }
    }
}

/// Builds the display model from the `results` object of `analysis_complete`.
/// Agent payloads live under `research`, or at the top level for older backends.
pub fn normalize_results(
    results: &Value,
    battle_fallback: Option<&BattleResult>,
    stock_info: Option<&StockInfo>,
) -> AnalysisReport {
    let research = results
        .get("research")
        .filter(|value| value.is_object())
        .unwrap_or(results);

    let mut agents = BTreeMap::new();
    for agent in AgentId::ALL {
        let report = match research.get(agent.wire_name()) {
            Some(payload) => normalize_agent_payload(agent, payload),
            None => AgentReport::missing(agent),
        };
        agents.insert(agent, report);
    }

    let battle = results
        .get("battle")
        .filter(|value| value.as_object().is_some_and(|map| !map.is_empty()))
        .and_then(|value| match BattleResult::deserialize(value) {
            Ok(battle) => Some(battle),
            Err(err) => {
                warn!("ignoring malformed battle entry in results: {err}");
                None
            }
        })
        .or_else(|| battle_fallback.cloned());

    let report_paths = results
        .get("reports")
        .and_then(Value::as_object)
        .map(|paths| {
            paths
                .iter()
                .filter_map(|(kind, path)| Some((kind.clone(), path.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let chart = agents.get(&AgentId::Technical).and_then(|report| {
        let records =
            extract_price_records(report.tool_data.as_ref(), report.raw_output.as_deref());
        PriceChart::from_records(&records)
    });

    AnalysisReport {
        stock_code: results
            .get("stock_code")
            .and_then(Value::as_str)
            .map(str::to_string),
        stock_info: stock_info.cloned(),
        agents,
        battle,
        chart,
        report_paths,
    }
}

/// Removes `Step N: Observed output of cmd ...` and `Step N: Calling tool ...`
/// blocks, then drops the remaining `Step N:` prefixes.
pub fn strip_tool_transcript(text: &str) -> String {
    let marker = step_marker();
    let mut kept = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut keep_current = true;

    for found in marker.find_iter(text) {
        if keep_current {
            kept.push_str(&text[cursor..found.start()]);
        }
        let segment = &text[found.end()..];
        keep_current = !TOOL_SEGMENT_PREFIXES
            .iter()
            .any(|prefix| segment.starts_with(prefix));
        if keep_current {
            kept.push('\n');
        }
        cursor = found.end();
    }
    if keep_current {
        kept.push_str(&text[cursor..]);
    }

    blank_runs().replace_all(&kept, "\n\n").trim().to_string()
}

fn best_commentary<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Commentary {
    candidates
        .into_iter()
        .flatten()
        .map(strip_tool_transcript)
        .filter(|text| is_plausible_prose(text))
        .max_by_key(|text| text.chars().count())
        .map(Commentary::Text)
        .unwrap_or(Commentary::Insufficient)
}

fn is_plausible_prose(text: &str) -> bool {
    if text.chars().count() < MIN_COMMENTARY_CHARS {
        return false;
    }
    if text.starts_with('{') || text.starts_with('[') {
        return false;
    }
    text.chars().any(char::is_alphabetic)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn normalize_tool_data(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => Some(parsed),
            _ => Some(Value::String(text)),
        },
        other => Some(other),
    }
}

#[cfg(test)]
#[path = "tests/payload_tests.rs"]
mod tests;
