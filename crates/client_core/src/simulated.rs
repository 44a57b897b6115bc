//! Local stand-in for the analysis backend, used when no socket can be opened.

use std::{collections::BTreeMap, ops::RangeInclusive, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, Utc};
use rand::Rng;
use serde_json::{json, Value};
use shared::{
    domain::{is_valid_format, AgentId, AgentProgressStatus, PhaseKind, StockCode},
    protocol::{ApiCredentials, ClientRequest, ServerEvent, StockInfo},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{AnalysisSource, SourceEvent, SourceKind};

/// Codes the offline validator knows about: (code, name, industry).
pub const KNOWN_STOCKS: [(&str, &str, &str); 10] = [
    ("2330", "台積電", "半導體業"),
    ("2317", "鴻海", "電子零組件業"),
    ("2454", "聯發科", "半導體業"),
    ("3008", "大立光", "光學鏡頭業"),
    ("2881", "富邦金", "金融保險業"),
    ("2882", "國泰金", "金融保險業"),
    ("2412", "中華電", "通信網路業"),
    ("2308", "台達電", "電源供應器"),
    ("2303", "聯電", "半導體業"),
    ("1301", "台塑", "塑膠工業"),
];

const SIMULATED_KLINE_DAYS: u64 = 30;

pub fn lookup_known_stock(code: &str) -> Option<StockInfo> {
    KNOWN_STOCKS
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(code, name, industry)| StockInfo {
            code: code.to_string(),
            name: name.to_string(),
            industry: industry.to_string(),
        })
}

/// Format check followed by a lookup in [`KNOWN_STOCKS`].
pub fn validate_offline(code: &str) -> Result<StockInfo, String> {
    let code = code.trim();
    if !is_valid_format(code) {
        return Err(format!("invalid stock code format: {code}"));
    }
    lookup_known_stock(code).ok_or_else(|| format!("stock code {code} not found (offline mode)"))
}

#[derive(Debug, Clone)]
pub struct SimulationTiming {
    pub validation_delay: Duration,
    pub phase_delay: Duration,
    /// Each agent finishes after a random delay drawn from this range.
    pub agent_delay_ms: RangeInclusive<u64>,
}

impl Default for SimulationTiming {
    fn default() -> Self {
        Self {
            validation_delay: Duration::from_millis(500),
            phase_delay: Duration::from_millis(1000),
            agent_delay_ms: 2000..=4000,
        }
    }
}

impl SimulationTiming {
    fn agent_delay(&self) -> Duration {
        let millis = rand::thread_rng().gen_range(self.agent_delay_ms.clone());
        Duration::from_millis(millis)
    }
}

pub struct SimulatedSource {
    events: broadcast::Sender<SourceEvent>,
    timing: SimulationTiming,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::with_timing(SimulationTiming::default())
    }

    pub fn with_timing(timing: SimulationTiming) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            timing,
            running: Mutex::new(None),
        }
    }

    async fn abort_running(&self) -> bool {
        match self.running.lock().await.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }

    fn reply_offline_config(&self, request: &ClientRequest, config: &ApiCredentials) {
        let message = Some("offline mode: credentials were not forwarded".to_string());
        let event = match request {
            ClientRequest::TestApi { .. } => ServerEvent::ApiTestResult {
                success: false,
                message,
                response_preview: None,
            },
            _ => ServerEvent::ApiConfigResult {
                success: false,
                message,
                provider: Some(config.provider.clone()),
                model: Some(config.model.clone()),
            },
        };
        let _ = self.events.send(SourceEvent::Server(event));
    }
}

#[async_trait]
impl AnalysisSource for SimulatedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn send(&self, request: ClientRequest) -> Result<()> {
        debug!(kind = request.kind(), "simulated source received request");
        match &request {
            ClientRequest::ValidateStock { stock_code } => {
                let events = self.events.clone();
                let delay = self.timing.validation_delay;
                let code = stock_code.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let event = match validate_offline(code.as_str()) {
                        Ok(info) => ServerEvent::ValidationResult {
                            valid: true,
                            stock_info: Some(info),
                            message: None,
                        },
                        Err(message) => ServerEvent::ValidationResult {
                            valid: false,
                            stock_info: None,
                            message: Some(message),
                        },
                    };
                    let _ = events.send(SourceEvent::Server(event));
                });
            }
            ClientRequest::StartAnalysis {
                stock_code,
                debate_rounds,
                ..
            } => {
                self.abort_running().await;
                info!(stock_code = %stock_code, "starting simulated analysis");
                let script = AnalysisScript {
                    events: self.events.clone(),
                    timing: self.timing.clone(),
                    stock_code: stock_code.clone(),
                    debate_rounds: debate_rounds.unwrap_or(2),
                };
                *self.running.lock().await = Some(tokio::spawn(script.play()));
            }
            ClientRequest::CancelAnalysis { stock_code } => {
                if self.abort_running().await {
                    info!(stock_code = %stock_code, "simulated analysis cancelled");
                }
            }
            ClientRequest::ConfigureApi { config } | ClientRequest::TestApi { config } => {
                self.reply_offline_config(&request, config);
            }
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        self.abort_running().await;
        Ok(())
    }
}

struct AnalysisScript {
    events: broadcast::Sender<SourceEvent>,
    timing: SimulationTiming,
    stock_code: StockCode,
    debate_rounds: u32,
}

impl AnalysisScript {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(SourceEvent::Server(event));
    }

    async fn pause(&self) {
        tokio::time::sleep(self.timing.phase_delay).await;
    }

    async fn play(self) {
        let code = self.stock_code.as_str().to_string();
        let info = lookup_known_stock(&code).unwrap_or_else(|| StockInfo {
            code: code.clone(),
            name: code.clone(),
            industry: String::new(),
        });

        self.emit(ServerEvent::AnalysisStarted {
            stock_code: Some(code.clone()),
            timestamp: Some(Utc::now().to_rfc3339()),
        });
        self.emit(ServerEvent::PhaseStarted {
            phase: PhaseKind::Research,
            message: Some("research agents are collecting data".into()),
        });

        let total = AgentId::COUNT as f64;
        for (index, agent) in AgentId::ALL.into_iter().enumerate() {
            self.emit(ServerEvent::AgentProgress {
                agent: agent.wire_name().to_string(),
                status: AgentProgressStatus::Started,
                message: Some(format!("{} started", agent.display_name())),
                progress: Some(index as f64 / total * 100.0),
            });
            let delay = self.timing.agent_delay();
            tokio::time::sleep(delay).await;
            self.emit(ServerEvent::AgentProgress {
                agent: agent.wire_name().to_string(),
                status: AgentProgressStatus::Completed,
                message: Some(format!("{} finished", agent.display_name())),
                progress: Some((index + 1) as f64 / total * 100.0),
            });
        }
        self.emit(ServerEvent::PhaseCompleted {
            phase: PhaseKind::Research,
            message: None,
        });

        self.pause().await;
        self.emit(ServerEvent::PhaseStarted {
            phase: PhaseKind::Battle,
            message: Some("agents are debating".into()),
        });
        self.emit(ServerEvent::BattleStarted {
            message: Some(format!("{} debate rounds", self.debate_rounds)),
        });
        self.pause().await;
        let votes = canned_votes();
        self.emit(ServerEvent::BattleResults {
            final_decision: Some("bullish".into()),
            vote_count: Some(votes.clone()),
            debate_rounds: Some(self.debate_rounds),
        });
        self.emit(ServerEvent::PhaseCompleted {
            phase: PhaseKind::Battle,
            message: None,
        });

        self.emit(ServerEvent::PhaseStarted {
            phase: PhaseKind::Report,
            message: Some("writing report".into()),
        });
        self.pause().await;
        self.emit(ServerEvent::PhaseCompleted {
            phase: PhaseKind::Report,
            message: None,
        });
        self.emit(ServerEvent::AnalysisComplete {
            stock_code: Some(code.clone()),
            results: canned_results(&info, &votes, self.debate_rounds),
            timestamp: Some(Utc::now().to_rfc3339()),
        });
        info!(stock_code = %code, "simulated analysis finished");
    }
}

fn canned_votes() -> BTreeMap<String, u32> {
    BTreeMap::from([("bullish".to_string(), 4), ("bearish".to_string(), 2)])
}

fn canned_commentary(agent: AgentId, info: &StockInfo) -> String {
    let name = &info.name;
    match agent {
        AgentId::Sentiment => format!(
            "News flow around {name} stays constructive; forum and media tone leans positive this week."
        ),
        AgentId::Risk => format!(
            "{name} shows moderate volatility with no abnormal credit or margin pressure in the window."
        ),
        AgentId::InstitutionalInvestor => format!(
            "Foreign investors were net buyers of {name} on most of the last ten sessions."
        ),
        AgentId::Technical => format!(
            "{name} trades above its 20-day average; momentum is positive but extended near resistance."
        ),
        AgentId::ChipAnalysis => format!(
            "Shareholding concentration in {name} edged up while retail margin balances declined."
        ),
        AgentId::BigDeal => format!(
            "Block trades in {name} were limited and mostly on the buy side during the period."
        ),
    }
}

/// Deterministic FinMind-style daily records ending today.
fn simulated_kline(days: u64) -> Vec<Value> {
    let today = Utc::now().date_naive();
    (0..days)
        .map(|offset| {
            let step = offset as f64;
            let close = 100.0 + step * 0.6 + (step * 0.7).sin() * 3.0;
            let date = today
                .checked_sub_days(Days::new(days - offset))
                .unwrap_or(today);
            json!({
                "date": date.format("%Y-%m-%d").to_string(),
                "open": round2(close - 0.5),
                "max": round2(close + 1.5),
                "min": round2(close - 1.8),
                "close": round2(close),
            })
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn canned_results(info: &StockInfo, votes: &BTreeMap<String, u32>, debate_rounds: u32) -> Value {
    let research: serde_json::Map<String, Value> = AgentId::ALL
        .into_iter()
        .map(|agent| {
            let mut payload = json!({ "agent_output": canned_commentary(agent, info) });
            if agent == AgentId::Technical {
                payload["tool_data"] = json!({ "daily_kline": simulated_kline(SIMULATED_KLINE_DAYS) });
            }
            (agent.wire_name().to_string(), payload)
        })
        .collect();

    json!({
        "stock_code": info.code,
        "research": research,
        "battle": {
            "final_decision": "bullish",
            "vote_count": votes,
            "debate_rounds": debate_rounds,
        },
        "reports": {},
    })
}

#[cfg(test)]
#[path = "tests/simulated_tests.rs"]
mod tests;
