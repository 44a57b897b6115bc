use super::*;
use serde_json::json;

const LONG_TEXT: &str =
    "Foreign investors accumulated shares for five straight sessions, a constructive signal.";

#[test]
fn bare_string_and_object_shapes_normalize_alike() {
    let bare = normalize_agent_payload(AgentId::Sentiment, &json!(LONG_TEXT));
    let object = normalize_agent_payload(AgentId::Sentiment, &json!({ "agent_output": LONG_TEXT }));

    assert_eq!(bare.commentary, Commentary::Text(LONG_TEXT.to_string()));
    assert_eq!(object.commentary, bare.commentary);
    assert_eq!(object.agent, AgentId::Sentiment);
}

#[test]
fn short_output_is_insufficient() {
    let report = normalize_agent_payload(AgentId::Risk, &json!({ "agent_output": "ok" }));
    assert_eq!(report.commentary, Commentary::Insufficient);
}

#[test]
fn error_string_marks_agent_failed() {
    let report = normalize_agent_payload(AgentId::BigDeal, &json!("Error: upstream timeout"));
    assert_eq!(
        report.commentary,
        Commentary::Failed("upstream timeout".to_string())
    );
}

#[test]
fn unexpected_shape_becomes_placeholder() {
    let report = normalize_agent_payload(AgentId::Risk, &json!(42));
    assert_eq!(report, AgentReport::missing(AgentId::Risk));
}

#[test]
fn longest_plausible_candidate_wins() {
    let raw = format!("{LONG_TEXT} Margin balances also fell while short interest stayed flat.");
    let report = normalize_agent_payload(
        AgentId::ChipAnalysis,
        &json!({ "agent_output": LONG_TEXT, "raw_output": raw }),
    );
    assert_eq!(report.commentary, Commentary::Text(raw));
}

#[test]
fn json_like_output_is_not_prose() {
    let report = normalize_agent_payload(
        AgentId::Technical,
        &json!({ "agent_output": "{\"close\": 101.5, \"volume\": 1200000, \"ma5\": 99.8}" }),
    );
    assert_eq!(report.commentary, Commentary::Insufficient);
}

#[test]
fn strips_tool_transcripts_and_step_prefixes() {
    let text = "Step 1: Calling tool technical_analysis with {'stock_code': '2330'}\n\
                Step 2: Observed output of cmd `technical_analysis` executed:\n{\"close\": 600}\n\
                Step 3: The price holds above the 20-day average with rising volume.";
    let stripped = strip_tool_transcript(text);
    assert_eq!(
        stripped,
        "The price holds above the 20-day average with rising volume."
    );
}

#[test]
fn stripping_leaves_plain_text_alone() {
    assert_eq!(strip_tool_transcript(LONG_TEXT), LONG_TEXT);
}

#[test]
fn tool_data_json_string_is_parsed() {
    let report = normalize_agent_payload(
        AgentId::Technical,
        &json!({
            "agent_output": LONG_TEXT,
            "tool_data": "{\"daily_kline\": [{\"date\": \"2024-01-02\", \"close\": 590}]}"
        }),
    );
    assert_eq!(
        report.tool_data,
        Some(json!({ "daily_kline": [{ "date": "2024-01-02", "close": 590 }] }))
    );
}

#[test]
fn results_fill_every_agent_and_build_chart() {
    let results = json!({
        "stock_code": "2330",
        "research": {
            "sentiment": LONG_TEXT,
            "technical": {
                "agent_output": LONG_TEXT,
                "tool_data": {
                    "daily_kline": [
                        { "date": "2024-01-02", "close": 590, "max": 595, "min": 585 },
                        { "date": "2024-01-03", "close": 593, "max": 598, "min": 588 }
                    ]
                }
            }
        },
        "battle": { "final_decision": "bullish", "vote_count": { "bullish": 4, "bearish": 2 } },
        "reports": { "markdown": "reports/2330.md" }
    });

    let report = normalize_results(&results, None, None);

    assert_eq!(report.stock_code.as_deref(), Some("2330"));
    assert_eq!(report.agents.len(), AgentId::COUNT);
    assert_eq!(
        report.agent(AgentId::Risk).map(|agent| &agent.commentary),
        Some(&Commentary::Insufficient)
    );
    let battle = report.battle.expect("battle");
    assert_eq!(battle.final_decision.as_deref(), Some("bullish"));
    assert_eq!(battle.total_votes(), 6);
    let chart = report.chart.expect("chart");
    assert_eq!(chart.labels, vec!["2024-01-02", "2024-01-03"]);
    assert_eq!(chart.high, vec![Some(595.0), Some(598.0)]);
    assert_eq!(
        report.report_paths.get("markdown").map(String::as_str),
        Some("reports/2330.md")
    );
}

#[test]
fn top_level_agents_and_battle_fallback() {
    let fallback = BattleResult {
        final_decision: Some("neutral".into()),
        vote_count: BTreeMap::from([("neutral".to_string(), 3)]),
        debate_rounds: Some(1),
    };
    let info = StockInfo {
        code: "2454".into(),
        name: "聯發科".into(),
        industry: "半導體業".into(),
    };
    let results = json!({ "risk": { "raw_output": LONG_TEXT } });

    let report = normalize_results(&results, Some(&fallback), Some(&info));

    assert_eq!(report.battle, Some(fallback));
    assert_eq!(report.stock_info, Some(info));
    assert_eq!(
        report.agent(AgentId::Risk).and_then(|agent| agent.commentary.text()),
        Some(LONG_TEXT)
    );
    assert!(report.chart.is_none());
}
