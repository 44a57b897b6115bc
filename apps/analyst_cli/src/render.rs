use client_core::{
    chart::PriceChart, AgentReport, AnalysisReport, Commentary, ToastLevel, UiEvent,
};
use shared::{
    domain::{AgentStatus, AnalysisPhase},
    protocol::BattleResult,
};

const COMMENTARY_WIDTH: usize = 400;

pub fn render(event: &UiEvent) {
    match event {
        UiEvent::ConnectionChanged(status) => println!("[connection] {status}"),
        UiEvent::Toast { level, message } => println!("{} {message}", toast_tag(*level)),
        UiEvent::StockValidated(info) => {
            println!("✔ {} {} ({})", info.code, info.name, info.industry)
        }
        UiEvent::ValidationFailed(message) => println!("✘ {message}"),
        UiEvent::AnalysisControl { .. } | UiEvent::ProgressPanel { .. } => {}
        UiEvent::PhaseChanged { phase, message } => {
            let label = phase_label(*phase);
            match message {
                Some(message) => println!("== {label}: {message}"),
                None => println!("== {label}"),
            }
        }
        UiEvent::AgentProgress {
            agent,
            status,
            percent,
        } => {
            if *status != AgentStatus::Waiting {
                println!(
                    "  {:>5.1}%  {:<24} {}",
                    percent,
                    agent.display_name(),
                    status_label(*status)
                );
            }
        }
        UiEvent::ProgressMilestone { percent, text } => println!("  {percent:>5.1}%  {text}"),
        UiEvent::BattleRevealed => println!("== debate"),
        UiEvent::BattleResult(battle) => render_battle(battle),
        UiEvent::ResultsReady(report) => render_report(report),
        UiEvent::DegradedMode { reason } => println!("[degraded] {reason}"),
        UiEvent::ApiResult {
            success, preview, ..
        } => {
            if let (true, Some(preview)) = (success, preview) {
                println!("  model replied: {preview}");
            }
        }
    }
}

fn toast_tag(level: ToastLevel) -> &'static str {
    match level {
        ToastLevel::Info => "[info]",
        ToastLevel::Success => "[ok]",
        ToastLevel::Warning => "[warn]",
        ToastLevel::Error => "[error]",
    }
}

fn phase_label(phase: AnalysisPhase) -> &'static str {
    match phase {
        AnalysisPhase::Idle => "idle",
        AnalysisPhase::Research => "research",
        AnalysisPhase::Battle => "debate",
        AnalysisPhase::Report => "report",
        AnalysisPhase::Complete => "complete",
    }
}

fn status_label(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Waiting => "waiting",
        AgentStatus::Started => "running",
        AgentStatus::Completed => "done",
        AgentStatus::Failed => "failed",
    }
}

fn render_battle(battle: &BattleResult) {
    println!(
        "  decision: {}",
        battle.final_decision.as_deref().unwrap_or("undecided")
    );
    for (label, votes) in &battle.vote_count {
        println!(
            "    {label:<10} {votes:>3} votes ({:.1}%)",
            battle.vote_share(label)
        );
    }
    if let Some(rounds) = battle.debate_rounds {
        println!("    after {rounds} debate rounds");
    }
}

fn render_report(report: &AnalysisReport) {
    let title = match &report.stock_info {
        Some(info) => format!("{} {}", info.code, info.name),
        None => report.stock_code.clone().unwrap_or_default(),
    };
    println!();
    println!("######## {title} ########");
    for agent in report.agents.values() {
        render_agent(agent);
    }
    if let Some(chart) = &report.chart {
        render_chart(chart);
    }
    for (kind, path) in &report.report_paths {
        println!("report ({kind}): {path}");
    }
}

fn render_agent(report: &AgentReport) {
    println!("-- {}", report.agent.display_name());
    match &report.commentary {
        Commentary::Text(text) => println!("{}", truncate(text, COMMENTARY_WIDTH)),
        Commentary::Failed(reason) => println!("(agent failed: {reason})"),
        Commentary::Insufficient => println!("(insufficient content)"),
    }
}

fn render_chart(chart: &PriceChart) {
    let first = chart.labels.first().map(String::as_str).unwrap_or("-");
    let last = chart.labels.last().map(String::as_str).unwrap_or("-");
    println!("-- price chart: {} points, {first} .. {last}", chart.len());
    if let Some(close) = chart.latest_close() {
        println!("   close {close:.2}");
    }
    for (window, averages) in &chart.moving_averages {
        match averages.last().copied().flatten() {
            Some(value) => println!("   sma{window:<3} {value:.2}"),
            None => println!("   sma{window:<3} n/a"),
        }
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width).collect();
    cut.push('…');
    cut
}
