mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    endpoint::{probe_health, resolve_backend_origin},
    load_settings, SessionController, UiEvent, UserAction,
};
use shared::{domain::StockCode, protocol::ApiCredentials};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "analyst", about = "Terminal client for the multi-agent stock analysis service")]
struct Args {
    /// Skip the backend and run the built-in simulation.
    #[arg(long, global = true)]
    offline: bool,
    /// Host the client pretends to be served from; decides the backend origin.
    #[arg(long, global = true)]
    page_host: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a stock code with the backend.
    Validate { code: String },
    /// Run a full analysis and print the results.
    Analyze {
        code: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Ask the backend to test model credentials.
    TestApi {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Probe the backend health endpoint.
    Health,
}

#[derive(clap::Args, Debug)]
struct ApiArgs {
    #[arg(long, default_value = "openai")]
    api_provider: String,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
}

impl ApiArgs {
    fn credentials(&self) -> Option<ApiCredentials> {
        let key = self.api_key.as_deref()?;
        Some(ApiCredentials::new(
            self.api_provider.clone(),
            key,
            self.model.clone(),
            self.temperature,
        ))
    }
}

/// What the command waits for before exiting.
enum Goal {
    Validation,
    Analysis { running: bool },
    ApiTest,
}

impl Goal {
    fn reached(&mut self, event: &UiEvent) -> bool {
        match (self, event) {
            (Goal::Validation, UiEvent::StockValidated(_) | UiEvent::ValidationFailed(_)) => true,
            (Goal::ApiTest, UiEvent::ApiResult { test: true, .. }) => true,
            (Goal::Analysis { running }, UiEvent::AnalysisControl { enabled }) => {
                if *enabled {
                    *running
                } else {
                    *running = true;
                    false
                }
            }
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if args.offline {
        settings.offline = true;
    }
    if let Some(host) = args.page_host {
        settings.page_host = host;
    }

    let (initial, mut goal) = match args.command {
        Command::Health => {
            let origin = resolve_backend_origin(&settings);
            let health = probe_health(origin).await?;
            println!(
                "{origin}: {} at {}",
                health.status,
                health.timestamp.as_deref().unwrap_or("unknown time")
            );
            if !health.is_healthy() {
                bail!("backend reported status '{}'", health.status);
            }
            return Ok(());
        }
        Command::Validate { code } => (vec![UserAction::Validate(code)], Goal::Validation),
        Command::Analyze { code, api } => {
            let code = StockCode::parse(&code).context("invalid stock code")?;
            let mut actions = Vec::new();
            if let Some(credentials) = api.credentials() {
                actions.push(UserAction::ConfigureApi(credentials));
            }
            actions.push(UserAction::Analyze(code.to_string()));
            (actions, Goal::Analysis { running: false })
        }
        Command::TestApi { api } => {
            let Some(credentials) = api.credentials() else {
                bail!("test-api needs --api-key");
            };
            (vec![UserAction::TestApi(credentials)], Goal::ApiTest)
        }
    };

    let (ui_events, mut ui) = broadcast::channel(1024);
    let controller = SessionController::connect(settings, ui_events).await;
    let (actions, actions_rx) = mpsc::channel(16);
    let controller_task = tokio::spawn(controller.run(actions_rx));

    for action in initial {
        actions
            .send(action)
            .await
            .context("session controller stopped")?;
    }

    let mut cancelled = false;
    loop {
        tokio::select! {
            event = ui.recv() => match event {
                Ok(event) => {
                    render::render(&event);
                    if goal.reached(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "terminal fell behind UI events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                if !matches!(goal, Goal::Analysis { running: true }) {
                    break;
                }
                println!("cancelling...");
                let _ = actions.send(UserAction::Cancel).await;
            }
        }
    }

    drop(actions);
    controller_task
        .await
        .context("session controller task panicked")?
}
