use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::ConnectionStatus,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod barrier;
pub mod chart;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod live;
pub mod payload;
pub mod progress;
pub mod session;
pub mod simulated;

pub use config::{load_settings, ClientSettings};
pub use controller::{SessionController, ToastLevel, UiEvent, UserAction};
pub use endpoint::ClientId;
pub use live::LiveSource;
pub use payload::{AgentReport, AnalysisReport, Commentary};
pub use session::Session;
pub use simulated::SimulatedSource;

/// Everything an analysis source reports back to the controller.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    ConnectionChanged(ConnectionStatus),
    Server(ServerEvent),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Live,
    Simulated,
}

/// Where analysis requests go and where server messages come from. The
/// controller is the only caller; implementations run their own I/O tasks.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    fn kind(&self) -> SourceKind;
    fn is_open(&self) -> bool;
    async fn send(&self, request: ClientRequest) -> Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent>;
    async fn shutdown(&self) -> Result<()>;
}

pub struct SourceSelection {
    pub source: Arc<dyn AnalysisSource>,
    pub client_id: ClientId,
    /// Set when a live connection was wanted but could not be opened.
    pub fallback_reason: Option<String>,
}

/// Picks the analysis source once at startup: the live socket when it opens,
/// otherwise the simulated source.
pub async fn select_source(settings: &ClientSettings) -> SourceSelection {
    let client_id = ClientId::generate();
    if settings.offline {
        info!("offline mode requested; using simulated analysis source");
        return SourceSelection {
            source: Arc::new(SimulatedSource::new()),
            client_id,
            fallback_reason: None,
        };
    }

    let origin = endpoint::resolve_backend_origin(settings);
    let connected = match endpoint::websocket_url(origin, &client_id) {
        Ok(url) => LiveSource::connect(&url, settings.connect_timeout).await,
        Err(err) => Err(err.into()),
    };

    match connected {
        Ok(source) => {
            info!(client_id = %client_id, origin, "connected to analysis backend");
            SourceSelection {
                source: Arc::new(source),
                client_id,
                fallback_reason: None,
            }
        }
        Err(err) => {
            warn!(origin, "backend unavailable, falling back to simulated mode: {err:#}");
            SourceSelection {
                source: Arc::new(SimulatedSource::new()),
                client_id,
                fallback_reason: Some(format!("{err:#}")),
            }
        }
    }
}
