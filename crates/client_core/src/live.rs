use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::ConnectionStatus,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{AnalysisSource, SourceEvent, SourceKind};

const OUTBOUND_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One WebSocket to the analysis backend.
pub struct LiveSource {
    outbound: mpsc::Sender<Message>,
    events: broadcast::Sender<SourceEvent>,
    open: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSource {
    pub async fn connect(url: &Url, timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| anyhow!("timed out connecting websocket after {timeout:?}: {url}"))?
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (events, _) = broadcast::channel(1024);
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_writer.send(message).await {
                    error!("websocket send failed: {err}");
                    if writer_open.swap(false, Ordering::SeqCst) {
                        let _ = writer_events.send(SourceEvent::ConnectionChanged(
                            ConnectionStatus::Disconnected,
                        ));
                    }
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_open = Arc::clone(&open);
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            debug!(kind = event.kind(), "received server event");
                            let _ = reader_events.send(SourceEvent::Server(event));
                        }
                        Err(err) => {
                            warn!("dropping undecodable server message: {err}");
                            let _ = reader_events
                                .send(SourceEvent::Error(format!("invalid server event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = reader_events.send(SourceEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
            if reader_open.swap(false, Ordering::SeqCst) {
                info!("websocket closed by backend");
                let _ = reader_events.send(SourceEvent::ConnectionChanged(
                    ConnectionStatus::Disconnected,
                ));
            }
        });

        Ok(Self {
            outbound,
            events,
            open,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        })
    }
}

#[async_trait]
impl AnalysisSource for LiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, request: ClientRequest) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("websocket is not connected"));
        }
        let kind = request.kind();
        let payload = serde_json::to_string(&request)
            .with_context(|| format!("failed to encode {kind} request"))?;
        self.outbound
            .send(Message::Text(payload))
            .await
            .map_err(|_| anyhow!("websocket writer stopped before sending {kind}"))?;
        debug!(kind, "queued client request");
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None)).await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.lock().await.take() {
            // Let the writer flush the close frame before giving up on it.
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                abort.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
