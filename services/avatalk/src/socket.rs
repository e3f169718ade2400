//! `tokio-tungstenite` implementation of the agent socket.

use avatalk_core::SessionError;
use avatalk_core::protocol::transport::{DuplexSocket, SocketConnector, SocketEvent, SocketEventFn};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

enum Outbound {
    Text(String),
    Close,
}

/// Opens WebSocket connections on the current tokio runtime.
#[derive(Debug, Default)]
pub struct TungsteniteConnector;

impl SocketConnector for TungsteniteConnector {
    fn connect(&self, url: &str, on_event: SocketEventFn) -> Arc<dyn DuplexSocket> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_socket(
            url.to_string(),
            outbound_rx,
            Arc::clone(&open),
            on_event,
        ));
        Arc::new(TungsteniteSocket {
            outbound: outbound_tx,
            open,
            task: task.abort_handle(),
        })
    }
}

pub struct TungsteniteSocket {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    task: AbortHandle,
}

impl DuplexSocket for TungsteniteSocket {
    fn send(&self, frame: String) -> Result<(), SessionError> {
        if !self.is_open() {
            return Ok(());
        }
        self.outbound
            .send(Outbound::Text(frame))
            .map_err(|_| SessionError::TransportError("socket writer has stopped".to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        } else {
            // Still connecting, or already gone.
            self.task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connects, then pumps frames both ways until either side closes.
async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
    on_event: SocketEventFn,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("Failed to connect to agent socket: {}", e);
            on_event(SocketEvent::Error(e.to_string()));
            on_event(SocketEvent::Closed);
            return;
        }
    };
    info!("Connected to agent WebSocket.");
    open.store(true, Ordering::SeqCst);
    on_event(SocketEvent::Opened);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let failure = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Closing agent socket");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break None;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => on_event(SocketEvent::Message(text.to_string())),
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "Agent socket closed by server.");
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
        }
    };

    open.store(false, Ordering::SeqCst);
    if let Some(reason) = failure {
        warn!("Agent socket failed: {}", reason);
        on_event(SocketEvent::Error(reason));
    }
    on_event(SocketEvent::Closed);
}
