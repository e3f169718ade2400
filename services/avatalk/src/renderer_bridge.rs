//! Renderer sink that streams agent audio to an avatar rendering service over a
//! WebSocket.
//!
//! The bridge sends one JSON init frame, then raw PCM as binary frames. A text `SKIP`
//! frame tells the renderer to drop whatever audio it has buffered.

use avatalk_core::SessionError;
use avatalk_core::renderer::{
    ListenerRegistry, RendererConfig, RendererEvent, RendererListener, RendererSink, Subscription,
};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

const CLEAR_BUFFER_FRAME: &str = "SKIP";

#[derive(Debug, Serialize)]
struct SessionInit<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    face_id: &'a str,
    handle_silence: bool,
    max_session_length: u64,
    max_idle_time: u64,
    video_surface: &'a str,
    audio_surface: &'a str,
}

enum BridgeFrame {
    Audio(Vec<u8>),
    Clear,
    Close,
}

/// Emits events only while its run is still the bridge's current one.
struct RunEvents {
    listeners: ListenerRegistry,
    current: Arc<AtomicU64>,
    epoch: u64,
}

impl RunEvents {
    fn emit(&self, event: RendererEvent) {
        if self.current.load(Ordering::SeqCst) == self.epoch {
            self.listeners.emit(event);
        } else {
            debug!(epoch = self.epoch, ?event, "Dropping event from a superseded renderer run");
        }
    }
}

#[derive(Default)]
struct BridgeState {
    config: Option<RendererConfig>,
    outbound: Option<mpsc::UnboundedSender<BridgeFrame>>,
}

pub struct BridgeRenderer {
    url: String,
    api_key: Option<SecretString>,
    listeners: ListenerRegistry,
    epoch: Arc<AtomicU64>,
    state: Mutex<BridgeState>,
}

impl BridgeRenderer {
    pub fn new(url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            api_key,
            listeners: ListenerRegistry::default(),
            epoch: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(BridgeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self, frame: BridgeFrame) {
        if let Some(outbound) = &self.state().outbound {
            let _ = outbound.send(frame);
        }
    }

    fn init_frame(&self, config: &RendererConfig) -> Result<String, SessionError> {
        let init = SessionInit {
            api_key: self.api_key.as_ref().map(|k| k.expose_secret()),
            face_id: &config.face_id,
            handle_silence: config.handle_silence,
            max_session_length: config.max_session_length_secs,
            max_idle_time: config.max_idle_time_secs,
            video_surface: config.video_surface.as_deref().unwrap_or_default(),
            audio_surface: config.audio_surface.as_deref().unwrap_or_default(),
        };
        serde_json::to_string(&init).map_err(|e| {
            SessionError::TransportError(format!("failed to serialize renderer init: {e}"))
        })
    }
}

impl RendererSink for BridgeRenderer {
    fn initialize(&self, config: &RendererConfig) -> Result<(), SessionError> {
        config.validate()?;
        self.state().config = Some(config.clone());
        debug!(face_id = %config.face_id, "Renderer initialized");
        Ok(())
    }

    fn start(&self) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::TransportError(e.to_string()))?;

        let mut state = self.state();
        let config = state.config.clone().ok_or_else(|| {
            SessionError::RendererPreconditionFailure("renderer is not initialized".to_string())
        })?;
        if state.outbound.is_some() {
            debug!("Renderer already started");
            return Ok(());
        }

        let init = self.init_frame(&config)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        state.outbound = Some(outbound_tx);
        let events = RunEvents {
            listeners: self.listeners.clone(),
            current: Arc::clone(&self.epoch),
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
        };
        runtime.spawn(run_bridge(self.url.clone(), init, outbound_rx, events));
        Ok(())
    }

    fn close(&self) {
        if let Some(outbound) = self.state().outbound.take() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let _ = outbound.send(BridgeFrame::Close);
        }
    }

    fn send_audio_data(&self, bytes: Vec<u8>) {
        self.forward(BridgeFrame::Audio(bytes));
    }

    fn clear_buffer(&self) {
        self.forward(BridgeFrame::Clear);
    }

    fn subscribe(&self, listener: RendererListener) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

async fn run_bridge(
    url: String,
    init: String,
    mut outbound: mpsc::UnboundedReceiver<BridgeFrame>,
    events: RunEvents,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("Failed to connect to renderer: {}", e);
            events.emit(RendererEvent::Disconnected);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    if let Err(e) = ws_tx.send(WsMessage::Text(init.into())).await {
        warn!("Failed to send renderer init: {}", e);
        events.emit(RendererEvent::Disconnected);
        return;
    }
    info!("Renderer connected.");
    events.emit(RendererEvent::Connected);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let message = match frame {
                    Some(BridgeFrame::Audio(bytes)) => WsMessage::Binary(bytes.into()),
                    Some(BridgeFrame::Clear) => WsMessage::Text(CLEAR_BUFFER_FRAME.to_string().into()),
                    Some(BridgeFrame::Close) | None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = ws_tx.send(message).await {
                    warn!("Renderer write failed: {}", e);
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "Renderer closed the connection.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Renderer read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    debug!("Renderer bridge stopped");
    events.emit(RendererEvent::Disconnected);
}
