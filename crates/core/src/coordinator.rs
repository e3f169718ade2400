//! Session Coordinator
//!
//! Top-level lifecycle state machine. It owns the capture pipeline and the protocol
//! client of the current session, sequences start and stop, routes agent audio to
//! the renderer and reports errors upward.
//!
//! All asynchronous collaborator callbacks (renderer readiness, signed-URL results,
//! socket events, capture frames) are funnelled into one channel and handled one at
//! a time by the task that owns the coordinator. Every event is tagged with the
//! generation of the session that produced it, so results that arrive after a stop
//! are discarded instead of acted upon.

use crate::capture::{AudioBackend, CaptureConfig, CaptureHandle, CapturedFrame};
use crate::error::SessionError;
use crate::protocol::transport::{SocketConnector, SocketEvent};
use crate::protocol::{ProtocolClient, ProtocolEvent};
use crate::renderer::{RendererConfig, RendererEvent, RendererSink, Subscription};
use crate::signaling::SignedUrlProvider;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Bytes of silence pushed to the renderer when it first connects.
pub const WARMUP_SILENCE_BYTES: usize = 6000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub agent_id: String,
    pub capture: CaptureConfig,
    pub renderer: RendererConfig,
    pub warmup_silence_bytes: usize,
    /// Flush queued renderer audio when the agent is interrupted.
    pub clear_on_interruption: bool,
}

impl CoordinatorConfig {
    pub fn new(agent_id: impl Into<String>, renderer: RendererConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            capture: CaptureConfig::default(),
            renderer,
            warmup_silence_bytes: WARMUP_SILENCE_BYTES,
            clear_on_interruption: true,
        }
    }
}

/// The external collaborators a coordinator drives.
pub struct Collaborators {
    pub renderer: Arc<dyn RendererSink>,
    pub signaling: Arc<dyn SignedUrlProvider>,
    pub connector: Arc<dyn SocketConnector>,
    pub audio: Arc<dyn AudioBackend>,
}

/// Updates published for UI and logging.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StateChanged(CoordinatorState),
    ConversationStarted { conversation_id: String },
    UserTranscript(String),
    AgentResponse(String),
    Interruption(String),
    ConnectionLost(String),
    RendererDisconnected,
    Error(String),
}

/// Commands accepted by [`SessionCoordinator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Shutdown,
}

/// An internal event tagged with the session generation that produced it.
#[derive(Debug)]
pub struct SessionEvent {
    generation: u64,
    kind: SessionEventKind,
}

#[derive(Debug)]
enum SessionEventKind {
    Renderer(RendererEvent),
    SignedUrl(Result<String, SessionError>),
    Socket(SocketEvent),
    CaptureFrame(CapturedFrame),
}

/// Resources of one conversation. Dropped on stop; never reused.
struct Session {
    generation: u64,
    conversation_id: Option<String>,
    renderer_subscription: Option<Subscription>,
    renderer_connected: bool,
    protocol: Option<ProtocolClient>,
    capture: Option<CaptureHandle>,
}

pub struct SessionCoordinator {
    config: CoordinatorConfig,
    renderer: Arc<dyn RendererSink>,
    signaling: Arc<dyn SignedUrlProvider>,
    connector: Arc<dyn SocketConnector>,
    audio: Arc<dyn AudioBackend>,
    state: CoordinatorState,
    session: Option<Session>,
    next_generation: u64,
    last_error: Option<SessionError>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
}

impl SessionCoordinator {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            renderer: collaborators.renderer,
            signaling: collaborators.signaling,
            connector: collaborators.connector,
            audio: collaborators.audio,
            state: CoordinatorState::Idle,
            session: None,
            next_generation: 1,
            last_error: None,
            events_tx,
            events_rx,
            notices: None,
        }
    }

    /// Publishes [`SessionNotice`]s to `notices`.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<SessionNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The most recent failure, cleared by the next `start`.
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// The agent-assigned id of the current conversation, once known.
    pub fn conversation_id(&self) -> Option<&str> {
        self.session.as_ref()?.conversation_id.as_deref()
    }

    pub fn is_capturing(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.capture.as_ref())
            .is_some_and(CaptureHandle::is_active)
    }

    pub fn has_open_socket(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.protocol.as_ref())
            .is_some_and(|p| p.state() != crate::protocol::ConnectionState::Closed)
    }

    /// Begins a new session. Ignored unless the coordinator is idle.
    ///
    /// The microphone is checked and the renderer initialized synchronously; the
    /// rest of the start sequence continues as events arrive.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != CoordinatorState::Idle {
            warn!(state = ?self.state, "Start requested while a session is in progress; ignoring");
            return Ok(());
        }
        self.last_error = None;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.session = Some(Session {
            generation,
            conversation_id: None,
            renderer_subscription: None,
            renderer_connected: false,
            protocol: None,
            capture: None,
        });
        self.set_state(CoordinatorState::Starting);
        info!(generation, agent_id = %self.config.agent_id, "Starting session");

        if let Err(e) = CaptureHandle::preflight(self.audio.as_ref(), &self.config.capture) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.renderer.initialize(&self.config.renderer) {
            return Err(self.fail(e));
        }

        let events = self.events_tx.clone();
        let subscription = self.renderer.subscribe(Arc::new(move |event| {
            let _ = events.send(SessionEvent {
                generation,
                kind: SessionEventKind::Renderer(event),
            });
        }));
        if let Some(session) = self.session.as_mut() {
            session.renderer_subscription = Some(subscription);
        }

        if let Err(e) = self.renderer.start() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Tears the current session down and returns to `Idle`.
    ///
    /// Safe to call repeatedly, before any start, and from within event handling.
    pub fn stop(&mut self) {
        if self.state == CoordinatorState::Stopping {
            return;
        }
        let Some(mut session) = self.session.take() else {
            self.set_state(CoordinatorState::Idle);
            return;
        };
        self.set_state(CoordinatorState::Stopping);
        info!(generation = session.generation, "Stopping session");

        if let Some(mut protocol) = session.protocol.take() {
            protocol.close();
        }
        if let Some(mut capture) = session.capture.take() {
            capture.stop();
        }
        drop(session.renderer_subscription.take());
        self.renderer.clear_buffer();
        self.renderer.close();

        self.set_state(CoordinatorState::Idle);
    }

    /// Runs the coordinator until `Shutdown` or until every command sender is gone.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => {
                        if let Err(e) = self.start() {
                            debug!("Start failed: {}", e);
                        }
                    }
                    Some(Command::Stop) => self.stop(),
                    Some(Command::Shutdown) | None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event),
            }
        }
        info!("Session coordinator finished.");
    }

    /// Waits for the next internal event and handles it.
    pub async fn step(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.dispatch(event);
        }
    }

    /// Handles every internal event that is already queued.
    pub fn drain(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(event.generation) {
            trace!(generation = event.generation, "Discarding event from a finished session");
            return;
        }
        match event.kind {
            SessionEventKind::Renderer(RendererEvent::Connected) => self.on_renderer_connected(),
            SessionEventKind::Renderer(RendererEvent::Disconnected) => {
                self.on_renderer_disconnected()
            }
            SessionEventKind::SignedUrl(Ok(url)) => self.on_signed_url(&url),
            SessionEventKind::SignedUrl(Err(e)) => {
                self.fail(e);
            }
            SessionEventKind::Socket(socket_event) => self.on_socket_event(socket_event),
            SessionEventKind::CaptureFrame(frame) => self.on_capture_frame(frame),
        }
    }

    fn on_renderer_connected(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.renderer_connected {
            debug!("Renderer reported connected again; ignoring");
            return;
        }
        session.renderer_connected = true;
        let generation = session.generation;
        info!("Renderer connected");

        self.renderer
            .send_audio_data(vec![0u8; self.config.warmup_silence_bytes]);

        if self.state != CoordinatorState::Starting {
            return;
        }
        let signaling = Arc::clone(&self.signaling);
        let agent_id = self.config.agent_id.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = signaling
                .get_signed_url(&agent_id)
                .await
                .map_err(|e| SessionError::SignalingFailure(format!("{e:#}")));
            let _ = events.send(SessionEvent {
                generation,
                kind: SessionEventKind::SignedUrl(result),
            });
        });
    }

    /// A renderer lost while starting fails the session; once active it is only reported.
    fn on_renderer_disconnected(&mut self) {
        warn!("Renderer disconnected");
        self.notify(SessionNotice::RendererDisconnected);
        if self.state != CoordinatorState::Starting {
            return;
        }
        let connected = self.session.as_ref().is_some_and(|s| s.renderer_connected);
        let reason = if connected {
            "renderer disconnected before the session became active"
        } else {
            "renderer failed to connect"
        };
        self.fail(SessionError::TransportError(reason.to_string()));
    }

    fn on_signed_url(&mut self, url: &str) {
        if self.state != CoordinatorState::Starting {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.protocol.is_some() {
            return;
        }
        let generation = session.generation;
        let events = self.events_tx.clone();
        session.protocol = Some(ProtocolClient::connect(
            self.connector.as_ref(),
            url,
            Arc::new(move |event| {
                let _ = events.send(SessionEvent {
                    generation,
                    kind: SessionEventKind::Socket(event),
                });
            }),
        ));
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        let outcome = self
            .session
            .as_mut()
            .and_then(|s| s.protocol.as_mut())
            .and_then(|protocol| protocol.handle_socket_event(event));
        let Some(outcome) = outcome else {
            return;
        };

        match outcome {
            ProtocolEvent::Ready => self.on_protocol_ready(),
            ProtocolEvent::ConversationStarted { conversation_id } => {
                info!(%conversation_id, "Conversation started");
                if let Some(session) = self.session.as_mut() {
                    session.conversation_id = Some(conversation_id.clone());
                }
                self.notify(SessionNotice::ConversationStarted { conversation_id });
            }
            ProtocolEvent::UserTranscript(text) => {
                info!(transcript = %text, "User");
                self.notify(SessionNotice::UserTranscript(text));
            }
            ProtocolEvent::AgentResponse(text) => {
                info!(response = %text, "Agent");
                self.notify(SessionNotice::AgentResponse(text));
            }
            ProtocolEvent::Interruption(reason) => {
                debug!(%reason, "Agent interrupted");
                if self.config.clear_on_interruption {
                    self.renderer.clear_buffer();
                }
                self.notify(SessionNotice::Interruption(reason));
            }
            ProtocolEvent::Audio(bytes) => self.renderer.send_audio_data(bytes),
            ProtocolEvent::ConnectionLost(reason) => {
                self.notify(SessionNotice::ConnectionLost(reason.clone()));
                self.fail(SessionError::TransportError(reason));
            }
            ProtocolEvent::Closed => {
                info!("Agent closed the conversation");
                self.stop();
            }
        }
    }

    fn on_protocol_ready(&mut self) {
        if self.state != CoordinatorState::Starting {
            return;
        }
        let Some(generation) = self.session.as_ref().map(|s| s.generation) else {
            return;
        };
        let events = self.events_tx.clone();
        let capture = CaptureHandle::start(
            self.audio.as_ref(),
            &self.config.capture,
            Box::new(move |frame| {
                let _ = events.send(SessionEvent {
                    generation,
                    kind: SessionEventKind::CaptureFrame(frame),
                });
            }),
        );
        match capture {
            Ok(capture) => {
                if let Some(session) = self.session.as_mut() {
                    session.capture = Some(capture);
                }
                self.set_state(CoordinatorState::Active);
            }
            Err(e) => {
                self.fail(e);
            }
        }
    }

    fn on_capture_frame(&mut self, captured: CapturedFrame) {
        if self.state != CoordinatorState::Active || !captured.frame.has_audio() {
            return;
        }
        let Some(protocol) = self.session.as_ref().and_then(|s| s.protocol.as_ref()) else {
            return;
        };
        // The in-flight guard stays alive in `captured` until the send completes.
        if let Err(e) = protocol.send_user_audio(captured.frame.into_wire()) {
            warn!("Failed to send capture audio: {}", e);
        }
    }

    /// Records `err`, tears the session down and hands the error back.
    fn fail(&mut self, err: SessionError) -> SessionError {
        error!("Session failed: {}", err);
        self.last_error = Some(err.clone());
        self.notify(SessionNotice::Error(err.to_string()));
        self.stop();
        err
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "Coordinator state change");
        self.state = state;
        self.notify(SessionNotice::StateChanged(state));
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(tx) = &self.notices {
            if tx.send(notice).is_err() {
                trace!("Notice receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CAPTURE_BUFFER_SIZE, InputFormat};
    use crate::signaling::MockSignedUrlProvider;
    use crate::test_support::{StubAudioBackend, StubConnector, StubRenderer, settle};
    use serde_json::{Value, json};
    use std::time::Duration;

    struct Harness {
        coordinator: SessionCoordinator,
        renderer: Arc<StubRenderer>,
        connector: Arc<StubConnector>,
        audio: Arc<StubAudioBackend>,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
    }

    fn ready_renderer_config() -> RendererConfig {
        RendererConfig {
            face_id: "face".into(),
            video_surface: Some("video".into()),
            audio_surface: Some("audio".into()),
            ..Default::default()
        }
    }

    fn signer_ok() -> MockSignedUrlProvider {
        let mut signer = MockSignedUrlProvider::new();
        signer
            .expect_get_signed_url()
            .withf(|agent_id| agent_id == "agent_123")
            .returning(|_| Ok("wss://agent.test/convai?token=abc".to_string()));
        signer
    }

    fn harness_with(signer: MockSignedUrlProvider, audio: StubAudioBackend) -> Harness {
        let renderer = Arc::new(StubRenderer::default());
        let connector = Arc::new(StubConnector::default());
        let audio = Arc::new(audio);
        let (tx, notices) = mpsc::unbounded_channel();
        let coordinator = SessionCoordinator::new(
            CoordinatorConfig::new("agent_123", ready_renderer_config()),
            Collaborators {
                renderer: renderer.clone(),
                signaling: Arc::new(signer),
                connector: connector.clone(),
                audio: audio.clone(),
            },
        )
        .with_notices(tx);
        Harness {
            coordinator,
            renderer,
            connector,
            audio,
            notices,
        }
    }

    fn harness() -> Harness {
        harness_with(signer_ok(), StubAudioBackend::new(InputFormat {
            sample_rate: 16_000,
            channels: 1,
        }))
    }

    /// Drives a session from `start()` to `Active`.
    async fn activate(h: &mut Harness) {
        h.coordinator.start().unwrap();
        assert_eq!(h.coordinator.state(), CoordinatorState::Starting);
        h.renderer.fire(RendererEvent::Connected);
        h.coordinator.step().await;
        h.coordinator.step().await;
        assert_eq!(
            h.connector.urls().last().map(String::as_str),
            Some("wss://agent.test/convai?token=abc")
        );
        h.connector.socket().open();
        h.coordinator.step().await;
        assert_eq!(h.coordinator.state(), CoordinatorState::Active);
    }

    fn sent(connector: &StubConnector) -> Vec<Value> {
        connector
            .socket()
            .delivered()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_end_to_end_audio_reaches_renderer() {
        let mut h = harness();
        activate(&mut h).await;

        let frames = sent(&h.connector);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "conversation_initiation_client_data");
        assert!(h.coordinator.is_capturing());
        // Warm-up silence went out when the renderer connected.
        assert_eq!(h.renderer.audio(), vec![vec![0u8; WARMUP_SILENCE_BYTES]]);

        h.connector.socket().deliver(
            r#"{"type":"audio","audio_event":{"audio_base_64":"AAA=","event_id":1}}"#,
        );
        h.coordinator.step().await;

        let audio = h.renderer.audio();
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[1], crate::codec::decode_inbound("AAA=").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_gets_delayed_pong() {
        let mut h = harness();
        activate(&mut h).await;

        h.connector
            .socket()
            .deliver(r#"{"type":"ping","ping_event":{"event_id":7,"ping_ms":50}}"#);
        h.coordinator.step().await;
        settle().await;
        assert_eq!(sent(&h.connector).len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        settle().await;
        let frames = sent(&h.connector);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], json!({ "type": "pong", "event_id": 7 }));
    }

    #[tokio::test]
    async fn test_capture_audio_is_sent_and_silence_is_not() {
        let mut h = harness();
        activate(&mut h).await;

        h.audio.push(&vec![0.005; CAPTURE_BUFFER_SIZE]);
        h.coordinator.step().await;
        assert_eq!(sent(&h.connector).len(), 1);

        h.audio.push(&vec![0.25; CAPTURE_BUFFER_SIZE]);
        h.coordinator.step().await;
        let frames = sent(&h.connector);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[1]["user_audio_chunk"],
            crate::codec::encode_outbound(&vec![0.25; CAPTURE_BUFFER_SIZE])
        );
    }

    #[tokio::test]
    async fn test_frame_arriving_while_previous_in_flight_is_dropped() {
        let mut h = harness();
        activate(&mut h).await;

        // Two buffers land before the coordinator handles the first.
        h.audio.push(&vec![0.25; CAPTURE_BUFFER_SIZE * 2]);
        h.coordinator.drain();
        assert_eq!(sent(&h.connector).len(), 2);

        h.audio.push(&vec![0.25; CAPTURE_BUFFER_SIZE]);
        h.coordinator.drain();
        assert_eq!(sent(&h.connector).len(), 3);
    }

    #[tokio::test]
    async fn test_stop_twice_releases_everything() {
        let mut h = harness();
        activate(&mut h).await;

        h.coordinator.stop();
        h.coordinator.stop();

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(!h.coordinator.has_open_socket());
        assert!(!h.coordinator.is_capturing());
        assert!(!h.connector.socket().is_open_now());
        assert_eq!(h.audio.release_log().last().map(String::as_str), Some("context"));
        assert_eq!(h.renderer.clears(), 1);
        assert_eq!(h.renderer.closes(), 1);
        assert!(h.renderer.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_active() {
        let mut h = harness();
        h.coordinator.stop();
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);

        h.coordinator.start().unwrap();
        h.coordinator.stop();
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(h.renderer.listeners().is_empty());

        // A late renderer event from the stopped session is discarded.
        h.renderer.fire(RendererEvent::Connected);
        h.coordinator.drain();
        assert!(h.renderer.audio().is_empty());
        assert!(h.connector.urls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_signed_url_fetch_discards_result() {
        let mut h = harness();
        h.coordinator.start().unwrap();
        h.renderer.fire(RendererEvent::Connected);
        h.coordinator.step().await;
        h.coordinator.stop();

        settle().await;
        h.coordinator.drain();
        assert!(h.connector.urls().is_empty());
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied_never_opens_socket() {
        let mut h = harness_with(signer_ok(), StubAudioBackend::denied());
        let err = h.coordinator.start().unwrap_err();

        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(matches!(
            h.coordinator.last_error(),
            Some(SessionError::PermissionDenied(_))
        ));
        assert!(h.connector.urls().is_empty());
        assert_eq!(h.renderer.starts(), 0);
    }

    #[tokio::test]
    async fn test_signed_url_failure_returns_to_idle() {
        let mut signer = MockSignedUrlProvider::new();
        signer
            .expect_get_signed_url()
            .returning(|_| Err(anyhow::anyhow!("403 Forbidden")));
        let mut h = harness_with(signer, StubAudioBackend::new(InputFormat {
            sample_rate: 16_000,
            channels: 1,
        }));

        h.coordinator.start().unwrap();
        h.renderer.fire(RendererEvent::Connected);
        h.coordinator.step().await;
        h.coordinator.step().await;

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(matches!(
            h.coordinator.last_error(),
            Some(SessionError::SignalingFailure(msg)) if msg.contains("403")
        ));
        assert!(h.connector.urls().is_empty());
    }

    #[tokio::test]
    async fn test_renderer_without_surfaces_is_a_precondition_failure() {
        let mut h = harness();
        h.renderer.reject_initialize();
        let err = h.coordinator.start().unwrap_err();
        assert!(matches!(err, SessionError::RendererPreconditionFailure(_)));
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(h.renderer.starts(), 0);
    }

    #[tokio::test]
    async fn test_renderer_that_never_connects_fails_the_start() {
        let mut h = harness();
        h.coordinator.start().unwrap();
        h.renderer.fire(RendererEvent::Disconnected);
        h.coordinator.drain();

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(matches!(
            h.coordinator.last_error(),
            Some(SessionError::TransportError(msg)) if msg.contains("failed to connect")
        ));
        assert!(h.connector.urls().is_empty());
        assert_eq!(h.renderer.closes(), 1);
        assert!(h.renderer.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_renderer_disconnect_while_active_is_only_reported() {
        let mut h = harness();
        activate(&mut h).await;
        while h.notices.try_recv().is_ok() {}

        h.renderer.fire(RendererEvent::Disconnected);
        h.coordinator.drain();

        assert_eq!(h.coordinator.state(), CoordinatorState::Active);
        assert!(h.coordinator.last_error().is_none());
        assert_eq!(
            h.notices.try_recv().ok(),
            Some(SessionNotice::RendererDisconnected)
        );
    }

    #[tokio::test]
    async fn test_transport_error_tears_down() {
        let mut h = harness();
        activate(&mut h).await;

        h.connector.socket().fail("connection reset");
        h.coordinator.step().await;

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(matches!(
            h.coordinator.last_error(),
            Some(SessionError::TransportError(_))
        ));
        assert!(!h.coordinator.is_capturing());

        // The trailing close event of the dead socket is ignored.
        h.connector.socket().remote_close();
        h.coordinator.drain();
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_remote_close_stops_session_reentrantly() {
        let mut h = harness();
        activate(&mut h).await;

        h.connector.socket().remote_close();
        h.coordinator.step().await;

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert!(h.coordinator.last_error().is_none());
        assert_eq!(h.renderer.closes(), 1);
    }

    #[tokio::test]
    async fn test_start_is_ignored_while_running_and_session_is_not_reused() {
        let mut h = harness();
        activate(&mut h).await;
        h.coordinator.start().unwrap();
        assert_eq!(h.renderer.starts(), 1);

        h.coordinator.stop();
        activate(&mut h).await;
        assert_eq!(h.renderer.starts(), 2);
        assert_eq!(h.connector.urls().len(), 2);
        assert_eq!(h.renderer.listeners().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connected_event_is_ignored() {
        let mut h = harness();
        activate(&mut h).await;
        h.renderer.fire(RendererEvent::Connected);
        h.coordinator.step().await;
        assert_eq!(h.renderer.audio().len(), 1);
        assert_eq!(h.connector.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_informational_events_become_notices() {
        let mut h = harness();
        activate(&mut h).await;
        while h.notices.try_recv().is_ok() {}

        h.connector.socket().deliver(
            r#"{"type":"conversation_initiation_metadata","conversation_initiation_metadata_event":{"conversation_id":"conv_9"}}"#,
        );
        h.connector.socket().deliver(
            r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hello"}}"#,
        );
        h.connector.socket().deliver(
            r#"{"type":"interruption","interruption_event":{"reason":"user"}}"#,
        );
        h.connector.socket().deliver(r#"{"type":"something_new"}"#);
        h.coordinator.drain();

        assert_eq!(h.coordinator.conversation_id(), Some("conv_9"));
        assert_eq!(h.renderer.clears(), 1);
        let notices: Vec<SessionNotice> = std::iter::from_fn(|| h.notices.try_recv().ok()).collect();
        assert_eq!(
            notices,
            vec![
                SessionNotice::ConversationStarted {
                    conversation_id: "conv_9".into()
                },
                SessionNotice::UserTranscript("hello".into()),
                SessionNotice::Interruption("user".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_loop_handles_commands() {
        let mut h = harness();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Command::Start).await.unwrap();
        tx.send(Command::Shutdown).await.unwrap();
        h.coordinator.run(rx).await;

        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(h.renderer.starts(), 1);
        assert_eq!(h.renderer.closes(), 1);
    }
}
