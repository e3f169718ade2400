//! Duplex Session Protocol
//!
//! The message state machine spoken with the conversational agent over a persistent
//! socket. It is split into:
//!
//! - `messages`: the JSON frames in both directions.
//! - `transport`: the socket abstraction the state machine drives.

pub mod messages;
pub mod transport;

use crate::codec;
use crate::error::SessionError;
use messages::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use transport::{DuplexSocket, SocketConnector, SocketEvent, SocketEventFn};

/// Connection state of one protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What the coordinator needs to know about after a socket event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The socket opened and `conversation_initiation_client_data` was sent.
    Ready,
    ConversationStarted { conversation_id: String },
    UserTranscript(String),
    AgentResponse(String),
    Interruption(String),
    /// Decoded PCM bytes for the renderer.
    Audio(Vec<u8>),
    /// The transport failed; the connection is now closed.
    ConnectionLost(String),
    /// The connection closed without a transport error.
    Closed,
}

/// One connection to the agent.
pub struct ProtocolClient {
    socket: Arc<dyn DuplexSocket>,
    state: ConnectionState,
}

impl ProtocolClient {
    /// Starts connecting to `url`. Socket events must be fed back through
    /// [`ProtocolClient::handle_socket_event`].
    pub fn connect(connector: &dyn SocketConnector, url: &str, on_event: SocketEventFn) -> Self {
        debug!("Connecting to conversational agent");
        Self {
            socket: connector.connect(url, on_event),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Advances the state machine for one socket event.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> Option<ProtocolEvent> {
        match event {
            SocketEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return None;
                }
                self.state = ConnectionState::Open;
                info!("Agent socket open; sending conversation initiation");
                if let Err(e) = self.send(&ClientMessage::conversation_initiation()) {
                    self.shutdown();
                    return Some(ProtocolEvent::ConnectionLost(e.to_string()));
                }
                Some(ProtocolEvent::Ready)
            }
            SocketEvent::Message(text) => {
                if self.state != ConnectionState::Open {
                    trace!(state = ?self.state, "Ignoring frame received outside the open state");
                    return None;
                }
                match self.dispatch_message(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("{}", e);
                        None
                    }
                }
            }
            SocketEvent::Error(reason) => {
                if !self.shutdown() {
                    return None;
                }
                warn!(%reason, "Agent socket error");
                Some(ProtocolEvent::ConnectionLost(reason))
            }
            SocketEvent::Closed => self.shutdown().then_some(ProtocolEvent::Closed),
        }
    }

    fn dispatch_message(&self, text: &str) -> Result<Option<ProtocolEvent>, SessionError> {
        let message: ServerMessage = serde_json::from_str(text)
            .map_err(|e| SessionError::MalformedMessage(format!("{e}: {text:.120}")))?;

        let event = match message {
            ServerMessage::ConversationInitiationMetadata {
                conversation_initiation_metadata_event,
            } => Some(ProtocolEvent::ConversationStarted {
                conversation_id: conversation_initiation_metadata_event.conversation_id,
            }),
            ServerMessage::Ping { ping_event } => {
                let delay = Duration::from_millis(ping_event.ping_ms.unwrap_or(0));
                self.schedule_pong(ping_event.event_id, delay);
                None
            }
            ServerMessage::UserTranscript {
                user_transcription_event,
            } => Some(ProtocolEvent::UserTranscript(
                user_transcription_event.user_transcript,
            )),
            ServerMessage::AgentResponse {
                agent_response_event,
            } => Some(ProtocolEvent::AgentResponse(
                agent_response_event.agent_response,
            )),
            ServerMessage::Interruption { interruption_event } => {
                Some(ProtocolEvent::Interruption(interruption_event.reason))
            }
            ServerMessage::Audio { audio_event } => {
                let bytes = codec::decode_inbound(&audio_event.audio_base_64)?;
                trace!(event_id = audio_event.event_id, bytes = bytes.len(), "Agent audio");
                Some(ProtocolEvent::Audio(bytes))
            }
            ServerMessage::Unknown => {
                trace!("Ignoring frame with unrecognized type");
                None
            }
        };
        Ok(event)
    }

    /// Replies to a ping after `delay`. Fire-and-forget: if the socket has closed by
    /// then the send is a no-op.
    fn schedule_pong(&self, event_id: u64, delay: Duration) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = send_frame(socket.as_ref(), &ClientMessage::pong(event_id)) {
                debug!(event_id, "Pong not delivered: {}", e);
            }
        });
    }

    /// Sends one capture buffer as `user_audio_chunk`.
    ///
    /// Returns `Ok(false)` when the connection is not open; the audio is dropped.
    pub fn send_user_audio(&self, wire_audio: String) -> Result<bool, SessionError> {
        if self.state != ConnectionState::Open {
            trace!(state = ?self.state, "Dropping capture audio while not open");
            return Ok(false);
        }
        self.send(&ClientMessage::user_audio_chunk(wire_audio))?;
        Ok(true)
    }

    fn send(&self, message: &ClientMessage) -> Result<(), SessionError> {
        send_frame(self.socket.as_ref(), message)
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) {
        if self.shutdown() {
            info!("Agent socket closed");
        }
    }

    /// Converges every close path on `Closed`. Returns false if already closed.
    fn shutdown(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closing;
        self.socket.close();
        self.state = ConnectionState::Closed;
        true
    }
}

fn send_frame(socket: &dyn DuplexSocket, message: &ClientMessage) -> Result<(), SessionError> {
    let serialized = serde_json::to_string(message)
        .map_err(|e| SessionError::TransportError(format!("failed to serialize frame: {e}")))?;
    socket.send(serialized)
}
