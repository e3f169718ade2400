//! The persistent socket the protocol runs over.

use crate::error::SessionError;
use std::sync::Arc;

/// Lifecycle and data events raised by a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

/// Receives every event of one socket, in arrival order.
pub type SocketEventFn = Arc<dyn Fn(SocketEvent) + Send + Sync>;

/// A text-frame duplex socket.
///
/// Sending on a socket that is not open is a silent no-op.
pub trait DuplexSocket: Send + Sync {
    fn send(&self, frame: String) -> Result<(), SessionError>;

    /// Starts closing the socket. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens sockets. Connection happens in the background; progress arrives through
/// `on_event` starting with [`SocketEvent::Opened`] or [`SocketEvent::Error`].
pub trait SocketConnector: Send + Sync {
    fn connect(&self, url: &str, on_event: SocketEventFn) -> Arc<dyn DuplexSocket>;
}
