//! Renderer Sink interface: the avatar client that turns agent audio into lip-synced
//! video.

use crate::error::SessionError;
use std::sync::{Arc, Mutex};

/// Readiness events raised by a renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererEvent {
    Connected,
    Disconnected,
}

pub type RendererListener = Arc<dyn Fn(RendererEvent) + Send + Sync>;

/// Settings handed to [`RendererSink::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    pub face_id: String,
    /// Output target for video frames. Must exist before initialization.
    pub video_surface: Option<String>,
    /// Output target for the renderer's audio. Must exist before initialization.
    pub audio_surface: Option<String>,
    pub handle_silence: bool,
    pub max_session_length_secs: u64,
    pub max_idle_time_secs: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            face_id: String::new(),
            video_surface: None,
            audio_surface: None,
            handle_silence: true,
            max_session_length_secs: 3600,
            max_idle_time_secs: 600,
        }
    }
}

impl RendererConfig {
    /// Checks that both output surfaces are present.
    pub fn validate(&self) -> Result<(), SessionError> {
        match (&self.video_surface, &self.audio_surface) {
            (Some(_), Some(_)) => Ok(()),
            (None, _) => Err(SessionError::RendererPreconditionFailure(
                "video surface is not available".to_string(),
            )),
            (_, None) => Err(SessionError::RendererPreconditionFailure(
                "audio surface is not available".to_string(),
            )),
        }
    }
}

/// The operations the coordinator relies on. `Connected` fires once per successful
/// [`RendererSink::start`].
pub trait RendererSink: Send + Sync {
    fn initialize(&self, config: &RendererConfig) -> Result<(), SessionError>;
    fn start(&self) -> Result<(), SessionError>;
    /// Tears the renderer connection down. Idempotent, and safe before `initialize`.
    fn close(&self);
    fn send_audio_data(&self, bytes: Vec<u8>);
    fn clear_buffer(&self);
    fn subscribe(&self, listener: RendererListener) -> Subscription;
}

/// Unsubscribes its listener when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, RendererListener)>,
}

/// Listener bookkeeping shared by renderer adapters.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Listeners>>,
}

impl ListenerRegistry {
    pub fn subscribe(&self, listener: RendererListener) -> Subscription {
        let id = match self.inner.lock() {
            Ok(mut listeners) => {
                let id = listeners.next_id;
                listeners.next_id += 1;
                listeners.entries.push((id, listener));
                id
            }
            Err(_) => return Subscription::new(|| {}),
        };
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            if let Ok(mut listeners) = inner.lock() {
                listeners.entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Invokes every listener. Listeners run outside the registry lock.
    pub fn emit(&self, event: RendererEvent) {
        let snapshot: Vec<RendererListener> = match self.inner.lock() {
            Ok(listeners) => listeners.entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|l| l.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
