//! Recording stubs for the coordinator's collaborators.

use crate::capture::{
    AudioBackend, AudioContext, CaptureConfig, DeviceStream, InputFormat, SampleCallback,
};
use crate::error::SessionError;
use crate::protocol::transport::{DuplexSocket, SocketConnector, SocketEvent, SocketEventFn};
use crate::renderer::{
    ListenerRegistry, RendererConfig, RendererEvent, RendererListener, RendererSink, Subscription,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Lets spawned tasks that are ready to run make progress.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct StubSocket {
    open: AtomicBool,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    on_event: Mutex<Option<SocketEventFn>>,
}

impl StubSocket {
    fn emit(&self, event: SocketEvent) {
        let on_event = self.on_event.lock().unwrap().clone();
        if let Some(on_event) = on_event {
            on_event(event);
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.emit(SocketEvent::Opened);
    }

    pub fn deliver(&self, text: &str) {
        self.emit(SocketEvent::Message(text.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(SocketEvent::Error(reason.to_string()));
    }

    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(SocketEvent::Closed);
    }

    /// Every `send` call, including those on a closed socket.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// Frames that actually went out while open.
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_open_now(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl DuplexSocket for StubSocket {
    fn send(&self, frame: String) -> Result<(), SessionError> {
        self.attempts.lock().unwrap().push(frame.clone());
        if self.is_open_now() {
            self.delivered.lock().unwrap().push(frame);
        }
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.is_open_now()
    }
}

#[derive(Default)]
pub struct StubConnector {
    urls: Mutex<Vec<String>>,
    sockets: Mutex<Vec<Arc<StubSocket>>>,
}

impl StubConnector {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// The most recently connected socket.
    pub fn socket(&self) -> Arc<StubSocket> {
        self.sockets
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no socket has been connected")
    }
}

impl SocketConnector for StubConnector {
    fn connect(&self, url: &str, on_event: SocketEventFn) -> Arc<dyn DuplexSocket> {
        self.urls.lock().unwrap().push(url.to_string());
        let socket = Arc::new(StubSocket::default());
        *socket.on_event.lock().unwrap() = Some(on_event);
        self.sockets.lock().unwrap().push(Arc::clone(&socket));
        socket
    }
}

#[derive(Default)]
pub struct StubRenderer {
    listeners: ListenerRegistry,
    reject_initialize: AtomicBool,
    starts: AtomicUsize,
    closes: AtomicUsize,
    clears: AtomicUsize,
    audio: Mutex<Vec<Vec<u8>>>,
}

impl StubRenderer {
    pub fn reject_initialize(&self) {
        self.reject_initialize.store(true, Ordering::SeqCst);
    }

    pub fn fire(&self, event: RendererEvent) {
        self.listeners.emit(event);
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.audio.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl RendererSink for StubRenderer {
    fn initialize(&self, config: &RendererConfig) -> Result<(), SessionError> {
        if self.reject_initialize.load(Ordering::SeqCst) {
            return RendererConfig::default().validate();
        }
        config.validate()
    }

    fn start(&self) -> Result<(), SessionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn send_audio_data(&self, bytes: Vec<u8>) {
        self.audio.lock().unwrap().push(bytes);
    }

    fn clear_buffer(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self, listener: RendererListener) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

#[derive(Default)]
struct BackendShared {
    callback: Option<SampleCallback>,
    release_log: Vec<String>,
    contexts_opened: usize,
}

/// An audio backend whose "device" is driven by [`StubAudioBackend::push`].
pub struct StubAudioBackend {
    format: InputFormat,
    deny: bool,
    fail_stream: bool,
    shared: Arc<Mutex<BackendShared>>,
}

impl StubAudioBackend {
    pub fn new(format: InputFormat) -> Self {
        Self {
            format,
            deny: false,
            fail_stream: false,
            shared: Arc::default(),
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new(InputFormat {
                sample_rate: 16_000,
                channels: 1,
            })
        }
    }

    pub fn failing_stream(mut self) -> Self {
        self.fail_stream = true;
        self
    }

    /// Delivers interleaved samples as the device callback would.
    pub fn push(&self, samples: &[f32]) {
        let callback = self.shared.lock().unwrap().callback.take();
        if let Some(mut callback) = callback {
            callback(samples);
            let mut shared = self.shared.lock().unwrap();
            if shared.callback.is_none() && !shared.release_log.iter().any(|r| r == "stream") {
                shared.callback = Some(callback);
            }
        }
    }

    pub fn release_log(&self) -> Vec<String> {
        self.shared.lock().unwrap().release_log.clone()
    }

    pub fn contexts_opened(&self) -> usize {
        self.shared.lock().unwrap().contexts_opened
    }
}

impl AudioBackend for StubAudioBackend {
    fn open_context(&self, _config: &CaptureConfig) -> Result<Box<dyn AudioContext>, SessionError> {
        if self.deny {
            return Err(SessionError::PermissionDenied("user dismissed the prompt".into()));
        }
        self.shared.lock().unwrap().contexts_opened += 1;
        Ok(Box::new(StubContext {
            format: self.format,
            fail_stream: self.fail_stream,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct StubContext {
    format: InputFormat,
    fail_stream: bool,
    shared: Arc<Mutex<BackendShared>>,
    closed: bool,
}

impl AudioContext for StubContext {
    fn input_format(&self) -> InputFormat {
        self.format
    }

    fn open_stream(
        &mut self,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn DeviceStream>, SessionError> {
        if self.fail_stream {
            return Err(SessionError::CaptureDevice("stream build failed".into()));
        }
        let mut shared = self.shared.lock().unwrap();
        shared.callback = Some(on_samples);
        shared.release_log.clear();
        Ok(Box::new(StubStream {
            shared: Arc::clone(&self.shared),
            stopped: false,
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.lock().unwrap().release_log.push("context".into());
        }
    }
}

struct StubStream {
    shared: Arc<Mutex<BackendShared>>,
    stopped: bool,
}

impl DeviceStream for StubStream {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let mut shared = self.shared.lock().unwrap();
            shared.callback = None;
            shared.release_log.push("stream".into());
        }
    }
}
