//! Microphone capture pipeline.
//!
//! A platform [`AudioBackend`] opens an [`AudioContext`] (the device), the pipeline
//! attaches a [`FrameProcessor`] node that down-mixes, resamples and frames samples
//! into fixed-size buffers, and the context then opens a [`DeviceStream`] that feeds
//! the node. [`CaptureHandle`] owns all three and releases them in reverse order.

use crate::codec::{self, WIRE_SAMPLE_RATE};
use crate::error::SessionError;
use rubato::{FastFixedIn, Resampler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

/// Samples per outbound buffer.
pub const CAPTURE_BUFFER_SIZE: usize = 4096;

/// Chunk size fed to the resampler when the device runs at a different rate.
const RESAMPLER_CHUNK: usize = 1024;

/// Constraints requested from the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub buffer_size: usize,
    /// Device name substring, or `"default"`.
    pub device: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: WIRE_SAMPLE_RATE,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            buffer_size: CAPTURE_BUFFER_SIZE,
            device: "default".to_string(),
        }
    }
}

/// The format the device actually delivers once opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// How a frame's samples are represented.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    /// Normalized mono samples, in-process.
    Float32(Vec<f32>),
    /// Base64 PCM16 text, as carried on the wire.
    Pcm16Base64(String),
}

/// An immutable buffer of mono audio at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub payload: AudioPayload,
}

impl AudioFrame {
    pub fn float32(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            payload: AudioPayload::Float32(samples),
        }
    }

    /// Whether the frame is worth sending. Wire frames are assumed to carry audio.
    pub fn has_audio(&self) -> bool {
        match &self.payload {
            AudioPayload::Float32(samples) => codec::has_audio(samples),
            AudioPayload::Pcm16Base64(text) => !text.is_empty(),
        }
    }

    /// Consumes the frame and returns its wire encoding.
    pub fn into_wire(self) -> String {
        match self.payload {
            AudioPayload::Float32(samples) => codec::encode_outbound(&samples),
            AudioPayload::Pcm16Base64(text) => text,
        }
    }
}

/// Callback receiving raw interleaved samples from the device thread.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Callback receiving framed capture buffers.
pub type FrameCallback = Box<dyn FnMut(CapturedFrame) + Send>;

/// Platform entry point for microphone access.
pub trait AudioBackend: Send + Sync {
    /// Acquires the input device. Permission problems surface here.
    fn open_context(&self, config: &CaptureConfig) -> Result<Box<dyn AudioContext>, SessionError>;
}

/// An acquired input device.
pub trait AudioContext: Send {
    fn input_format(&self) -> InputFormat;

    /// Starts delivering interleaved samples to `on_samples`.
    fn open_stream(&mut self, on_samples: SampleCallback)
    -> Result<Box<dyn DeviceStream>, SessionError>;

    /// Releases the device. Must be idempotent.
    fn close(&mut self);
}

/// A running device stream.
pub trait DeviceStream: Send {
    /// Stops delivery. Must be idempotent.
    fn stop(&mut self);
}

/// At-most-one-in-flight flag for frame processing.
#[derive(Debug, Clone, Default)]
pub struct InFlightGate {
    busy: Arc<AtomicBool>,
}

impl InFlightGate {
    /// Marks the gate busy, or returns `None` if a frame is already being handled.
    pub fn try_acquire(&self) -> Option<InFlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the gate when the frame it guards has been consumed.
#[derive(Debug)]
pub struct InFlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// A capture buffer together with its in-flight guard.
#[derive(Debug)]
pub struct CapturedFrame {
    pub frame: AudioFrame,
    _in_flight: InFlightGuard,
}

impl CapturedFrame {
    pub fn samples(&self) -> &[f32] {
        match &self.frame.payload {
            AudioPayload::Float32(samples) => samples,
            AudioPayload::Pcm16Base64(_) => &[],
        }
    }
}

/// Processing node between the device and the frame consumer.
///
/// A frame produced while the previous one is still in flight is dropped, not
/// queued.
pub struct FrameProcessor {
    channels: usize,
    resampler: Option<FastFixedIn<f32>>,
    resample_input: Vec<f32>,
    pending: Vec<f32>,
    frame_len: usize,
    sample_rate: u32,
    gate: InFlightGate,
    on_frame: Option<FrameCallback>,
    dropped: u64,
}

impl FrameProcessor {
    pub fn new(
        format: InputFormat,
        config: &CaptureConfig,
        on_frame: FrameCallback,
    ) -> Result<Self, SessionError> {
        let resampler = if format.sample_rate != config.sample_rate {
            debug!(
                from = format.sample_rate,
                to = config.sample_rate,
                "Resampling microphone input"
            );
            let resampler = codec::create_resampler(
                format.sample_rate as f64,
                config.sample_rate as f64,
                RESAMPLER_CHUNK,
            )
            .map_err(|e| SessionError::CaptureDevice(format!("resampler setup failed: {e}")))?;
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            channels: format.channels.max(1) as usize,
            resampler,
            resample_input: Vec::new(),
            pending: Vec::with_capacity(config.buffer_size * 2),
            frame_len: config.buffer_size.max(1),
            sample_rate: config.sample_rate,
            gate: InFlightGate::default(),
            on_frame: Some(on_frame),
            dropped: 0,
        })
    }

    /// Feeds interleaved device samples through the node.
    pub fn process(&mut self, interleaved: &[f32]) {
        if self.on_frame.is_none() {
            return;
        }
        let mono = codec::downmix_to_mono(interleaved, self.channels);

        match self.resampler.as_mut() {
            Some(resampler) => {
                self.resample_input.extend_from_slice(&mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.resample_input.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.resample_input.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(out) => self.pending.extend_from_slice(&out[0]),
                        Err(e) => warn!("Resampler rejected a chunk: {}", e),
                    }
                }
            }
            None => self.pending.extend_from_slice(&mono),
        }

        while self.pending.len() >= self.frame_len {
            let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            self.emit(samples);
        }
    }

    fn emit(&mut self, samples: Vec<f32>) {
        let Some(on_frame) = self.on_frame.as_mut() else {
            return;
        };
        match self.gate.try_acquire() {
            Some(guard) => on_frame(CapturedFrame {
                frame: AudioFrame::float32(self.sample_rate, samples),
                _in_flight: guard,
            }),
            None => {
                self.dropped += 1;
                trace!(dropped = self.dropped, "Previous frame still in flight; dropping buffer");
            }
        }
    }

    /// Detaches the consumer. Later device callbacks become no-ops.
    pub fn disconnect(&mut self) {
        self.on_frame = None;
        self.pending.clear();
        self.resample_input.clear();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    pub fn gate(&self) -> &InFlightGate {
        &self.gate
    }
}

/// Owns the device stream, processing node and device context of one capture.
pub struct CaptureHandle {
    stream: Option<Box<dyn DeviceStream>>,
    processor: Option<Arc<Mutex<FrameProcessor>>>,
    context: Option<Box<dyn AudioContext>>,
}

impl CaptureHandle {
    /// Opens the microphone and starts delivering frames to `on_frame`.
    ///
    /// On failure every resource acquired so far is released before the error is
    /// returned.
    pub fn start(
        backend: &dyn AudioBackend,
        config: &CaptureConfig,
        on_frame: FrameCallback,
    ) -> Result<Self, SessionError> {
        let mut context = backend.open_context(config)?;
        let format = context.input_format();

        let processor = match FrameProcessor::new(format, config, on_frame) {
            Ok(processor) => Arc::new(Mutex::new(processor)),
            Err(e) => {
                context.close();
                return Err(e);
            }
        };

        let node = Arc::clone(&processor);
        let stream = context.open_stream(Box::new(move |data: &[f32]| {
            lock_processor(&node).process(data);
        }));
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                lock_processor(&processor).disconnect();
                context.close();
                return Err(e);
            }
        };

        info!(
            device_rate = format.sample_rate,
            device_channels = format.channels,
            "Microphone capture started"
        );
        Ok(Self {
            stream: Some(stream),
            processor: Some(processor),
            context: Some(context),
        })
    }

    /// Opens and immediately releases the device, surfacing permission errors early.
    pub fn preflight(
        backend: &dyn AudioBackend,
        config: &CaptureConfig,
    ) -> Result<InputFormat, SessionError> {
        let mut context = backend.open_context(config)?;
        let format = context.input_format();
        context.close();
        Ok(format)
    }

    /// Releases the stream, then the processing node, then the context. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if let Some(processor) = self.processor.take() {
            let mut processor = lock_processor(&processor);
            debug!(dropped = processor.dropped_frames(), "Detaching frame processor");
            processor.disconnect();
        }
        if let Some(mut context) = self.context.take() {
            context.close();
            info!("Microphone capture stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Locks the processor, recovering it if a frame callback panicked while holding it.
fn lock_processor(processor: &Mutex<FrameProcessor>) -> MutexGuard<'_, FrameProcessor> {
    processor.lock().unwrap_or_else(|poisoned| {
        warn!("Frame processor lock was poisoned; recovering");
        PoisonError::into_inner(poisoned)
    })
}
