//! Microphone access through `cpal`.
//!
//! `cpal::Stream` is not `Send`, so each capture stream lives on its own thread and is
//! dropped there when the stop signal arrives.

use avatalk_core::SessionError;
use avatalk_core::capture::{
    AudioBackend, AudioContext, CaptureConfig, DeviceStream, InputFormat, SampleCallback,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Opens input devices on the platform's default `cpal` host.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_context(&self, config: &CaptureConfig) -> Result<Box<dyn AudioContext>, SessionError> {
        let host = cpal::default_host();
        let device = if config.device == "default" {
            host.default_input_device().ok_or_else(|| {
                SessionError::PermissionDenied("no input device is available".to_string())
            })?
        } else {
            find_device_by_name(&host, &config.device)?
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let (stream_config, sample_format) = choose_stream_config(&device, config)?;
        info!(
            device = %device_name,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            "Using audio input device"
        );
        if config.echo_cancellation || config.noise_suppression {
            debug!("Echo cancellation and noise suppression are left to the platform audio stack");
        }

        Ok(Box::new(CpalContext {
            device: Some(device),
            stream_config,
            sample_format,
        }))
    }
}

/// Prefers the requested rate and channel count, falling back to the device default.
fn choose_stream_config(
    device: &Device,
    config: &CaptureConfig,
) -> Result<(StreamConfig, SampleFormat), SessionError> {
    let wanted = SampleRate(config.sample_rate);
    let exact = device
        .supported_input_configs()
        .map_err(|e| SessionError::PermissionDenied(e.to_string()))?
        .filter(|c| c.channels() == config.channels)
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .find(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
        .map(|c| c.with_sample_rate(wanted));

    let supported = match exact {
        Some(supported) => supported,
        None => device
            .default_input_config()
            .map_err(|e| SessionError::CaptureDevice(e.to_string()))?,
    };

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    Ok((stream_config, supported.sample_format()))
}

fn find_device_by_name(host: &cpal::Host, name: &str) -> Result<Device, SessionError> {
    let devices = host
        .input_devices()
        .map_err(|e| SessionError::CaptureDevice(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name.contains(name) || name.contains(&device_name) {
                return Ok(device);
            }
        }
    }
    Err(SessionError::PermissionDenied(format!(
        "input device '{}' not found",
        name
    )))
}

struct CpalContext {
    device: Option<Device>,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioContext for CpalContext {
    fn input_format(&self) -> InputFormat {
        InputFormat {
            sample_rate: self.stream_config.sample_rate.0,
            channels: self.stream_config.channels,
        }
    }

    fn open_stream(
        &mut self,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn DeviceStream>, SessionError> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| SessionError::CaptureDevice("audio context is closed".to_string()))?;
        let config = self.stream_config.clone();
        let sample_format = self.sample_format;

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), SessionError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_audio_thread(device, config, sample_format, on_samples, ready_tx, stop_rx)
            })
            .map_err(|e| {
                SessionError::CaptureDevice(format!("Failed to spawn audio thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SessionError::CaptureDevice(
                    "audio thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("Audio context released");
        }
    }
}

/// Owns the stream for its whole life and drops it once `stop_rx` fires.
fn run_audio_thread(
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    on_samples: SampleCallback,
    ready_tx: mpsc::SyncSender<Result<(), SessionError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stream = match build_input_stream(&device, &config, sample_format, on_samples) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(SessionError::CaptureDevice(format!(
            "Failed to start audio stream: {}",
            e
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    debug!("Audio capture thread started");

    // Either an explicit stop or the sender being dropped ends the stream.
    let _ = stop_rx.recv();

    debug!("Audio capture thread stopping");
    drop(stream);
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mut on_samples: SampleCallback,
) -> Result<Stream, SessionError> {
    let err_fn = |err| error!("Audio stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                on_samples(&samples);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(SessionError::CaptureDevice(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    };

    stream.map_err(|e| match e {
        BuildStreamError::DeviceNotAvailable => {
            SessionError::PermissionDenied("input device is not available".to_string())
        }
        other => SessionError::CaptureDevice(other.to_string()),
    })
}

struct CpalStream {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeviceStream for CpalStream {
    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Audio capture thread panicked");
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}
