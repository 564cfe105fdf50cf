/// cpal microphone and processing context
///
/// Captures from the default (or named) input device. The context runs at
/// the device's native rate and gates frame delivery while it is open.

use super::{
    AudioContext, AudioError, AudioGraphBuilder, AudioResourceAcquirer, AudioSample,
    CaptureConstraints, MicrophoneStream,
};
use crate::engine::ProcessingNode;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type Sink = Arc<Mutex<Option<Arc<dyn ProcessingNode>>>>;

/// Find an input device by name, or the default input device
fn input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    debug!("Audio host: {:?}", host.id());

    if let Some(name) = name {
        let found = host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));

        return found.ok_or_else(|| {
            AudioError::DeviceUnavailable(format!("input device '{}' not found", name))
        });
    }

    host.default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".to_string()))
}

fn build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("permission") =>
        {
            AudioError::PermissionDenied(err.description)
        }
        other => AudioError::DeviceUnavailable(other.to_string()),
    }
}

/// Acquires the microphone through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

#[async_trait]
impl AudioResourceAcquirer for CpalMicrophone {
    async fn acquire_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn MicrophoneStream>, AudioError> {
        let constraints = constraints.clone();
        let stream = tokio::task::spawn_blocking(move || CpalStream::open(constraints))
            .await
            .map_err(|e| AudioError::DeviceUnavailable(format!("capture thread failed: {}", e)))??;

        Ok(Arc::new(stream))
    }
}

/// Live capture running on its own thread
///
/// `cpal::Stream` is not `Send`, so the stream is built, played and
/// dropped on a dedicated thread. Releasing the handle signals that thread.
pub struct CpalStream {
    sample_rate: u32,
    sink: Sink,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalStream {
    fn open(constraints: CaptureConstraints) -> Result<Self, AudioError> {
        let sink: Sink = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_sink = Arc::clone(&sink);
        let thread = thread::Builder::new()
            .name("wakeword-capture".to_string())
            .spawn(move || {
                let stream = match start_capture(&constraints, thread_sink) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blocks until release() or until the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture thread exiting");
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::DeviceUnavailable(
                    "capture thread exited before reporting".to_string(),
                ));
            }
        };

        info!("Microphone capture running at {} Hz", sample_rate);

        Ok(Self {
            sample_rate,
            sink,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn start_capture(
    constraints: &CaptureConstraints,
    sink: Sink,
) -> Result<(cpal::Stream, u32), AudioError> {
    let device = input_device(constraints.device_name.as_deref())?;
    let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    let channels = supported.channels().max(1) as usize;
    let sample_rate = supported.sample_rate().0;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    info!(
        "Opening '{}': {} Hz, {} channel(s), {:?}",
        device_name, sample_rate, channels, sample_format
    );

    if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
        // cpal exposes raw capture; processing depends on the OS input chain.
        debug!(
            "Requested echo_cancellation={}, noise_suppression={}, auto_gain_control={} (advisory)",
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );
    }

    let err_fn = |err: cpal::StreamError| error!("Capture stream error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(&sink, data, channels, |s| s),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                deliver(&sink, data, channels, |s| s as f32 / i16::MAX as f32)
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                deliver(&sink, data, channels, |s| (s as f32 - 32768.0) / 32768.0)
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(build_error)?;

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Downmix to mono and hand the block to the attached node, if any
fn deliver<T: Copy>(sink: &Sink, data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) {
    let sink = sink.lock();
    let Some(node) = sink.as_ref() else {
        return;
    };

    let mono: Vec<AudioSample> = if channels == 1 {
        data.iter().map(|&s| to_f32(s)).collect()
    } else {
        data.chunks(channels)
            .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32)
            .collect()
    };

    node.process(&mono);
}

impl MicrophoneStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn attach(&self, node: Arc<dyn ProcessingNode>) -> Result<(), AudioError> {
        if self.stop_tx.lock().is_none() {
            return Err(AudioError::Graph("microphone stream already released".to_string()));
        }
        *self.sink.lock() = Some(node);
        Ok(())
    }

    fn detach(&self) {
        self.sink.lock().take();
    }

    fn release(&self) -> Result<(), AudioError> {
        self.detach();

        let Some(stop_tx) = self.stop_tx.lock().take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());

        if let Some(thread) = self.thread.lock().take() {
            thread
                .join()
                .map_err(|_| AudioError::Release("capture thread panicked".to_string()))?;
        }

        info!("Microphone released");
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(e) = MicrophoneStream::release(self) {
            warn!("Error releasing microphone on drop: {}", e);
        }
    }
}

/// Processing contexts backed by the cpal input device clock
#[derive(Debug, Default, Clone)]
pub struct CpalGraph {
    device_name: Option<String>,
}

impl CpalGraph {
    /// Contexts run at the native rate of `device_name` (or the default
    /// input device), matching the stream `CpalMicrophone` opens for it.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioGraphBuilder for CpalGraph {
    async fn create_context(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
        let device_name = self.device_name.clone();
        let sample_rate = tokio::task::spawn_blocking(move || {
            let device = input_device(device_name.as_deref())?;
            device
                .default_input_config()
                .map(|config| config.sample_rate().0)
                .map_err(|e| AudioError::Context(e.to_string()))
        })
        .await
        .map_err(|e| AudioError::Context(e.to_string()))??;

        let context = CpalContext {
            sample_rate,
            running: AtomicBool::new(false),
        };
        context.resume();

        Ok(Arc::new(context))
    }
}

pub struct CpalContext {
    sample_rate: u32,
    running: AtomicBool,
}

impl CpalContext {
    fn resume(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Audio context running at {} Hz", self.sample_rate);
    }
}

#[async_trait]
impl AudioContext for CpalContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AudioError> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Audio context closed");
        }
        Ok(())
    }
}
