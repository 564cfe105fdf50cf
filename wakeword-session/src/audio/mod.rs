/// Audio platform boundary
///
/// Microphone acquisition, processing context and graph wiring. The traits
/// here are what the session controller drives; `cpal_backend` provides the
/// real platform implementation when the `cpal-backend` feature is enabled.

pub mod buffer;
#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
pub mod graph;
pub mod microphone;

use thiserror::Error;

pub use buffer::{AudioBuffer, AudioBufferError, AudioSample};
pub use graph::{connect_stream, AudioContext, AudioGraphBuilder, GraphConnection};
pub use microphone::{AudioResourceAcquirer, CaptureConstraints, MicrophoneStream};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio context error: {0}")]
    Context(String),

    #[error("Audio graph error: {0}")]
    Graph(String),

    #[error("Release failed: {0}")]
    Release(String),
}
