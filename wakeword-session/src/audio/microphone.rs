/// Microphone acquisition
///
/// Capture is requested with noise-robust settings: a single channel with
/// echo cancellation, noise suppression and automatic gain enabled.

use super::AudioError;
use crate::engine::ProcessingNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Capture settings requested from the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    /// Number of capture channels (the engine expects mono)
    pub channel_count: u16,

    pub echo_cancellation: bool,

    pub noise_suppression: bool,

    pub auto_gain_control: bool,

    /// Input device to use; `None` selects the platform default
    pub device_name: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_name: None,
        }
    }
}

/// A live capture stream
///
/// Samples are delivered mono, at `sample_rate()`, to whichever processing
/// node is attached. With no node attached, captured audio is discarded.
pub trait MicrophoneStream: Send + Sync {
    /// Native sample rate of the capture
    fn sample_rate(&self) -> u32;

    /// Route captured audio into `node`, replacing any previous sink
    fn attach(&self, node: Arc<dyn ProcessingNode>) -> Result<(), AudioError>;

    /// Stop routing captured audio anywhere
    fn detach(&self);

    /// Stop every underlying capture track. Idempotent.
    fn release(&self) -> Result<(), AudioError>;
}

/// Obtains microphone access from the platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioResourceAcquirer: Send + Sync {
    /// Fails with `PermissionDenied` or `DeviceUnavailable` when the
    /// platform refuses access or has no capture device.
    async fn acquire_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn MicrophoneStream>, AudioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constraints_are_noise_robust() {
        let constraints = CaptureConstraints::default();
        assert_eq!(constraints.channel_count, 1);
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
        assert!(constraints.auto_gain_control);
        assert!(constraints.device_name.is_none());
    }

    #[test]
    fn test_partial_constraints_fill_defaults() {
        let constraints: CaptureConstraints =
            serde_json::from_str(r#"{"device_name": "USB Mic"}"#).unwrap();
        assert_eq!(constraints.device_name.as_deref(), Some("USB Mic"));
        assert_eq!(constraints.channel_count, 1);
        assert!(constraints.noise_suppression);
    }
}
