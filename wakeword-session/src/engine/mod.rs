/// Detection engine adapter
///
/// Typed boundary to the external wake-word recognition engine. The engine
/// is opaque: it is constructed for a sample rate with tuning parameters,
/// loads named patterns from model resources, hands out a processing node to
/// feed audio into, and reports detections on a stream.

pub mod level;

use crate::audio::{AudioContext, AudioSample};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use level::{LevelEngine, LevelEngineFactory};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Init(String),

    #[error("Failed to load pattern '{name}' from {location}: {reason}")]
    PatternLoad {
        name: String,
        location: String,
        reason: String,
    },

    #[error("Processing node creation failed: {0}")]
    ProcessingNode(String),

    #[error("Detections already subscribed for this engine")]
    AlreadySubscribed,

    #[error("Engine has been disposed")]
    Disposed,
}

/// Engine tuning, passed through to the engine unmodified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Per-frame detection confidence cutoff (0.0 - 1.0)
    pub threshold: f32,

    /// Smoothed-confidence cutoff (0.0 - 1.0)
    pub averaged_threshold: f32,

    /// Linear gain applied before scoring
    pub gain: f32,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            averaged_threshold: 0.20,
            gain: 1.2,
        }
    }
}

/// A named acoustic pattern and where its trained model lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPattern {
    pub name: String,

    /// Path or URL of the model resource; the format is engine-specific
    pub model_location: String,
}

impl RegisteredPattern {
    pub fn new(name: impl Into<String>, model_location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_location: model_location.into(),
        }
    }
}

/// Locations of the engine's runtime assets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineAssets {
    pub worklet_location: String,
    pub worker_location: String,
    pub wasm_location: String,
}

impl Default for EngineAssets {
    fn default() -> Self {
        Self {
            worklet_location: "static/rustpotter-worklet.js".to_string(),
            worker_location: "static/rustpotter-worker.js".to_string(),
            wasm_location: "static/rustpotter_wasm_bg.wasm".to_string(),
        }
    }
}

/// One recognised occurrence of a pattern
///
/// Fields are read-only; an event is never changed after the engine
/// creates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    timestamp: DateTime<Utc>,
    pattern_name: String,
    raw_payload: serde_json::Value,
}

impl DetectionEvent {
    /// Create an event stamped with the current time
    pub fn new(pattern_name: impl Into<String>, raw_payload: serde_json::Value) -> Self {
        Self::at(Utc::now(), pattern_name, raw_payload)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        pattern_name: impl Into<String>,
        raw_payload: serde_json::Value,
    ) -> Self {
        Self {
            timestamp,
            pattern_name: pattern_name.into(),
            raw_payload,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn pattern_name(&self) -> &str {
        &self.pattern_name
    }

    /// Engine-specific payload, exactly as the engine produced it
    pub fn raw_payload(&self) -> &serde_json::Value {
        &self.raw_payload
    }

    /// `[HH:MM:SS] <payload>` in local time, the form shown in logs and
    /// published as the last detection text
    pub fn display_text(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.with_timezone(&Local).format("%H:%M:%S"),
            self.raw_payload
        )
    }
}

/// Sending half handed to engine internals
pub type DetectionSender = mpsc::UnboundedSender<DetectionEvent>;

/// Detections reported by one engine instance
///
/// Ends when the engine is disposed. Each engine produces a fresh stream, so
/// a new session always starts from an empty one.
pub struct DetectionStream {
    rx: mpsc::UnboundedReceiver<DetectionEvent>,
}

impl DetectionStream {
    /// Create a connected sender/stream pair
    pub fn channel() -> (DetectionSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next detection; `None` once the engine is gone
    pub async fn next(&mut self) -> Option<DetectionEvent> {
        self.rx.recv().await
    }
}

/// Audio graph unit that feeds frames to the engine
///
/// Called from the platform's real-time audio context; implementations
/// must not block.
pub trait ProcessingNode: Send + Sync {
    /// Consume a block of mono samples at the context sample rate
    fn process(&self, samples: &[AudioSample]);
}

/// A constructed engine instance
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Load a pattern. May be called repeatedly; every call must complete
    /// before audio is connected, otherwise that pattern never fires.
    async fn register_pattern(&self, pattern: &RegisteredPattern) -> Result<(), EngineError>;

    /// Build the node audio is fed into
    async fn create_processing_node(
        &self,
        context: &dyn AudioContext,
    ) -> Result<Arc<dyn ProcessingNode>, EngineError>;

    /// Take the detection stream. Only the first call succeeds.
    fn subscribe_detections(&self) -> Result<DetectionStream, EngineError>;

    /// Release everything the engine holds. Safe before a processing node
    /// exists and safe to call more than once.
    async fn dispose(&self) -> Result<(), EngineError>;
}

/// Constructs engine instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn construct(
        &self,
        sample_rate: u32,
        tuning: &TuningParams,
        assets: &EngineAssets,
    ) -> Result<Arc<dyn DetectionEngine>, EngineError>;
}
