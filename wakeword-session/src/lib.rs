/// Wake-word session library
///
/// Lifecycle control for a wake-word listening session: acquires the
/// microphone, audio context and detection engine in order, wires the live
/// stream into the engine, republishes detections to a log and a
/// process-wide wake flag, and releases everything in reverse on stop or on
/// any failure.

pub mod audio;
pub mod config;
pub mod detection_log;
pub mod engine;
pub mod resources;
pub mod session;
pub mod wake_flag;

// Re-export main types
pub use audio::{
    AudioContext, AudioError, AudioGraphBuilder, AudioResourceAcquirer, CaptureConstraints,
    GraphConnection, MicrophoneStream,
};
pub use config::{ConfigError, SessionConfig};
pub use detection_log::DetectionLog;
pub use engine::{
    DetectionEngine, DetectionEvent, DetectionStream, EngineAssets, EngineError, EngineFactory,
    LevelEngineFactory, ProcessingNode, RegisteredPattern, TuningParams,
};
pub use resources::{ReleaseError, ResourceKind};
pub use session::{
    SessionBackends, SessionController, SessionError, SessionSnapshot, SessionStatus,
    StartOptions,
};
pub use wake_flag::{WakeFlagState, WakeFlagStore, WAKE_FLAG_RESET};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
