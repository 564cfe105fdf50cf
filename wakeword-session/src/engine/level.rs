/// Level-triggered reference engine
///
/// A minimal in-process engine used by the service binary and tests in
/// place of a trained recogniser. Frames are scored by RMS level after
/// gain; a detection fires when a frame reaches `threshold` and the
/// exponentially smoothed score reaches `averaged_threshold`. Pattern models
/// are loaded as opaque bytes and every registered pattern is reported on
/// each trigger.

use super::{
    DetectionEngine, DetectionEvent, DetectionSender, DetectionStream, EngineAssets, EngineError,
    EngineFactory, ProcessingNode, RegisteredPattern, TuningParams,
};
use crate::audio::{AudioBuffer, AudioContext, AudioSample};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Analysis frame length (30ms)
pub const FRAME_DURATION_MS: u32 = 30;

/// Weight of the newest frame in the averaged score
const SMOOTHING: f32 = 0.2;

/// Quiet period after a detection
const REFRACTORY_MS: u32 = 1000;

/// Builds [`LevelEngine`] instances
#[derive(Debug, Default, Clone, Copy)]
pub struct LevelEngineFactory;

#[async_trait]
impl EngineFactory for LevelEngineFactory {
    async fn construct(
        &self,
        sample_rate: u32,
        tuning: &TuningParams,
        assets: &EngineAssets,
    ) -> Result<Arc<dyn DetectionEngine>, EngineError> {
        // Runs in-process, so the worklet/worker/wasm assets are never fetched.
        debug!("Level engine ignores runtime assets: {:?}", assets);
        Ok(Arc::new(LevelEngine::new(sample_rate, *tuning)?))
    }
}

type SharedSender = Arc<Mutex<Option<DetectionSender>>>;

pub struct LevelEngine {
    sample_rate: u32,
    tuning: TuningParams,
    patterns: Mutex<Vec<String>>,
    sender: SharedSender,
    stream: Mutex<Option<DetectionStream>>,
    disposed: AtomicBool,
}

impl LevelEngine {
    pub fn new(sample_rate: u32, tuning: TuningParams) -> Result<Self, EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::Init("sample rate must be non-zero".to_string()));
        }

        if !(tuning.gain.is_finite() && tuning.gain > 0.0) {
            return Err(EngineError::Init(format!(
                "gain must be a positive finite number, got {}",
                tuning.gain
            )));
        }

        info!(
            "Level engine initialised: {} Hz, threshold={}, averaged_threshold={}, gain={}",
            sample_rate, tuning.threshold, tuning.averaged_threshold, tuning.gain
        );

        let (tx, stream) = DetectionStream::channel();

        Ok(Self {
            sample_rate,
            tuning,
            patterns: Mutex::new(Vec::new()),
            sender: Arc::new(Mutex::new(Some(tx))),
            stream: Mutex::new(Some(stream)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Names of the patterns loaded so far
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.lock().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl DetectionEngine for LevelEngine {
    async fn register_pattern(&self, pattern: &RegisteredPattern) -> Result<(), EngineError> {
        self.ensure_live()?;

        let load_error = |reason: String| EngineError::PatternLoad {
            name: pattern.name.clone(),
            location: pattern.model_location.clone(),
            reason,
        };

        let model = tokio::fs::read(&pattern.model_location)
            .await
            .map_err(|e| load_error(e.to_string()))?;

        if model.is_empty() {
            return Err(load_error("model resource is empty".to_string()));
        }

        info!(
            "Registered pattern '{}' ({} bytes from {})",
            pattern.name,
            model.len(),
            pattern.model_location
        );
        self.patterns.lock().push(pattern.name.clone());

        Ok(())
    }

    async fn create_processing_node(
        &self,
        context: &dyn AudioContext,
    ) -> Result<Arc<dyn ProcessingNode>, EngineError> {
        self.ensure_live()?;

        if context.sample_rate() != self.sample_rate {
            return Err(EngineError::ProcessingNode(format!(
                "engine built for {} Hz, context runs at {} Hz",
                self.sample_rate,
                context.sample_rate()
            )));
        }

        let patterns = self.patterns();
        if patterns.is_empty() {
            warn!("Processing node created with no registered patterns; nothing will be detected");
        }

        let frame_size = (self.sample_rate * FRAME_DURATION_MS / 1000).max(1) as usize;
        let frames = AudioBuffer::with_capacity(frame_size * 8)
            .map_err(|e| EngineError::ProcessingNode(e.to_string()))?;

        debug!("Level node: frame_size={} samples", frame_size);

        Ok(Arc::new(LevelNode {
            frames,
            frame_size,
            tuning: self.tuning,
            patterns,
            refractory_frames: REFRACTORY_MS / FRAME_DURATION_MS,
            score: Mutex::new(ScoreState::default()),
            sender: Arc::clone(&self.sender),
        }))
    }

    fn subscribe_detections(&self) -> Result<DetectionStream, EngineError> {
        self.ensure_live()?;
        self.stream.lock().take().ok_or(EngineError::AlreadySubscribed)
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the sender ends the detection stream, including for any
        // node still alive in the audio thread.
        self.sender.lock().take();
        info!("Level engine disposed");

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScoreState {
    averaged: f32,
    cooldown: u32,
}

struct LevelNode {
    frames: AudioBuffer,
    frame_size: usize,
    tuning: TuningParams,
    patterns: Vec<String>,
    refractory_frames: u32,
    score: Mutex<ScoreState>,
    sender: SharedSender,
}

impl LevelNode {
    /// Returns the averaged score when this frame triggers
    fn score_frame(&self, level: f32) -> Option<f32> {
        let mut state = self.score.lock();
        state.averaged += SMOOTHING * (level - state.averaged);

        if state.cooldown > 0 {
            state.cooldown -= 1;
            return None;
        }

        if level >= self.tuning.threshold && state.averaged >= self.tuning.averaged_threshold {
            state.cooldown = self.refractory_frames;
            return Some(state.averaged);
        }

        None
    }

    fn emit(&self, level: f32, averaged: f32) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return;
        };

        for name in &self.patterns {
            let payload = json!({
                "name": name,
                "score": level,
                "avg_score": averaged,
            });
            // Receiver gone means the session is tearing down.
            let _ = tx.send(DetectionEvent::new(name.as_str(), payload));
        }
    }
}

impl ProcessingNode for LevelNode {
    fn process(&self, samples: &[AudioSample]) {
        self.frames.write_scaled(samples, self.tuning.gain);

        while self.frames.len() >= self.frame_size {
            let Ok(frame) = self.frames.read(self.frame_size) else {
                break;
            };

            let level = frame_rms(&frame).min(1.0);
            if let Some(averaged) = self.score_frame(level) {
                self.emit(level, averaged);
            }
        }
    }
}

fn frame_rms(frame: &[AudioSample]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let energy: f32 = frame.iter().map(|s| s * s).sum();
    (energy / frame.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioError;
    use std::io::Write;

    struct FixedContext(u32);

    #[async_trait]
    impl AudioContext for FixedContext {
        fn sample_rate(&self) -> u32 {
            self.0
        }

        fn is_running(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"rpw-model").unwrap();
        file
    }

    async fn engine_with_pattern(name: &str) -> (LevelEngine, tempfile::NamedTempFile) {
        let model = model_file();
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        let pattern = RegisteredPattern::new(name, model.path().to_string_lossy());
        engine.register_pattern(&pattern).await.unwrap();
        (engine, model)
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(LevelEngine::new(0, TuningParams::default()).is_err());

        let tuning = TuningParams {
            gain: 0.0,
            ..Default::default()
        };
        assert!(matches!(LevelEngine::new(16_000, tuning), Err(EngineError::Init(_))));

        for gain in [f32::NAN, f32::INFINITY, -1.0] {
            let tuning = TuningParams {
                gain,
                ..Default::default()
            };
            assert!(LevelEngine::new(16_000, tuning).is_err(), "gain {}", gain);
        }
    }

    #[tokio::test]
    async fn test_missing_model_fails_registration() {
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        let pattern = RegisteredPattern::new("memory", "/nonexistent/memory.rpw");

        let result = engine.register_pattern(&pattern).await;
        assert!(matches!(result, Err(EngineError::PatternLoad { ref name, .. }) if name == "memory"));
        assert!(engine.patterns().is_empty());
    }

    #[tokio::test]
    async fn test_empty_model_fails_registration() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        let pattern = RegisteredPattern::new("memory", file.path().to_string_lossy());

        assert!(engine.register_pattern(&pattern).await.is_err());
    }

    #[tokio::test]
    async fn test_loud_audio_triggers_once_per_refractory_period() {
        let (engine, _model) = engine_with_pattern("memory").await;
        let mut detections = engine.subscribe_detections().unwrap();
        let node = engine
            .create_processing_node(&FixedContext(16_000))
            .await
            .unwrap();

        // 300ms of loud audio, well inside the refractory period
        for _ in 0..10 {
            node.process(&[0.9; 480]);
        }
        engine.dispose().await.unwrap();

        let first = detections.next().await.expect("expected a detection");
        assert_eq!(first.pattern_name(), "memory");
        assert_eq!(first.raw_payload()["name"], "memory");
        assert!(first.raw_payload()["score"].as_f64().unwrap() >= 0.5);
        assert!(detections.next().await.is_none());
    }

    #[tokio::test]
    async fn test_silence_never_triggers() {
        let (engine, _model) = engine_with_pattern("memory").await;
        let mut detections = engine.subscribe_detections().unwrap();
        let node = engine
            .create_processing_node(&FixedContext(16_000))
            .await
            .unwrap();

        for _ in 0..100 {
            node.process(&[0.0; 480]);
        }
        engine.dispose().await.unwrap();

        assert!(detections.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_only_once() {
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        assert!(engine.subscribe_detections().is_ok());
        assert_eq!(
            engine.subscribe_detections().err(),
            Some(EngineError::AlreadySubscribed)
        );
    }

    #[tokio::test]
    async fn test_dispose_without_node_is_safe_and_idempotent() {
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        engine.dispose().await.unwrap();
        engine.dispose().await.unwrap();

        assert!(engine.is_disposed());
        assert!(matches!(
            engine.create_processing_node(&FixedContext(16_000)).await,
            Err(EngineError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_context_rate_must_match() {
        let engine = LevelEngine::new(16_000, TuningParams::default()).unwrap();
        let result = engine.create_processing_node(&FixedContext(48_000)).await;
        assert!(matches!(result, Err(EngineError::ProcessingNode(_))));
    }
}
