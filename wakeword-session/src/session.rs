/// Listening session controller
///
/// Drives one listen-until-stopped lifecycle: microphone, processing
/// context, detection engine, pattern registration and graph connection are
/// acquired strictly in that order, each handle recorded on the session's
/// resource stack as soon as it exists. Any failure rolls the stack back in
/// reverse; `stop` does the same for a running session.
///
/// Detections reach the controller over the engine's detection stream and
/// are republished to the [`DetectionLog`] and the [`WakeFlagStore`], but
/// only while the session is `Listening`.

use crate::audio::{AudioError, AudioGraphBuilder, AudioResourceAcquirer, CaptureConstraints};
use crate::detection_log::DetectionLog;
use crate::engine::{
    DetectionEvent, DetectionStream, EngineAssets, EngineError, EngineFactory, RegisteredPattern,
    TuningParams,
};
use crate::resources::{OwnedResource, ResourceKind, ResourceStack};
use crate::wake_flag::WakeFlagStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio context initialization failed: {0}")]
    ContextInit(String),

    #[error("Detection engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Failed to connect audio graph: {0}")]
    GraphConnect(String),

    #[error("Cannot start: session is {0}")]
    AlreadyActive(SessionStatus),

    #[error("Start cancelled by a stop request")]
    Cancelled,
}

impl SessionError {
    fn microphone(err: AudioError) -> Self {
        match err {
            AudioError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            AudioError::DeviceUnavailable(msg) => SessionError::DeviceUnavailable(msg),
            other => SessionError::DeviceUnavailable(other.to_string()),
        }
    }

    fn context(err: AudioError) -> Self {
        SessionError::ContextInit(err.to_string())
    }

    fn engine(err: EngineError) -> Self {
        SessionError::EngineInit(err.to_string())
    }

    fn graph(err: impl fmt::Display) -> Self {
        SessionError::GraphConnect(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Listening,
    Stopping,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Listening => "listening",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything `start` needs
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    pub tuning: TuningParams,
    pub patterns: Vec<RegisteredPattern>,
    pub assets: EngineAssets,
    pub capture: CaptureConstraints,
}

impl Default for StartOptions {
    fn default() -> Self {
        crate::config::SessionConfig::default().start_options()
    }
}

/// Platform collaborators the controller drives
#[derive(Clone)]
pub struct SessionBackends {
    pub microphone: Arc<dyn AudioResourceAcquirer>,
    pub graph: Arc<dyn AudioGraphBuilder>,
    pub engines: Arc<dyn EngineFactory>,
}

/// Point-in-time view for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub owned_resources: Vec<ResourceKind>,
    pub last_error: Option<String>,
    pub detections: usize,
}

struct SessionInner {
    status: SessionStatus,
    resources: ResourceStack,
    last_error: Option<SessionError>,
    stop_requested: bool,
    forwarder: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<SessionInner>,
    status_tx: watch::Sender<SessionStatus>,
    backends: SessionBackends,
    log: Arc<DetectionLog>,
    wake_flag: Arc<WakeFlagStore>,
}

impl Shared {
    fn set_status(&self, inner: &mut SessionInner, status: SessionStatus) {
        if inner.status != status {
            info!("Session status: {} -> {}", inner.status, status);
        }
        inner.status = status;
        self.status_tx.send_replace(status);
    }

    /// Handle one detection from the engine
    fn deliver(&self, event: DetectionEvent) {
        let inner = self.inner.lock();
        if inner.status != SessionStatus::Listening {
            trace!(
                "Discarding detection of '{}' while {}",
                event.pattern_name(),
                inner.status
            );
            return;
        }

        let text = event.display_text();
        info!("Wake word detected: {}", text);
        self.log.append(event);
        self.wake_flag.pulse(text);
    }
}

/// Start/stop control for one listening session at a time
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        backends: SessionBackends,
        log: Arc<DetectionLog>,
        wake_flag: Arc<WakeFlagStore>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner {
                    status: SessionStatus::Idle,
                    resources: ResourceStack::new(),
                    last_error: None,
                    stop_requested: false,
                    forwarder: None,
                }),
                status_tx,
                backends,
                log,
                wake_flag,
            }),
        }
    }

    /// Acquire everything and begin listening
    ///
    /// Rejected with `AlreadyActive` unless the session is `Idle` or
    /// `Failed`. On failure every acquired resource has been released by
    /// the time this returns, the session is `Failed`, and the error is
    /// returned. If `stop` is called while this is in flight, the current
    /// step is allowed to finish, everything is released, the session ends
    /// `Idle`, and `Cancelled` is returned. A step that fails on its own
    /// still ends `Failed` with its error, stop request or not.
    pub async fn start(&self, options: StartOptions) -> Result<(), SessionError> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.status {
                SessionStatus::Idle | SessionStatus::Failed => {}
                status => {
                    warn!("Start requested while {}; ignoring", status);
                    return Err(SessionError::AlreadyActive(status));
                }
            }

            inner.last_error = None;
            inner.stop_requested = false;
            self.shared.set_status(&mut inner, SessionStatus::Starting);
        }

        match self.acquire(&options).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.roll_back(err).await),
        }
    }

    /// Release everything and return to `Idle`
    ///
    /// No-op when `Idle`, `Failed` or already stopping. Release errors are
    /// logged, never returned. While `Starting`, records the request and
    /// waits for the in-flight `start` to tear down; the session is then
    /// `Idle`, or `Failed` if the step in flight failed on its own. A step
    /// that never resolves keeps this waiting too.
    pub async fn stop(&self) {
        let in_flight = {
            let mut inner = self.shared.inner.lock();
            match inner.status {
                SessionStatus::Idle | SessionStatus::Failed | SessionStatus::Stopping => {
                    debug!("Stop requested while {}; nothing to do", inner.status);
                    return;
                }
                SessionStatus::Starting => {
                    info!("Stop requested during start; cancelling after current step");
                    inner.stop_requested = true;
                    self.shared.set_status(&mut inner, SessionStatus::Stopping);
                    Some(self.shared.status_tx.subscribe())
                }
                SessionStatus::Listening => {
                    self.shared.set_status(&mut inner, SessionStatus::Stopping);
                    None
                }
            }
        };

        if let Some(mut status) = in_flight {
            // The sender lives in `shared`, so the channel cannot close here.
            let _ = status
                .wait_for(|s| matches!(s, SessionStatus::Idle | SessionStatus::Failed))
                .await;
            return;
        }

        self.teardown().await;

        let mut inner = self.shared.inner.lock();
        self.shared.set_status(&mut inner, SessionStatus::Idle);
        info!("Session stopped");
    }

    /// Empty the detection log; the session is unaffected
    pub fn clear_log(&self) {
        self.shared.log.clear();
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.inner.lock().status
    }

    /// Receive every status change
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Error from the last failed `start`; cleared by the next `start`
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Kinds of the currently owned resources, in acquisition order
    pub fn owned_resources(&self) -> Vec<ResourceKind> {
        self.shared.inner.lock().resources.kinds()
    }

    pub fn log(&self) -> &Arc<DetectionLog> {
        &self.shared.log
    }

    pub fn wake_flag(&self) -> &Arc<WakeFlagStore> {
        &self.shared.wake_flag
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock();
        SessionSnapshot {
            status: inner.status,
            owned_resources: inner.resources.kinds(),
            last_error: inner.last_error.as_ref().map(ToString::to_string),
            detections: self.shared.log.len(),
        }
    }

    async fn acquire(&self, options: &StartOptions) -> Result<(), SessionError> {
        let backends = &self.shared.backends;

        debug!("Requesting microphone: {:?}", options.capture);
        let stream = backends
            .microphone
            .acquire_microphone(&options.capture)
            .await
            .map_err(SessionError::microphone)?;
        self.adopt(OwnedResource::Microphone(Arc::clone(&stream)))?;

        let context = backends
            .graph
            .create_context()
            .await
            .map_err(SessionError::context)?;
        self.adopt(OwnedResource::Context(Arc::clone(&context)))?;

        let engine = backends
            .engines
            .construct(context.sample_rate(), &options.tuning, &options.assets)
            .await
            .map_err(SessionError::engine)?;
        self.adopt(OwnedResource::Engine(Arc::clone(&engine)))?;

        let detections = engine.subscribe_detections().map_err(SessionError::engine)?;
        self.forward_detections(detections);

        if options.patterns.is_empty() {
            warn!("No patterns configured; the engine will never report a detection");
        }
        for pattern in &options.patterns {
            engine
                .register_pattern(pattern)
                .await
                .map_err(SessionError::engine)?;
            self.check_cancelled()?;
        }

        let node = engine
            .create_processing_node(context.as_ref())
            .await
            .map_err(SessionError::graph)?;
        self.check_cancelled()?;

        let connection = backends
            .graph
            .connect(Arc::clone(&context), Arc::clone(&stream), node)
            .await
            .map_err(SessionError::graph)?;
        self.adopt(OwnedResource::Connection(connection))?;

        let mut inner = self.shared.inner.lock();
        if inner.stop_requested {
            return Err(SessionError::Cancelled);
        }
        self.shared.set_status(&mut inner, SessionStatus::Listening);
        info!(
            "Listening for {} pattern(s) with {} resources held",
            options.patterns.len(),
            inner.resources.len()
        );

        Ok(())
    }

    /// Record a freshly acquired resource, then honour any pending stop
    fn adopt(&self, resource: OwnedResource) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        inner.resources.push(resource);
        if inner.stop_requested {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.shared.inner.lock().stop_requested {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    fn forward_detections(&self, mut detections: DetectionStream) {
        let shared = Arc::clone(&self.shared);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = detections.next().await {
                shared.deliver(event);
            }
            debug!("Detection stream ended");
        });

        let previous = self.shared.inner.lock().forwarder.replace(forwarder);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Undo a failed or cancelled start
    async fn roll_back(&self, err: SessionError) -> SessionError {
        {
            let mut inner = self.shared.inner.lock();
            if inner.status == SessionStatus::Starting {
                self.shared.set_status(&mut inner, SessionStatus::Stopping);
            }
        }

        self.teardown().await;

        let mut inner = self.shared.inner.lock();
        inner.stop_requested = false;
        if err == SessionError::Cancelled {
            info!("Start abandoned after stop request");
            self.shared.set_status(&mut inner, SessionStatus::Idle);
        } else {
            error!("Start failed: {}", err);
            inner.last_error = Some(err.clone());
            self.shared.set_status(&mut inner, SessionStatus::Failed);
        }

        err
    }

    /// Stop detection delivery and release every owned resource
    async fn teardown(&self) {
        let (resources, forwarder) = {
            let mut inner = self.shared.inner.lock();
            (inner.resources.take(), inner.forwarder.take())
        };

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        let held = resources.len();
        let failures = resources.release_all().await;
        if failures.is_empty() {
            debug!("Released {} resources", held);
        } else {
            warn!(
                "Released {} resources, {} release step(s) failed",
                held,
                failures.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::microphone::MockAudioResourceAcquirer;
    use crate::audio::{AudioContext, MicrophoneStream};
    use crate::engine::{MockEngineFactory, ProcessingNode};
    use async_trait::async_trait;

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct Stream(Journal);

    impl MicrophoneStream for Stream {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn attach(&self, _node: Arc<dyn ProcessingNode>) -> Result<(), AudioError> {
            Ok(())
        }

        fn detach(&self) {}

        fn release(&self) -> Result<(), AudioError> {
            self.0.lock().push("release microphone");
            Ok(())
        }
    }

    struct Context(Journal);

    #[async_trait]
    impl AudioContext for Context {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn is_running(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<(), AudioError> {
            self.0.lock().push("close context");
            Ok(())
        }
    }

    struct Graph(Journal);

    #[async_trait]
    impl AudioGraphBuilder for Graph {
        async fn create_context(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
            self.0.lock().push("create context");
            Ok(Arc::new(Context(self.0.clone())))
        }
    }

    fn microphone(journal: &Journal) -> MockAudioResourceAcquirer {
        let journal = journal.clone();
        let mut microphone = MockAudioResourceAcquirer::new();
        microphone
            .expect_acquire_microphone()
            .times(1)
            .returning(move |_| {
                journal.lock().push("acquire microphone");
                Ok(Arc::new(Stream(journal.clone())) as Arc<dyn MicrophoneStream>)
            });
        microphone
    }

    fn controller(
        microphone: MockAudioResourceAcquirer,
        journal: &Journal,
        engines: MockEngineFactory,
    ) -> SessionController {
        SessionController::new(
            SessionBackends {
                microphone: Arc::new(microphone),
                graph: Arc::new(Graph(journal.clone())),
                engines: Arc::new(engines),
            },
            Arc::new(DetectionLog::new()),
            Arc::new(WakeFlagStore::new()),
        )
    }

    #[tokio::test]
    async fn test_engine_failure_releases_context_then_stream() {
        let journal = Journal::default();
        let mut engines = MockEngineFactory::new();
        engines
            .expect_construct()
            .times(1)
            .returning(|rate, _, _| {
                assert_eq!(rate, 16_000);
                Err(EngineError::Init("wasm module rejected".to_string()))
            });

        let controller = controller(microphone(&journal), &journal, engines);
        let result = controller.start(StartOptions::default()).await;

        assert!(matches!(result, Err(SessionError::EngineInit(ref msg)) if msg.contains("wasm")));
        assert_eq!(controller.status(), SessionStatus::Failed);
        assert!(controller.owned_resources().is_empty());
        assert_eq!(
            *journal.lock(),
            vec![
                "acquire microphone",
                "create context",
                "close context",
                "release microphone"
            ]
        );
        assert_eq!(
            controller.last_error(),
            Some(SessionError::EngineInit(
                "Engine initialization failed: wasm module rejected".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_denied_microphone_acquires_nothing_else() {
        let journal = Journal::default();
        let mut microphone = MockAudioResourceAcquirer::new();
        microphone
            .expect_acquire_microphone()
            .times(1)
            .returning(|_| Err(AudioError::PermissionDenied("user dismissed prompt".to_string())));
        let mut engines = MockEngineFactory::new();
        engines.expect_construct().never();

        let controller = controller(microphone, &journal, engines);
        let result = controller.start(StartOptions::default()).await;

        assert_eq!(
            result,
            Err(SessionError::PermissionDenied("user dismissed prompt".to_string()))
        );
        assert_eq!(controller.status(), SessionStatus::Failed);
        assert!(journal.lock().is_empty());

        let snapshot = controller.snapshot();
        assert!(snapshot.owned_resources.is_empty());
        assert!(snapshot.last_error.unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_unexpected_microphone_error_maps_to_unavailable() {
        let journal = Journal::default();
        let mut microphone = MockAudioResourceAcquirer::new();
        microphone
            .expect_acquire_microphone()
            .returning(|_| Err(AudioError::Context("host API missing".to_string())));

        let controller = controller(microphone, &journal, MockEngineFactory::new());
        let result = controller.start(StartOptions::default()).await;

        assert!(matches!(result, Err(SessionError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let journal = Journal::default();
        let controller = controller(
            MockAudioResourceAcquirer::new(),
            &journal,
            MockEngineFactory::new(),
        );
        let status = controller.subscribe_status();

        controller.stop().await;
        controller.stop().await;

        assert_eq!(controller.status(), SessionStatus::Idle);
        assert!(!status.has_changed().unwrap());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SessionError::AlreadyActive(SessionStatus::Listening).to_string(),
            "Cannot start: session is listening"
        );
        assert_eq!(
            SessionError::microphone(AudioError::DeviceUnavailable("no input".into())),
            SessionError::DeviceUnavailable("no input".into())
        );
    }
}
