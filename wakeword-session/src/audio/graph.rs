/// Audio graph construction
///
/// A processing context owns the clock audio runs on. Connecting a live
/// microphone stream to an engine's processing node makes the stream the
/// node's upstream source; closing the context silences everything wired
/// through it.

use super::{AudioError, AudioSample, MicrophoneStream};
use crate::engine::ProcessingNode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// A running audio-processing context
#[async_trait]
pub trait AudioContext: Send + Sync {
    /// Rate every node in this context runs at
    fn sample_rate(&self) -> u32;

    /// True between a successful resume and `close`
    fn is_running(&self) -> bool;

    /// Release the context. Nodes attached through it stop receiving
    /// audio. Idempotent.
    async fn close(&self) -> Result<(), AudioError>;
}

/// Marker for a live stream → node wiring
pub trait GraphConnection: Send + Sync {
    /// Detach the stream from the node. Idempotent.
    fn disconnect(&self) -> Result<(), AudioError>;
}

/// Creates contexts and wires streams into processing nodes
#[async_trait]
pub trait AudioGraphBuilder: Send + Sync {
    /// Create a processing context and resume it. May suspend until the
    /// platform allows audio to run.
    async fn create_context(&self) -> Result<Arc<dyn AudioContext>, AudioError>;

    /// Wire `stream` as the upstream source of `node`
    async fn connect(
        &self,
        context: Arc<dyn AudioContext>,
        stream: Arc<dyn MicrophoneStream>,
        node: Arc<dyn ProcessingNode>,
    ) -> Result<Box<dyn GraphConnection>, AudioError> {
        connect_stream(context, stream, node)
    }
}

/// Platform-independent wiring used by the default `connect`
///
/// Frames only reach `node` while `context` is running, so closing the
/// context disconnects the node even if the connection marker is never
/// released.
pub fn connect_stream(
    context: Arc<dyn AudioContext>,
    stream: Arc<dyn MicrophoneStream>,
    node: Arc<dyn ProcessingNode>,
) -> Result<Box<dyn GraphConnection>, AudioError> {
    if !context.is_running() {
        return Err(AudioError::Graph("audio context is not running".to_string()));
    }

    if stream.sample_rate() != context.sample_rate() {
        return Err(AudioError::Graph(format!(
            "stream runs at {} Hz but context runs at {} Hz",
            stream.sample_rate(),
            context.sample_rate()
        )));
    }

    stream.attach(Arc::new(ContextGate { context, node }))?;
    info!("Microphone stream connected to processing node");

    Ok(Box::new(StreamConnection { stream }))
}

struct ContextGate {
    context: Arc<dyn AudioContext>,
    node: Arc<dyn ProcessingNode>,
}

impl ProcessingNode for ContextGate {
    fn process(&self, samples: &[AudioSample]) {
        if self.context.is_running() {
            self.node.process(samples);
        }
    }
}

struct StreamConnection {
    stream: Arc<dyn MicrophoneStream>,
}

impl GraphConnection for StreamConnection {
    fn disconnect(&self) -> Result<(), AudioError> {
        self.stream.detach();
        debug!("Microphone stream disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestContext {
        rate: u32,
        running: AtomicBool,
    }

    #[async_trait]
    impl AudioContext for TestContext {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), AudioError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestStream {
        sink: Mutex<Option<Arc<dyn ProcessingNode>>>,
    }

    impl TestStream {
        fn push(&self, samples: &[f32]) {
            if let Some(node) = self.sink.lock().as_ref() {
                node.process(samples);
            }
        }
    }

    impl MicrophoneStream for TestStream {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn attach(&self, node: Arc<dyn ProcessingNode>) -> Result<(), AudioError> {
            *self.sink.lock() = Some(node);
            Ok(())
        }

        fn detach(&self) {
            self.sink.lock().take();
        }

        fn release(&self) -> Result<(), AudioError> {
            self.detach();
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingNode {
        samples: Mutex<usize>,
    }

    impl ProcessingNode for CountingNode {
        fn process(&self, samples: &[f32]) {
            *self.samples.lock() += samples.len();
        }
    }

    fn running_context(rate: u32) -> Arc<TestContext> {
        Arc::new(TestContext {
            rate,
            running: AtomicBool::new(true),
        })
    }

    #[tokio::test]
    async fn test_frames_flow_until_disconnect() {
        let context = running_context(16_000);
        let stream = Arc::new(TestStream::default());
        let node = Arc::new(CountingNode::default());

        let connection = connect_stream(context, stream.clone(), node.clone()).unwrap();
        stream.push(&[0.0; 160]);
        assert_eq!(*node.samples.lock(), 160);

        connection.disconnect().unwrap();
        connection.disconnect().unwrap();
        stream.push(&[0.0; 160]);
        assert_eq!(*node.samples.lock(), 160);
    }

    #[tokio::test]
    async fn test_closing_context_silences_node() {
        let context = running_context(16_000);
        let stream = Arc::new(TestStream::default());
        let node = Arc::new(CountingNode::default());

        let _connection = connect_stream(context.clone(), stream.clone(), node.clone()).unwrap();
        context.close().await.unwrap();
        stream.push(&[0.0; 160]);

        assert_eq!(*node.samples.lock(), 0);
    }

    #[test]
    fn test_rejects_stopped_context() {
        let context = Arc::new(TestContext {
            rate: 16_000,
            running: AtomicBool::new(false),
        });
        let result = connect_stream(
            context,
            Arc::new(TestStream::default()),
            Arc::new(CountingNode::default()),
        );
        assert!(matches!(result, Err(AudioError::Graph(_))));
    }

    #[test]
    fn test_rejects_sample_rate_mismatch() {
        let result = connect_stream(
            running_context(48_000),
            Arc::new(TestStream::default()),
            Arc::new(CountingNode::default()),
        );
        assert!(matches!(result, Err(AudioError::Graph(msg)) if msg.contains("48000")));
    }
}
