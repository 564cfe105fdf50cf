/// Session resource ownership
///
/// Everything a session acquires is pushed onto a [`ResourceStack`] in
/// acquisition order. Teardown pops it in reverse: a failed release is
/// logged and the remaining resources are still released.

use crate::audio::{AudioContext, GraphConnection, MicrophoneStream};
use crate::engine::DetectionEngine;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// What an owned resource is, without the handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Microphone,
    Context,
    Engine,
    Connection,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Microphone => "microphone stream",
            ResourceKind::Context => "audio context",
            ResourceKind::Engine => "detection engine",
            ResourceKind::Connection => "graph connection",
        };
        f.write_str(name)
    }
}

/// A cleanup step failed; never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to release {kind}: {reason}")]
pub struct ReleaseError {
    pub kind: ResourceKind,
    pub reason: String,
}

/// A handle owned by the session
pub enum OwnedResource {
    Microphone(Arc<dyn MicrophoneStream>),
    Context(Arc<dyn AudioContext>),
    Engine(Arc<dyn DetectionEngine>),
    Connection(Box<dyn GraphConnection>),
}

impl OwnedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            OwnedResource::Microphone(_) => ResourceKind::Microphone,
            OwnedResource::Context(_) => ResourceKind::Context,
            OwnedResource::Engine(_) => ResourceKind::Engine,
            OwnedResource::Connection(_) => ResourceKind::Connection,
        }
    }

    /// Release the handle
    pub async fn release(self) -> Result<(), ReleaseError> {
        let kind = self.kind();
        let result = match self {
            OwnedResource::Microphone(stream) => stream.release().map_err(|e| e.to_string()),
            OwnedResource::Context(context) => context.close().await.map_err(|e| e.to_string()),
            OwnedResource::Engine(engine) => engine.dispose().await.map_err(|e| e.to_string()),
            OwnedResource::Connection(connection) => {
                connection.disconnect().map_err(|e| e.to_string())
            }
        };

        result.map_err(|reason| ReleaseError { kind, reason })
    }
}

impl fmt::Debug for OwnedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedResource({:?})", self.kind())
    }
}

/// Resources in acquisition order
#[derive(Debug, Default)]
pub struct ResourceStack {
    entries: Vec<OwnedResource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: OwnedResource) {
        debug!("Acquired {}", resource.kind());
        self.entries.push(resource);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kinds in acquisition order
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.entries.iter().map(OwnedResource::kind).collect()
    }

    /// Move every entry out, leaving this stack empty
    pub fn take(&mut self) -> ResourceStack {
        std::mem::take(self)
    }

    /// Release everything, newest first
    ///
    /// Individual failures are logged and collected; they never stop the
    /// remaining releases.
    pub async fn release_all(mut self) -> Vec<ReleaseError> {
        let mut failures = Vec::new();

        while let Some(resource) = self.entries.pop() {
            let kind = resource.kind();
            match resource.release().await {
                Ok(()) => debug!("Released {}", kind),
                Err(e) => {
                    warn!("{}", e);
                    failures.push(e);
                }
            }
        }

        failures
    }
}
