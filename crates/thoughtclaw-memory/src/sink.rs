//! Durable storage for semantic particles
//!
//! The only work allowed off the heartbeat's cycle path. `spawn_persist`
//! hands a batch to a background task and returns immediately; failures are
//! logged, never propagated into the cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thoughtclaw_core::{Particle, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait SemanticSink: Send + Sync {
    async fn persist(&self, particles: &[Particle]) -> Result<()>;
}

/// Appends one JSON document per particle.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl SemanticSink for JsonlSink {
    async fn persist(&self, particles: &[Particle]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut buf = String::new();
        for particle in particles {
            buf.push_str(&serde_json::to_string(particle)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!("Persisted {} semantic particles to {}", particles.len(), self.path.display());
        Ok(())
    }
}

/// Fire-and-forget persistence. The handle is only for callers that want
/// to wait at shutdown; the heartbeat never awaits it mid-run.
pub fn spawn_persist(sink: Arc<dyn SemanticSink>, particles: Vec<Particle>) -> Option<JoinHandle<()>> {
    if particles.is_empty() {
        return None;
    }
    Some(tokio::spawn(async move {
        if let Err(e) = sink.persist(&particles).await {
            warn!("Failed to persist {} semantic particles: {}", particles.len(), e);
        }
    }))
}
