//! Error types for Thoughtclaw

use crate::types::{Capability, ParticleId, Stage, Tier};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("stage failed: {stage} - {reason}")]
    StageFailed { stage: Stage, reason: String },

    #[error("stage timed out: {stage} after {timeout_ms}ms")]
    StageTimeout { stage: Stage, timeout_ms: u64 },

    #[error("capability denied: {stage} may not {capability}")]
    CapabilityDenied { stage: Stage, capability: Capability },

    #[error("runtime degraded: {consecutive} consecutive cycles abandoned")]
    RuntimeDegraded { consecutive: u32 },

    #[error("particle not found: {0}")]
    ParticleNotFound(ParticleId),

    #[error("invalid promotion: {from} -> {to}")]
    InvalidPromotion { from: Tier, to: Tier },

    #[error("invalid query pattern: {0}")]
    InvalidPattern(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn stage_failed(stage: Stage, reason: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            reason: reason.into(),
        }
    }

    /// Errors that abandon a single cycle rather than the whole run.
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            Self::StageFailed { .. } | Self::StageTimeout { .. } | Self::CapabilityDenied { .. }
        )
    }
}
