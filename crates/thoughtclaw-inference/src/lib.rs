//! Thoughtclaw Inference - surprise scoring and attractor tracking

pub mod basin;
pub mod engine;

pub use basin::BasinTracker;
pub use engine::{InferenceEngine, InferenceStats, ObservationResult, Outcome};
pub use thoughtclaw_core::similarity::{
    ExactKey, FnSimilarity, SharedSimilarity, Similarity, TokenJaccard,
};
