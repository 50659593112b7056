//! Thoughtclaw Core - particle types, configuration, and error handling

pub mod basin;
pub mod config;
pub mod error;
pub mod similarity;
pub mod types;

pub use basin::*;
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use similarity::{ExactKey, FnSimilarity, SharedSimilarity, Similarity, TokenJaccard};
pub use types::*;
