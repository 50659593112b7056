//! Resonance functions between content keys
//!
//! The runtime never hardcodes how two keys resonate. Callers pick one of
//! the built-ins or hand in a closure; every result is clamped to [0, 1].

use crate::types::ContentKey;
use std::collections::BTreeSet;
use std::sync::Arc;

pub trait Similarity: Send + Sync {
    /// Raw resonance weight between two keys.
    fn score(&self, a: &ContentKey, b: &ContentKey) -> f64;

    /// Bounded resonance weight in [0, 1].
    fn resonance(&self, a: &ContentKey, b: &ContentKey) -> f64 {
        let raw = self.score(a, b);
        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }
}

pub type SharedSimilarity = Arc<dyn Similarity>;

/// 1.0 for identical keys, 0.0 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactKey;

impl Similarity for ExactKey {
    fn score(&self, a: &ContentKey, b: &ContentKey) -> f64 {
        if a == b {
            1.0
        } else {
            0.0
        }
    }
}

/// Jaccard overlap of the alphanumeric tokens in each key.
/// Identical keys always score 1.0, even when they contain no tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenJaccard;

impl TokenJaccard {
    fn tokens(key: &ContentKey) -> BTreeSet<String> {
        key.as_str()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }
}

impl Similarity for TokenJaccard {
    fn score(&self, a: &ContentKey, b: &ContentKey) -> f64 {
        if a == b {
            return 1.0;
        }
        let words_a = Self::tokens(a);
        let words_b = Self::tokens(b);
        if words_a.is_empty() || words_b.is_empty() {
            return 0.0;
        }

        let intersection = words_a.intersection(&words_b).count();
        let union = words_a.union(&words_b).count();

        intersection as f64 / union as f64
    }
}

/// Adapter for caller-supplied closures.
pub struct FnSimilarity<F>(pub F);

impl<F> Similarity for FnSimilarity<F>
where
    F: Fn(&ContentKey, &ContentKey) -> f64 + Send + Sync,
{
    fn score(&self, a: &ContentKey, b: &ContentKey) -> f64 {
        (self.0)(a, b)
    }
}
