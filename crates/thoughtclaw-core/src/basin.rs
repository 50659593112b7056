//! Basin types: stable clusters of mutually resonant particles

use crate::types::{ContentKey, ParticleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasinId(pub u64);

impl std::fmt::Display for BasinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Basin {
    pub id: BasinId,
    /// Most active member when the basin last transitioned.
    pub centroid: ParticleId,
    pub centroid_key: ContentKey,
    pub members: BTreeSet<ParticleId>,
    /// Sum of member activations, recomputed every cycle.
    pub cumulative_activation: f64,
    pub formed_cycle: u64,
    pub last_transition_cycle: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// A new cluster crossed the formation threshold.
    Formed,
    /// Two or more basins became one connected cluster.
    Merged,
    /// A basin's membership changed by more than half in one cycle.
    Shifted,
    /// Cumulative activation fell below the floor or the cluster fell apart.
    Dissolved,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Formed => write!(f, "formed"),
            TransitionKind::Merged => write!(f, "merged"),
            TransitionKind::Shifted => write!(f, "shifted"),
            TransitionKind::Dissolved => write!(f, "dissolved"),
        }
    }
}

/// A discrete attractor shift, reported once per cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasinTransition {
    pub kind: TransitionKind,
    pub before: Vec<BasinId>,
    pub after: Option<BasinId>,
    pub cycle: u64,
    pub members: Vec<ParticleId>,
    pub cumulative_activation: f64,
}
