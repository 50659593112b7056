//! Core types for Thoughtclaw

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Particle identifier. Allocated monotonically so replays assign the same ids.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticleId(pub u64);

impl std::fmt::Display for ParticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Heartbeat session ordinal. Session 1 is the first run against a store.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Shared monotonic counter. Clones hand out from the same sequence.
#[derive(Clone, Debug, Default)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub fn starting_at(first: u64) -> Self {
        Self(Arc::new(AtomicU64::new(first)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to `next()` will return.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Never moves the counter backwards.
    pub fn advance_to(&self, value: u64) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }
}

/// Content reference carried by a particle - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ContentKey(Arc<str>);

impl ContentKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContentKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ContentKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.0.to_string()
    }
}

/// Memory tier, ordered by retention.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Working,
    Episodic,
    Semantic,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Working, Tier::Episodic, Tier::Semantic];

    /// The tier a promotion out of this one lands in.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Working => Some(Tier::Episodic),
            Tier::Episodic => Some(Tier::Semantic),
            Tier::Semantic => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Working => write!(f, "working"),
            Tier::Episodic => write!(f, "episodic"),
            Tier::Semantic => write!(f, "semantic"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "working" => Ok(Tier::Working),
            "episodic" => Ok(Tier::Episodic),
            "semantic" => Ok(Tier::Semantic),
            other => Err(crate::Error::config(format!("unknown tier '{}'", other))),
        }
    }
}

/// Processing stage within one heartbeat cycle.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Perception,
    Reasoning,
    Metacognition,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Perception => write!(f, "perception"),
            Stage::Reasoning => write!(f, "reasoning"),
            Stage::Metacognition => write!(f, "metacognition"),
        }
    }
}

/// A tool a stage may be granted.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Observe,
    QueryWorking,
    QueryEpisodic,
    QuerySemantic,
    QueryBasins,
    Activate,
    SelectAction,
}

impl Capability {
    /// Query capability that covers a tier.
    pub fn query(tier: Tier) -> Self {
        match tier {
            Tier::Working => Capability::QueryWorking,
            Tier::Episodic => Capability::QueryEpisodic,
            Tier::Semantic => Capability::QuerySemantic,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Observe => "observe",
            Capability::QueryWorking => "query working",
            Capability::QueryEpisodic => "query episodic",
            Capability::QuerySemantic => "query semantic",
            Capability::QueryBasins => "query basins",
            Capability::Activate => "activate",
            Capability::SelectAction => "select action",
        };
        f.write_str(name)
    }
}

/// External input waiting for Perception.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub key: ContentKey,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    /// Id reserved at ingest; a spawned particle takes it over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<ParticleId>,
}

impl Observation {
    pub fn new(key: impl Into<ContentKey>, payload: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            timestamp,
            ticket: None,
        }
    }

    pub fn with_ticket(mut self, ticket: ParticleId) -> Self {
        self.ticket = Some(ticket);
        self
    }
}

/// The atomic information unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Particle {
    pub id: ParticleId,
    pub key: ContentKey,
    pub payload: String,
    activation: f64,
    pub decay_rate: f64,
    /// Affect gain: scales both decay and reinforcement.
    pub gain: f64,
    pub resonance: BTreeMap<ParticleId, f64>,
    /// Particle this one was spawned in response to. Provenance only.
    pub parent: Option<ParticleId>,
    pub created_at: DateTime<Utc>,
    pub last_activated_at: DateTime<Utc>,
    pub created_cycle: u64,
    pub last_activated_cycle: u64,
    pub tier: Tier,
    /// Session the particle was created in.
    pub session: SessionId,
    /// Slow relevance scalar, only meaningful in the semantic tier.
    pub relevance: f64,
    pub low_relevance: bool,
    /// Consecutive cycles spent below the prune epsilon.
    #[serde(default)]
    pub dormant_cycles: u32,
    /// Recalled out of episodic and not observed since. Such a particle
    /// returning to episodic is not a new arrival.
    #[serde(default)]
    pub carried_over: bool,
}

impl Particle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ParticleId,
        key: ContentKey,
        payload: impl Into<String>,
        decay_rate: f64,
        gain: f64,
        at: DateTime<Utc>,
        cycle: u64,
        session: SessionId,
    ) -> Self {
        debug_assert!(decay_rate > 0.0, "decay rate must be positive");
        Self {
            id,
            key,
            payload: payload.into(),
            activation: 1.0,
            decay_rate,
            gain,
            resonance: BTreeMap::new(),
            parent: None,
            created_at: at,
            last_activated_at: at,
            created_cycle: cycle,
            last_activated_cycle: cycle,
            tier: Tier::Working,
            session,
            relevance: 1.0,
            low_relevance: false,
            dormant_cycles: 0,
            carried_over: false,
        }
    }

    pub fn activation(&self) -> f64 {
        self.activation
    }

    /// Clamped into [0, 1].
    pub fn set_activation(&mut self, value: f64) {
        self.activation = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    }

    pub fn effective_decay_rate(&self) -> f64 {
        (self.decay_rate * self.gain).clamp(f64::MIN_POSITIVE, 1.0)
    }

    /// One fast-schedule decay step. Returns the new activation.
    pub fn decay(&mut self) -> f64 {
        let next = self.activation * (1.0 - self.effective_decay_rate());
        self.set_activation(next);
        self.activation
    }

    /// One slow relevance step for semantic particles.
    pub fn decay_relevance(&mut self, rate: f64, floor: f64) {
        self.relevance = (self.relevance * (1.0 - rate)).max(0.0);
        self.low_relevance = self.relevance < floor;
    }

    pub fn refresh_relevance(&mut self) {
        self.relevance = 1.0;
        self.low_relevance = false;
    }

    /// Raise activation by `increment * gain`, capped at 1.0.
    pub fn reinforce(&mut self, increment: f64, at: DateTime<Utc>, cycle: u64) -> f64 {
        self.set_activation(self.activation + increment * self.gain);
        self.touch(at, cycle);
        self.activation
    }

    pub fn touch(&mut self, at: DateTime<Utc>, cycle: u64) {
        if at > self.last_activated_at {
            self.last_activated_at = at;
        }
        self.last_activated_cycle = cycle;
        self.dormant_cycles = 0;
    }

    /// Record a resonance edge, keeping the strongest weight seen.
    pub fn link(&mut self, target: ParticleId, weight: f64) {
        if target == self.id {
            return;
        }
        let weight = weight.clamp(0.0, 1.0);
        let entry = self.resonance.entry(target).or_insert(0.0);
        if weight > *entry {
            *entry = weight;
        }
    }

    pub fn summary(&self) -> ParticleSummary {
        ParticleSummary {
            id: self.id,
            key: self.key.clone(),
            payload: self.payload.clone(),
            activation: self.activation,
            tier: self.tier,
            relevance: self.relevance,
            low_relevance: self.low_relevance,
            parent: self.parent,
            resonance_degree: self.resonance.len(),
            last_activated_at: self.last_activated_at,
            session: self.session,
        }
    }
}

/// Read-only view of a particle handed to external readers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleSummary {
    pub id: ParticleId,
    pub key: ContentKey,
    pub payload: String,
    pub activation: f64,
    pub tier: Tier,
    pub relevance: f64,
    pub low_relevance: bool,
    pub parent: Option<ParticleId>,
    pub resonance_degree: usize,
    pub last_activated_at: DateTime<Utc>,
    pub session: SessionId,
}
