//! Cycle state, committed snapshots and runtime events

use crate::stages::{Decision, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thoughtclaw_core::{Basin, Particle, ParticleId, ParticleSummary, SessionId, Stage, Tier};
use thoughtclaw_inference::{BasinTracker, InferenceEngine, Outcome};
use thoughtclaw_memory::{ParticleQuery, TierSet};

/// Everything one cycle may mutate. A cycle works on a clone and the
/// heartbeat swaps it in at commit.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub tiers: TierSet,
    pub engine: InferenceEngine,
    pub basins: BasinTracker,
}

impl CycleState {
    pub fn new(tiers: TierSet, engine: InferenceEngine, basins: BasinTracker) -> Self {
        Self { tiers, engine, basins }
    }
}

/// Scheduler-side counters; the rest of `RuntimeStats` is read off the state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCounters {
    pub cycles: u64,
    pub stage_failures: u64,
    pub replans: u64,
    pub transitions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub cycles: u64,
    pub spawned: u64,
    pub reinforced: u64,
    pub recalled: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub promotion_conflicts: u64,
    pub beliefs_refreshed: u64,
    pub pruned: u64,
    pub expired: u64,
    pub stage_failures: u64,
    pub replans: u64,
    pub transitions: u64,
}

impl RuntimeStats {
    pub fn collect(state: &CycleState, counters: SchedulerCounters) -> Self {
        let memory = state.tiers.stats();
        let inference = state.engine.stats();
        Self {
            cycles: counters.cycles,
            spawned: inference.spawned,
            reinforced: inference.reinforced,
            recalled: inference.recalled,
            evictions: memory.evictions,
            promotions: memory.promotions,
            demotions: memory.demotions,
            promotion_conflicts: memory.promotion_conflicts,
            beliefs_refreshed: memory.beliefs_refreshed,
            pruned: memory.pruned,
            expired: memory.expired,
            stage_failures: counters.stage_failures,
            replans: counters.replans,
            transitions: counters.transitions,
        }
    }
}

/// Read-only view of committed state, published between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub session: SessionId,
    /// Last committed cycle. 0 before the first commit.
    pub cycle: u64,
    /// Logical time: the latest observation timestamp.
    pub now: DateTime<Utc>,
    pub replanned: bool,
    /// Observations consumed by the last committed cycle.
    pub observed: usize,
    /// Observations waiting for Perception, including any handed back by
    /// abandoned cycles.
    pub pending: usize,
    pub working: Vec<Particle>,
    pub episodic: Vec<Particle>,
    pub semantic: Vec<Particle>,
    pub basins: Vec<Basin>,
    pub plan: Option<Plan>,
    pub decision: Option<Decision>,
    pub stats: RuntimeStats,
}

impl RuntimeSnapshot {
    pub(crate) fn capture(
        state: &CycleState,
        counters: SchedulerCounters,
        cycle: u64,
        plan: Option<Plan>,
        decision: Option<Decision>,
    ) -> Self {
        let tiers = &state.tiers;
        Self {
            session: tiers.session(),
            cycle,
            now: tiers.now(),
            replanned: false,
            observed: 0,
            pending: 0,
            working: tiers.iter(Tier::Working).cloned().collect(),
            episodic: tiers.iter(Tier::Episodic).cloned().collect(),
            semantic: tiers.iter(Tier::Semantic).cloned().collect(),
            basins: state.basins.basins().cloned().collect(),
            plan,
            decision,
            stats: RuntimeStats::collect(state, counters),
        }
    }

    pub fn particles(&self, tier: Tier) -> &[Particle] {
        match tier {
            Tier::Working => &self.working,
            Tier::Episodic => &self.episodic,
            Tier::Semantic => &self.semantic,
        }
    }

    pub fn query(&self, tier: Tier, query: &ParticleQuery) -> Vec<ParticleSummary> {
        query
            .select(self.particles(tier))
            .into_iter()
            .map(Particle::summary)
            .collect()
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        Tier::ALL
            .iter()
            .flat_map(|t| self.particles(*t))
            .find(|p| p.id == id)
    }

    pub fn tier_of(&self, id: ParticleId) -> Option<Tier> {
        self.get(id).map(|p| p.tier)
    }

    /// Particles carrying `key`, across all tiers.
    pub fn by_key(&self, key: &str) -> Vec<&Particle> {
        Tier::ALL
            .iter()
            .flat_map(|t| self.particles(*t))
            .filter(|p| p.key.as_str() == key)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// How an ingested observation was resolved. `ticket` is the id handed
    /// out at ingest; `particle` differs when an existing one was reinforced.
    Observed {
        ticket: Option<ParticleId>,
        particle: ParticleId,
        outcome: Outcome,
        surprise: f64,
    },
    Committed {
        cycle: u64,
        replanned: bool,
        transitions: usize,
    },
    Abandoned {
        cycle: u64,
        stage: Stage,
        reason: String,
    },
    Degraded {
        consecutive: u32,
    },
    Cancelled {
        cycle: u64,
    },
    SessionClosed {
        session: SessionId,
        cycles: u64,
    },
}
