//! TierSet - the three tier stores plus the promotion rules between them.
//!
//! Every mutation that crosses tiers goes through here, so a particle is
//! removed from its source before it is inserted anywhere else. Events are
//! appended to a journal the heartbeat drains after each commit.

use crate::episodic::{Arrival, EpisodicMemory};
use crate::query::ParticleQuery;
use crate::semantic::SemanticMemory;
use crate::working::WorkingMemory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thoughtclaw_core::config::MemoryConfig;
use thoughtclaw_core::{
    ContentKey, Error, Particle, ParticleId, Result, SessionId, SharedSimilarity, Tier,
};
use tracing::{debug, info};

/// Counters for the internal, non-error conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub promotion_conflicts: u64,
    pub beliefs_refreshed: u64,
    pub pruned: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TierEvent {
    /// Working tier was full; the weakest particle moved to episodic.
    Evicted { id: ParticleId, activation: f64 },
    Promoted { id: ParticleId, from: Tier, to: Tier },
    /// Working particle not activated within the recency window.
    Demoted { id: ParticleId },
    Recalled { id: ParticleId },
    /// An equivalent belief already existed; it was refreshed instead.
    BeliefRefreshed { belief: ParticleId, source: ParticleId },
    PromotionConflict {
        id: ParticleId,
        key: ContentKey,
        sessions: usize,
        required: usize,
    },
    Pruned { id: ParticleId, tier: Tier },
    Expired { id: ParticleId },
}

#[derive(Clone)]
pub struct TierSet {
    config: MemoryConfig,
    similarity: SharedSimilarity,
    session: SessionId,
    now: DateTime<Utc>,
    working: WorkingMemory,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    stats: MemoryStats,
    journal: Vec<TierEvent>,
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSet")
            .field("session", &self.session)
            .field("working", &self.working.len())
            .field("episodic", &self.episodic.len())
            .field("semantic", &self.semantic.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl TierSet {
    pub fn new(config: MemoryConfig, similarity: SharedSimilarity, session: SessionId) -> Self {
        Self {
            working: WorkingMemory::new(config.working_capacity),
            episodic: EpisodicMemory::new(),
            semantic: SemanticMemory::new(),
            config,
            similarity,
            session,
            now: DateTime::<Utc>::UNIX_EPOCH,
            stats: MemoryStats::default(),
            journal: Vec::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn similarity(&self) -> &SharedSimilarity {
        &self.similarity
    }

    /// Logical clock: the latest observation timestamp seen so far.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn observe_time(&mut self, at: DateTime<Utc>) {
        if at > self.now {
            self.now = at;
        }
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut WorkingMemory {
        &mut self.working
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn take_journal(&mut self) -> Vec<TierEvent> {
        std::mem::take(&mut self.journal)
    }

    pub fn len(&self, tier: Tier) -> usize {
        match tier {
            Tier::Working => self.working.len(),
            Tier::Episodic => self.episodic.len(),
            Tier::Semantic => self.semantic.len(),
        }
    }

    pub fn total(&self) -> usize {
        self.working.len() + self.episodic.len() + self.semantic.len()
    }

    pub fn tier_of(&self, id: ParticleId) -> Option<Tier> {
        if self.working.contains(id) {
            Some(Tier::Working)
        } else if self.episodic.contains(id) {
            Some(Tier::Episodic)
        } else if self.semantic.contains(id) {
            Some(Tier::Semantic)
        } else {
            None
        }
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.working
            .get(id)
            .or_else(|| self.episodic.get(id))
            .or_else(|| self.semantic.get(id))
    }

    pub fn get_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        match self.tier_of(id)? {
            Tier::Working => self.working.get_mut(id),
            Tier::Episodic => self.episodic.get_mut(id),
            Tier::Semantic => self.semantic.get_mut(id),
        }
    }

    pub fn iter(&self, tier: Tier) -> Box<dyn Iterator<Item = &Particle> + '_> {
        match tier {
            Tier::Working => Box::new(self.working.iter()),
            Tier::Episodic => Box::new(self.episodic.iter()),
            Tier::Semantic => Box::new(self.semantic.iter()),
        }
    }

    /// Symmetric resonance edge. Missing endpoints are ignored.
    pub fn link(&mut self, a: ParticleId, b: ParticleId, weight: f64) {
        if let Some(p) = self.get_mut(a) {
            p.link(b, weight);
        }
        if let Some(p) = self.get_mut(b) {
            p.link(a, weight);
        }
    }

    // ============================================================
    // Contract operations
    // ============================================================

    /// Place a particle in a tier. A particle already held elsewhere is moved.
    /// Returns the id evicted from working memory, if any.
    pub fn store(&mut self, particle: Particle, tier: Tier) -> Option<ParticleId> {
        self.remove_anywhere(particle.id);
        match tier {
            Tier::Working => self.insert_working(particle),
            Tier::Episodic => {
                self.admit_episodic(particle);
                None
            }
            Tier::Semantic => {
                self.semantic.insert(particle);
                None
            }
        }
    }

    pub fn retrieve(&self, query: &ParticleQuery, tier: Tier) -> Vec<Particle> {
        query.select(self.iter(tier)).into_iter().cloned().collect()
    }

    /// One decay step for a tier. Working and episodic lose activation;
    /// semantic only loses relevance. Returns the number of particles touched.
    pub fn decay(&mut self, tier: Tier) -> usize {
        let epsilon = self.config.prune_epsilon;
        match tier {
            Tier::Working => decay_particles(self.working.iter_mut(), epsilon),
            Tier::Episodic => decay_particles(self.episodic.iter_mut(), epsilon),
            Tier::Semantic => {
                let flagged = self.semantic.decay_relevance(
                    self.config.semantic_relevance_decay,
                    self.config.semantic_relevance_floor,
                );
                if flagged > 0 {
                    debug!("{} semantic particles marked low-relevance", flagged);
                }
                self.semantic.len()
            }
        }
    }

    pub fn decay_all(&mut self) {
        for tier in Tier::ALL {
            self.decay(tier);
        }
    }

    /// Move a particle one tier up. Returns the tier it ended in: a working
    /// promotion may continue on to semantic, and a semantic promotion that
    /// fails the recurrence check leaves the particle episodic.
    pub fn promote(&mut self, id: ParticleId, from: Tier, to: Tier) -> Result<Tier> {
        if from.next() != Some(to) {
            return Err(Error::InvalidPromotion { from, to });
        }
        match from {
            Tier::Working => {
                let particle = self.working.remove(id).ok_or(Error::ParticleNotFound(id))?;
                self.journal.push(TierEvent::Promoted { id, from, to });
                self.stats.promotions += 1;
                Ok(self.admit_episodic(particle))
            }
            Tier::Episodic => {
                let key = self
                    .episodic
                    .get(id)
                    .map(|p| p.key.clone())
                    .ok_or(Error::ParticleNotFound(id))?;
                let sessions = self.prior_sessions(&key);
                if sessions < self.config.semantic_promotion_count {
                    self.conflict(id, key, sessions);
                    return Ok(Tier::Episodic);
                }
                let particle = self.episodic.remove(id).ok_or(Error::ParticleNotFound(id))?;
                Ok(self.settle_semantic(particle))
            }
            Tier::Semantic => Err(Error::InvalidPromotion { from, to }),
        }
    }

    /// Move an episodic particle back into working memory. The particle is
    /// carried over until an observation lands on it.
    pub fn recall(&mut self, id: ParticleId, cycle: u64) -> Result<Option<ParticleId>> {
        let mut particle = self.episodic.remove(id).ok_or(Error::ParticleNotFound(id))?;
        particle.decay_rate = self.config.working_decay_rate;
        particle.created_cycle = cycle;
        particle.last_activated_cycle = cycle;
        particle.carried_over = true;
        self.journal.push(TierEvent::Recalled { id });
        Ok(self.insert_working(particle))
    }

    /// End-of-cycle maintenance: promotion, recency demotion, pruning, expiry.
    pub fn end_cycle(&mut self, cycle: u64) {
        let threshold = self.config.promotion_threshold;
        let promoted = self
            .working
            .drain_where(|p| p.created_cycle < cycle && p.activation() >= threshold);
        for particle in promoted {
            let id = particle.id;
            self.journal.push(TierEvent::Promoted {
                id,
                from: Tier::Working,
                to: Tier::Episodic,
            });
            self.stats.promotions += 1;
            let landed = self.admit_episodic(particle);
            debug!("{} promoted working -> {} at cycle {}", id, landed, cycle);
        }

        let recency = self.config.working_recency_cycles;
        let stale = self
            .working
            .drain_where(|p| cycle.saturating_sub(p.last_activated_cycle) > recency);
        for particle in stale {
            self.journal.push(TierEvent::Demoted { id: particle.id });
            self.stats.demotions += 1;
            self.admit_episodic(particle);
        }

        let grace = self.config.prune_grace_cycles;
        for particle in self.working.drain_where(|p| p.dormant_cycles > grace) {
            self.pruned(particle.id, Tier::Working);
        }
        let dormant: Vec<ParticleId> = self
            .episodic
            .iter()
            .filter(|p| p.dormant_cycles > grace)
            .map(|p| p.id)
            .collect();
        for id in dormant {
            self.episodic.remove(id);
            self.pruned(id, Tier::Episodic);
        }

        let window = Duration::days(self.config.episodic_window_days);
        for particle in self.episodic.expire(self.now, window) {
            self.journal.push(TierEvent::Expired { id: particle.id });
            self.stats.expired += 1;
        }
    }

    /// Working particles plus episodic particles at or above `floor`.
    pub fn active_particles(&self, floor: f64) -> Vec<&Particle> {
        self.working
            .iter()
            .chain(self.episodic.iter().filter(|p| p.activation() >= floor))
            .collect()
    }

    /// Demote everything still in working memory, as at session close.
    pub fn release_working(&mut self) -> Vec<ParticleId> {
        let released = self.working.drain_where(|_| true);
        let ids = released.iter().map(|p| p.id).collect();
        for particle in released {
            self.admit_episodic(particle);
        }
        ids
    }

    // ============================================================
    // Continuity
    // ============================================================

    pub fn export(&self) -> (Vec<Particle>, Vec<Particle>, Vec<Arrival>) {
        (
            self.episodic.iter().cloned().collect(),
            self.semantic.iter().cloned().collect(),
            self.episodic.arrivals().to_vec(),
        )
    }

    pub fn restore(&mut self, episodic: Vec<Particle>, semantic: Vec<Particle>, arrivals: Vec<Arrival>) {
        for particle in episodic {
            self.observe_time(particle.last_activated_at);
            self.episodic.insert(particle);
        }
        for particle in semantic {
            self.observe_time(particle.last_activated_at);
            self.semantic.insert_restored(particle);
        }
        self.episodic.restore_arrivals(arrivals);
    }

    // ============================================================
    // Internals
    // ============================================================

    fn remove_anywhere(&mut self, id: ParticleId) -> Option<Particle> {
        self.working
            .remove(id)
            .or_else(|| self.episodic.remove(id))
            .or_else(|| self.semantic.take(id))
    }

    fn insert_working(&mut self, particle: Particle) -> Option<ParticleId> {
        let evicted = self.working.insert(particle)?;
        let id = evicted.id;
        info!(
            "Working memory at capacity ({}), evicting {} (activation {:.3}) to episodic",
            self.working.capacity(),
            id,
            evicted.activation()
        );
        self.journal.push(TierEvent::Evicted { id, activation: evicted.activation() });
        self.stats.evictions += 1;
        self.admit_episodic(evicted);
        Some(id)
    }

    /// Entry point for everything landing in episodic. Activation is kept as
    /// the starting episodic weight. Strong arrivals are ledgered and checked
    /// against the K-session recurrence rule. Carried-over particles were
    /// not observed this session, so they never count as arrivals.
    fn admit_episodic(&mut self, mut particle: Particle) -> Tier {
        particle.decay_rate = self.config.episodic_decay_rate;
        let threshold = self.config.promotion_threshold;
        if particle.carried_over || particle.activation() < threshold {
            self.episodic.insert(particle);
            return Tier::Episodic;
        }

        self.episodic.record_arrival(Arrival {
            key: particle.key.clone(),
            session: self.session,
            particle: particle.id,
            activation: particle.activation(),
        });

        let sessions = self.prior_sessions(&particle.key);
        if sessions >= self.config.semantic_promotion_count {
            return self.settle_semantic(particle);
        }
        self.conflict(particle.id, particle.key.clone(), sessions);
        self.episodic.insert(particle);
        Tier::Episodic
    }

    /// Move into semantic, or refresh an equivalent belief and stay episodic.
    fn settle_semantic(&mut self, particle: Particle) -> Tier {
        let threshold = self.config.promotion_threshold;
        if let Some(belief) =
            self.semantic
                .find_equivalent(&particle.key, self.similarity.as_ref(), threshold)
        {
            if let Some(existing) = self.semantic.get_mut(belief) {
                existing.refresh_relevance();
            }
            debug!("{} refreshed existing belief {}", particle.id, belief);
            self.journal.push(TierEvent::BeliefRefreshed { belief, source: particle.id });
            self.stats.beliefs_refreshed += 1;
            self.episodic.insert(particle);
            return Tier::Episodic;
        }

        info!("{} ('{}') promoted episodic -> semantic", particle.id, particle.key);
        self.journal.push(TierEvent::Promoted {
            id: particle.id,
            from: Tier::Episodic,
            to: Tier::Semantic,
        });
        self.stats.promotions += 1;
        self.semantic.insert(particle);
        Tier::Semantic
    }

    fn prior_sessions(&self, key: &ContentKey) -> usize {
        self.episodic
            .prior_sessions(
                key,
                self.session,
                self.similarity.as_ref(),
                self.config.promotion_threshold,
            )
            .len()
    }

    fn conflict(&mut self, id: ParticleId, key: ContentKey, sessions: usize) {
        let required = self.config.semantic_promotion_count;
        debug!(
            "Promotion conflict: {} ('{}') seen in {} prior sessions, {} required",
            id, key, sessions, required
        );
        self.journal.push(TierEvent::PromotionConflict { id, key, sessions, required });
        self.stats.promotion_conflicts += 1;
    }

    fn pruned(&mut self, id: ParticleId, tier: Tier) {
        debug!("Pruned {} from {}", id, tier);
        self.journal.push(TierEvent::Pruned { id, tier });
        self.stats.pruned += 1;
    }
}

fn decay_particles<'a>(particles: impl Iterator<Item = &'a mut Particle>, epsilon: f64) -> usize {
    let mut touched = 0;
    for particle in particles {
        particle.decay();
        if particle.activation() < epsilon {
            particle.dormant_cycles += 1;
        } else {
            particle.dormant_cycles = 0;
        }
        touched += 1;
    }
    touched
}
