//! Inference engine
//!
//! Scores each observation against the working tier, then the episodic tier.
//! A strong enough match is reinforced (low surprise), after being recalled
//! into working memory if it had already left it. Anything else spawns a new
//! particle at full activation (high surprise).

use serde::{Deserialize, Serialize};
use thoughtclaw_core::config::InferenceConfig;
use thoughtclaw_core::{
    ContentKey, IdAllocator, Observation, Particle, ParticleId, SharedSimilarity, Tier,
};
use thoughtclaw_memory::TierSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Reinforced,
    /// Reinforced after being moved back from episodic memory.
    Recalled,
    Spawned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationResult {
    /// The particle that now carries the observation.
    pub particle: ParticleId,
    /// Id reserved at ingest, if any. Differs from `particle` on reinforcement.
    pub ticket: Option<ParticleId>,
    pub outcome: Outcome,
    /// 1 - best resonance against the working and episodic tiers.
    pub surprise: f64,
    pub best_match: Option<(ParticleId, f64)>,
    /// Working particle displaced to make room for a spawn or recall.
    pub evicted: Option<ParticleId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceStats {
    pub spawned: u64,
    pub reinforced: u64,
    /// Reinforcements that first moved the particle out of episodic.
    pub recalled: u64,
    /// Reinforcements whose target was already gone.
    pub missing_targets: u64,
}

#[derive(Clone)]
pub struct InferenceEngine {
    config: InferenceConfig,
    similarity: SharedSimilarity,
    ids: IdAllocator,
    stats: InferenceStats,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("config", &self.config)
            .field("next_id", &self.ids.peek())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl InferenceEngine {
    pub fn new(config: InferenceConfig, similarity: SharedSimilarity, ids: IdAllocator) -> Self {
        Self {
            config,
            similarity,
            ids,
            stats: InferenceStats::default(),
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn stats(&self) -> InferenceStats {
        self.stats
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Resonance of `key` against every working particle, in id order.
    pub fn score(&self, tiers: &TierSet, key: &ContentKey) -> Vec<(ParticleId, f64)> {
        tiers
            .working()
            .iter()
            .map(|p| (p.id, self.similarity.resonance(&p.key, key)))
            .collect()
    }

    /// Resonance of `key` against every episodic particle, in id order.
    pub fn score_episodic(&self, tiers: &TierSet, key: &ContentKey) -> Vec<(ParticleId, f64)> {
        tiers
            .episodic()
            .iter()
            .map(|p| (p.id, self.similarity.resonance(&p.key, key)))
            .collect()
    }

    pub fn observe(&mut self, tiers: &mut TierSet, observation: Observation, cycle: u64) -> ObservationResult {
        tiers.observe_time(observation.timestamp);
        let threshold = self.config.reinforcement_threshold;
        let scores = self.score(tiers, &observation.key);
        let best = best_match(&scores);

        if let Some((target, weight)) = best.filter(|(_, w)| *w >= threshold) {
            if let Some(particle) = tiers.working_mut().get_mut(target) {
                particle.carried_over = false;
                let activation = particle.reinforce(
                    self.config.reinforcement_increment,
                    observation.timestamp,
                    cycle,
                );
                self.stats.reinforced += 1;
                debug!(
                    "'{}' reinforced {} (resonance {:.3}, activation {:.3})",
                    observation.key, target, weight, activation
                );
                return ObservationResult {
                    particle: target,
                    ticket: observation.ticket,
                    outcome: Outcome::Reinforced,
                    surprise: 1.0 - weight,
                    best_match: best,
                    evicted: None,
                };
            }
        }

        let remembered = best_match(&self.score_episodic(tiers, &observation.key));
        let surprise = 1.0 - [best, remembered]
            .iter()
            .flatten()
            .map(|(_, w)| *w)
            .fold(0.0, f64::max);

        if let Some((target, weight)) = remembered.filter(|(_, w)| *w >= threshold) {
            if let Some(result) = self.recall(tiers, target, weight, &observation, cycle, surprise) {
                return result;
            }
        }

        self.spawn(tiers, observation, cycle, &scores, surprise)
    }

    /// Move an episodic match back into working memory and reinforce it there.
    fn recall(
        &mut self,
        tiers: &mut TierSet,
        target: ParticleId,
        weight: f64,
        observation: &Observation,
        cycle: u64,
        surprise: f64,
    ) -> Option<ObservationResult> {
        let evicted = match tiers.recall(target, cycle) {
            Ok(evicted) => evicted,
            Err(e) => {
                debug!("Could not recall {} for '{}': {}", target, observation.key, e);
                return None;
            }
        };
        let particle = tiers.working_mut().get_mut(target)?;
        particle.carried_over = false;
        let activation = particle.reinforce(
            self.config.reinforcement_increment,
            observation.timestamp,
            cycle,
        );
        self.stats.reinforced += 1;
        self.stats.recalled += 1;
        debug!(
            "'{}' recalled {} from episodic (resonance {:.3}, activation {:.3})",
            observation.key, target, weight, activation
        );
        Some(ObservationResult {
            particle: target,
            ticket: observation.ticket,
            outcome: Outcome::Recalled,
            surprise,
            best_match: Some((target, weight)),
            evicted,
        })
    }

    /// Reinforce a known particle directly. A target that has already been
    /// pruned spawns a fresh particle instead.
    pub fn reinforce_or_spawn(
        &mut self,
        tiers: &mut TierSet,
        target: ParticleId,
        observation: Observation,
        cycle: u64,
    ) -> ObservationResult {
        tiers.observe_time(observation.timestamp);
        let increment = self.config.reinforcement_increment;
        let tier = tiers.tier_of(target);
        if let (Some(tier), Some(particle)) = (tier, tiers.get_mut(target)) {
            particle.carried_over = false;
            if tier == Tier::Semantic {
                particle.refresh_relevance();
                particle.touch(observation.timestamp, cycle);
            } else {
                particle.reinforce(increment, observation.timestamp, cycle);
            }
            self.stats.reinforced += 1;
            return ObservationResult {
                particle: target,
                ticket: observation.ticket,
                outcome: Outcome::Reinforced,
                surprise: 0.0,
                best_match: Some((target, 1.0)),
                evicted: None,
            };
        }

        debug!("{} no longer exists, spawning for '{}'", target, observation.key);
        self.stats.missing_targets += 1;
        let scores = self.score(tiers, &observation.key);
        self.spawn(tiers, observation, cycle, &scores, 1.0)
    }

    fn spawn(
        &mut self,
        tiers: &mut TierSet,
        observation: Observation,
        cycle: u64,
        scores: &[(ParticleId, f64)],
        surprise: f64,
    ) -> ObservationResult {
        let id = observation
            .ticket
            .unwrap_or_else(|| ParticleId(self.ids.next()));
        let best = best_match(scores);
        let mut particle = Particle::new(
            id,
            observation.key.clone(),
            observation.payload,
            tiers.config().working_decay_rate,
            self.config.gain,
            observation.timestamp,
            cycle,
            tiers.session(),
        );
        particle.parent = best.filter(|(_, w)| *w > 0.0).map(|(p, _)| p);

        let evicted = tiers.store(particle, Tier::Working);
        for &(other, weight) in scores {
            if weight >= self.config.link_threshold {
                tiers.link(id, other, weight);
            }
        }
        self.stats.spawned += 1;
        debug!(
            "'{}' spawned {} (surprise {:.3}, parent {:?})",
            observation.key, id, surprise, best
        );

        ObservationResult {
            particle: id,
            ticket: observation.ticket,
            outcome: Outcome::Spawned,
            surprise,
            best_match: best,
            evicted,
        }
    }
}

/// Highest weight wins; on equal weights the lowest id (first seen) is kept.
fn best_match(scores: &[(ParticleId, f64)]) -> Option<(ParticleId, f64)> {
    let mut best: Option<(ParticleId, f64)> = None;
    for &(id, weight) in scores {
        match best {
            Some((best_id, best_weight)) if weight < best_weight || (weight == best_weight && best_id < id) => {}
            _ => best = Some((id, weight)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use thoughtclaw_core::{ExactKey, FnSimilarity, RuntimeConfig, SessionId};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn setup(similarity: SharedSimilarity) -> (InferenceEngine, TierSet) {
        let config = RuntimeConfig::default();
        let tiers = TierSet::new(config.memory.clone(), similarity.clone(), SessionId(1));
        let engine = InferenceEngine::new(config.inference, similarity, IdAllocator::starting_at(1));
        (engine, tiers)
    }

    #[test]
    fn unknown_content_spawns_at_full_activation() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let result = engine.observe(&mut tiers, Observation::new("x", "", at(0)), 1);
        assert_eq!(result.outcome, Outcome::Spawned);
        assert_eq!(result.surprise, 1.0);
        assert_eq!(tiers.working().get(result.particle).unwrap().activation(), 1.0);
    }

    #[test]
    fn resonant_content_reinforces() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let first = engine.observe(&mut tiers, Observation::new("x", "", at(0)), 1);
        tiers.decay(Tier::Working);
        let second = engine.observe(&mut tiers, Observation::new("x", "", at(5)), 1);
        assert_eq!(second.outcome, Outcome::Reinforced);
        assert_eq!(second.particle, first.particle);
        assert_eq!(second.surprise, 0.0);
        let p = tiers.working().get(first.particle).unwrap();
        assert!((p.activation() - 1.0).abs() < 1e-9);
        assert_eq!(p.last_activated_at, at(5));
        assert_eq!(tiers.len(Tier::Working), 1);
    }

    #[test]
    fn ticket_becomes_spawned_id() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let obs = Observation::new("x", "", at(0)).with_ticket(ParticleId(40));
        let result = engine.observe(&mut tiers, obs, 1);
        assert_eq!(result.particle, ParticleId(40));
        assert_eq!(result.ticket, Some(ParticleId(40)));
    }

    #[test]
    fn ties_break_on_lowest_id() {
        let flat: SharedSimilarity = Arc::new(FnSimilarity(|a: &ContentKey, b: &ContentKey| {
            if a == b { 1.0 } else { 0.7 }
        }));
        let (mut engine, mut tiers) = setup(flat);
        let mut config = engine.config().clone();
        config.reinforcement_threshold = 0.9;
        engine = InferenceEngine::new(config, tiers.similarity().clone(), IdAllocator::starting_at(1));

        engine.observe(&mut tiers, Observation::new("a", "", at(0)), 1);
        engine.observe(&mut tiers, Observation::new("b", "", at(0)), 1);
        let third = engine.observe(&mut tiers, Observation::new("c", "", at(0)), 1);
        assert_eq!(third.best_match, Some((ParticleId(1), 0.7)));

        let p = tiers.working().get(third.particle).unwrap();
        assert_eq!(p.parent, Some(ParticleId(1)));
        assert_eq!(p.resonance.len(), 2);
        assert_eq!(tiers.working().get(ParticleId(2)).unwrap().resonance[&third.particle], 0.7);
    }

    #[test]
    fn missing_target_spawns_instead() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let result = engine.reinforce_or_spawn(&mut tiers, ParticleId(99), Observation::new("y", "", at(0)), 2);
        assert_eq!(result.outcome, Outcome::Spawned);
        assert_ne!(result.particle, ParticleId(99));
        assert_eq!(engine.stats().missing_targets, 1);
    }

    #[test]
    fn existing_target_is_reinforced_in_place() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let first = engine.observe(&mut tiers, Observation::new("y", "", at(0)), 1);
        tiers.decay(Tier::Working);
        let result = engine.reinforce_or_spawn(&mut tiers, first.particle, Observation::new("other", "", at(1)), 2);
        assert_eq!(result.outcome, Outcome::Reinforced);
        assert_eq!(result.particle, first.particle);
        assert_eq!(tiers.working().get(first.particle).unwrap().last_activated_cycle, 2);
    }

    #[test]
    fn recurrence_after_promotion_recalls_the_original() {
        let (mut engine, mut tiers) = setup(Arc::new(ExactKey));
        let first = engine.observe(&mut tiers, Observation::new("x", "", at(0)), 1);
        tiers.end_cycle(2);
        assert_eq!(tiers.tier_of(first.particle), Some(Tier::Episodic));
        tiers.decay(Tier::Episodic);

        let again = engine.observe(&mut tiers, Observation::new("x", "", at(10)), 3);
        assert_eq!(again.outcome, Outcome::Recalled);
        assert_eq!(again.particle, first.particle);
        assert_eq!(again.surprise, 0.0);
        assert_eq!(tiers.tier_of(first.particle), Some(Tier::Working));
        assert_eq!(tiers.len(Tier::Episodic), 0);
        let p = tiers.working().get(first.particle).unwrap();
        assert_eq!(p.created_cycle, 3);
        assert!(!p.carried_over);
        assert_eq!(engine.stats().spawned, 1);
        assert_eq!(engine.stats().reinforced, 1);
        assert_eq!(engine.stats().recalled, 1);
    }

    #[test]
    fn weak_episodic_match_still_spawns() {
        let half: SharedSimilarity = Arc::new(FnSimilarity(|a: &ContentKey, b: &ContentKey| {
            if a == b { 1.0 } else { 0.4 }
        }));
        let (mut engine, mut tiers) = setup(half);
        let first = engine.observe(&mut tiers, Observation::new("a", "", at(0)), 1);
        tiers.end_cycle(2);
        let other = engine.observe(&mut tiers, Observation::new("b", "", at(1)), 3);
        assert_eq!(other.outcome, Outcome::Spawned);
        assert!((other.surprise - 0.6).abs() < 1e-9);
        assert_eq!(tiers.tier_of(first.particle), Some(Tier::Episodic));
    }

    #[test]
    fn spawn_over_capacity_reports_eviction() {
        let config = RuntimeConfig::default();
        let mut memory = config.memory.clone();
        memory.working_capacity = 1;
        let similarity: SharedSimilarity = Arc::new(ExactKey);
        let mut tiers = TierSet::new(memory, similarity.clone(), SessionId(1));
        let mut engine = InferenceEngine::new(config.inference, similarity, IdAllocator::starting_at(1));
        let first = engine.observe(&mut tiers, Observation::new("a", "", at(0)), 1);
        let second = engine.observe(&mut tiers, Observation::new("b", "", at(0)), 1);
        assert_eq!(second.evicted, Some(first.particle));
        assert_eq!(tiers.tier_of(first.particle), Some(Tier::Episodic));
    }
}
