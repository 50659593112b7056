//! Semantic tier: permanent beliefs that only lose relevance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thoughtclaw_core::{ContentKey, Particle, ParticleId, Similarity, Tier};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticMemory {
    particles: BTreeMap<ParticleId, Particle>,
}

impl SemanticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.particles.contains_key(&id)
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.get(&id)
    }

    pub fn get_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        self.particles.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.particles.values()
    }

    pub fn insert(&mut self, mut particle: Particle) {
        particle.tier = Tier::Semantic;
        particle.refresh_relevance();
        self.particles.insert(particle.id, particle);
    }

    /// Reload a persisted belief without touching its relevance.
    pub fn insert_restored(&mut self, mut particle: Particle) {
        particle.tier = Tier::Semantic;
        self.particles.insert(particle.id, particle);
    }

    /// Only used when a belief is explicitly moved; beliefs are never dropped.
    pub(crate) fn take(&mut self, id: ParticleId) -> Option<Particle> {
        self.particles.remove(&id)
    }

    /// Existing belief equivalent to `key`, lowest id first.
    pub fn find_equivalent(
        &self,
        key: &ContentKey,
        similarity: &dyn Similarity,
        threshold: f64,
    ) -> Option<ParticleId> {
        self.particles
            .values()
            .find(|p| p.key == *key && similarity.resonance(&p.key, key) >= threshold)
            .map(|p| p.id)
    }

    pub fn decay_relevance(&mut self, rate: f64, floor: f64) -> usize {
        let mut newly_low = 0;
        for particle in self.particles.values_mut() {
            let was_low = particle.low_relevance;
            particle.decay_relevance(rate, floor);
            if particle.low_relevance && !was_low {
                newly_low += 1;
            }
        }
        newly_low
    }
}
