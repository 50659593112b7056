//! Working tier: a small, bounded set of currently active particles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thoughtclaw_core::{Particle, ParticleId, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    capacity: usize,
    particles: BTreeMap<ParticleId, Particle>,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            particles: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.particles.len() >= self.capacity
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

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Particle> {
        self.particles.values_mut()
    }

    pub fn ids(&self) -> Vec<ParticleId> {
        self.particles.keys().copied().collect()
    }

    /// Insert a particle. When the tier is full the lowest-activation
    /// resident (lowest id on ties) is returned for the caller to demote.
    pub fn insert(&mut self, mut particle: Particle) -> Option<Particle> {
        particle.tier = Tier::Working;
        let evicted = if !self.particles.contains_key(&particle.id) && self.is_full() {
            self.weakest().and_then(|id| self.particles.remove(&id))
        } else {
            None
        };
        self.particles.insert(particle.id, particle);
        evicted
    }

    pub fn remove(&mut self, id: ParticleId) -> Option<Particle> {
        self.particles.remove(&id)
    }

    /// Lowest activation, lowest id on ties.
    pub fn weakest(&self) -> Option<ParticleId> {
        self.particles
            .values()
            .min_by(|a, b| {
                a.activation()
                    .partial_cmp(&b.activation())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|p| p.id)
    }

    /// Remove every particle matching the predicate, in id order.
    pub fn drain_where<F>(&mut self, mut predicate: F) -> Vec<Particle>
    where
        F: FnMut(&Particle) -> bool,
    {
        let ids: Vec<ParticleId> = self
            .particles
            .values()
            .filter(|p| predicate(p))
            .map(|p| p.id)
            .collect();
        ids.into_iter().filter_map(|id| self.particles.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use thoughtclaw_core::{ContentKey, SessionId};

    fn particle(id: u64, activation: f64) -> Particle {
        let mut p = Particle::new(
            ParticleId(id),
            ContentKey::new(format!("k{}", id)),
            "",
            0.1,
            1.0,
            Utc::now(),
            1,
            SessionId(1),
        );
        p.set_activation(activation);
        p
    }

    #[test]
    fn evicts_lowest_activation_when_full() {
        let mut wm = WorkingMemory::new(2);
        assert!(wm.insert(particle(1, 0.9)).is_none());
        assert!(wm.insert(particle(2, 0.3)).is_none());
        let evicted = wm.insert(particle(3, 1.0)).unwrap();
        assert_eq!(evicted.id, ParticleId(2));
        assert_eq!(evicted.activation(), 0.3);
        assert_eq!(wm.len(), 2);
        assert!(wm.contains(ParticleId(3)));
    }

    #[test]
    fn eviction_ties_break_on_lowest_id() {
        let mut wm = WorkingMemory::new(2);
        wm.insert(particle(7, 1.0));
        wm.insert(particle(4, 1.0));
        let evicted = wm.insert(particle(9, 1.0)).unwrap();
        assert_eq!(evicted.id, ParticleId(4));
    }

    #[test]
    fn reinserting_resident_never_evicts() {
        let mut wm = WorkingMemory::new(1);
        wm.insert(particle(1, 0.5));
        assert!(wm.insert(particle(1, 0.8)).is_none());
        assert_eq!(wm.get(ParticleId(1)).unwrap().activation(), 0.8);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let wm = WorkingMemory::new(0);
        assert_eq!(wm.capacity(), 1);
    }

    #[test]
    fn drain_where_removes_matches_only() {
        let mut wm = WorkingMemory::new(5);
        wm.insert(particle(1, 0.9));
        wm.insert(particle(2, 0.1));
        wm.insert(particle(3, 0.7));
        let drained = wm.drain_where(|p| p.activation() >= 0.6);
        let ids: Vec<u64> = drained.iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(wm.ids(), vec![ParticleId(2)]);
    }
}
