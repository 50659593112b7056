//! Episodic tier: unbounded, time-windowed, indexed by session for replay.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thoughtclaw_core::{ContentKey, Particle, ParticleId, SessionId, Similarity, Tier};

/// A particle reaching the episodic tier at or above the promotion threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub key: ContentKey,
    pub session: SessionId,
    pub particle: ParticleId,
    pub activation: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodicMemory {
    particles: BTreeMap<ParticleId, Particle>,
    by_session: BTreeMap<SessionId, BTreeSet<ParticleId>>,
    /// One entry per (key, session); survives removal of the particle itself.
    arrivals: Vec<Arrival>,
}

impl EpisodicMemory {
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

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Particle> {
        self.particles.values_mut()
    }

    pub fn insert(&mut self, mut particle: Particle) {
        particle.tier = Tier::Episodic;
        self.by_session.entry(particle.session).or_default().insert(particle.id);
        self.particles.insert(particle.id, particle);
    }

    pub fn remove(&mut self, id: ParticleId) -> Option<Particle> {
        let particle = self.particles.remove(&id)?;
        if let Some(ids) = self.by_session.get_mut(&particle.session) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_session.remove(&particle.session);
            }
        }
        Some(particle)
    }

    /// Particles originating in a session, in id order.
    pub fn replay(&self, session: SessionId) -> Vec<&Particle> {
        self.by_session
            .get(&session)
            .map(|ids| ids.iter().filter_map(|id| self.particles.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.by_session.keys().copied().collect()
    }

    pub fn arrivals(&self) -> &[Arrival] {
        &self.arrivals
    }

    pub fn restore_arrivals(&mut self, arrivals: Vec<Arrival>) {
        self.arrivals = arrivals;
    }

    /// Record an arrival. Returns false when (key, session) was already seen.
    pub fn record_arrival(&mut self, arrival: Arrival) -> bool {
        let seen = self
            .arrivals
            .iter()
            .any(|a| a.key == arrival.key && a.session == arrival.session);
        if !seen {
            self.arrivals.push(arrival);
        }
        !seen
    }

    /// Distinct sessions other than `current` in which an equivalent
    /// particle (same key, resonance at or above `threshold`) arrived.
    pub fn prior_sessions(
        &self,
        key: &ContentKey,
        current: SessionId,
        similarity: &dyn Similarity,
        threshold: f64,
    ) -> BTreeSet<SessionId> {
        self.arrivals
            .iter()
            .filter(|a| a.session != current && a.key == *key)
            .filter(|a| similarity.resonance(&a.key, key) >= threshold)
            .map(|a| a.session)
            .collect()
    }

    /// Remove particles not activated since `now - window`.
    pub fn expire(&mut self, now: DateTime<Utc>, window: Duration) -> Vec<Particle> {
        let cutoff = now - window;
        let stale: Vec<ParticleId> = self
            .particles
            .values()
            .filter(|p| p.last_activated_at < cutoff)
            .map(|p| p.id)
            .collect();
        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thoughtclaw_core::{ExactKey, FnSimilarity};

    fn particle(id: u64, key: &str, session: u32, at: DateTime<Utc>) -> Particle {
        Particle::new(
            ParticleId(id),
            ContentKey::new(key),
            "",
            0.1,
            1.0,
            at,
            1,
            SessionId(session),
        )
    }

    fn arrival(key: &str, session: u32, id: u64) -> Arrival {
        Arrival {
            key: ContentKey::new(key),
            session: SessionId(session),
            particle: ParticleId(id),
            activation: 0.9,
        }
    }

    #[test]
    fn replay_groups_by_origin_session() {
        let now = Utc::now();
        let mut em = EpisodicMemory::new();
        em.insert(particle(1, "a", 1, now));
        em.insert(particle(2, "b", 2, now));
        em.insert(particle(3, "c", 1, now));
        let ids: Vec<u64> = em.replay(SessionId(1)).iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(em.sessions(), vec![SessionId(1), SessionId(2)]);

        em.remove(ParticleId(2));
        assert_eq!(em.sessions(), vec![SessionId(1)]);
        assert!(em.replay(SessionId(2)).is_empty());
    }

    #[test]
    fn arrivals_dedupe_per_session() {
        let mut em = EpisodicMemory::new();
        assert!(em.record_arrival(arrival("x", 1, 1)));
        assert!(!em.record_arrival(arrival("x", 1, 5)));
        assert!(em.record_arrival(arrival("x", 2, 6)));
        assert_eq!(em.arrivals().len(), 2);
    }

    #[test]
    fn prior_sessions_excludes_current_and_other_keys() {
        let mut em = EpisodicMemory::new();
        em.record_arrival(arrival("x", 1, 1));
        em.record_arrival(arrival("x", 2, 2));
        em.record_arrival(arrival("y", 3, 3));
        em.record_arrival(arrival("x", 4, 4));
        let prior = em.prior_sessions(&ContentKey::new("x"), SessionId(4), &ExactKey, 0.6);
        assert_eq!(prior.into_iter().collect::<Vec<_>>(), vec![SessionId(1), SessionId(2)]);
    }

    #[test]
    fn prior_sessions_require_resonance() {
        let mut em = EpisodicMemory::new();
        em.record_arrival(arrival("x", 1, 1));
        let weak = FnSimilarity(|_: &ContentKey, _: &ContentKey| 0.3);
        assert!(em.prior_sessions(&ContentKey::new("x"), SessionId(2), &weak, 0.6).is_empty());
    }

    #[test]
    fn expire_drops_particles_outside_window() {
        let now = Utc::now();
        let mut em = EpisodicMemory::new();
        em.insert(particle(1, "old", 1, now - Duration::days(40)));
        em.insert(particle(2, "fresh", 1, now - Duration::days(2)));
        let expired = em.expire(now, Duration::days(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, ParticleId(1));
        assert!(em.contains(ParticleId(2)));
    }
}
