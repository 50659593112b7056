//! Particle queries: glob over content keys plus activation/limit filters.

use globset::{GlobBuilder, GlobMatcher};
use thoughtclaw_core::{Error, Particle, Result};

#[derive(Debug, Clone, Default)]
pub struct ParticleQuery {
    pattern: Option<GlobMatcher>,
    min_activation: f64,
    limit: Option<usize>,
}

impl ParticleQuery {
    /// Every particle in the tier.
    pub fn all() -> Self {
        Self::default()
    }

    /// Content keys matching a glob (`user.*`, `*weather*`, `{a,b}.x`).
    pub fn pattern(pattern: &str) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| Error::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Self {
            pattern: Some(glob.compile_matcher()),
            ..Self::default()
        })
    }

    pub fn min_activation(mut self, floor: f64) -> Self {
        self.min_activation = floor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, particle: &Particle) -> bool {
        if particle.activation() < self.min_activation {
            return false;
        }
        match &self.pattern {
            Some(glob) => glob.is_match(particle.key.as_str()),
            None => true,
        }
    }

    /// Filter, order by activation (highest first, lowest id on ties), cap.
    pub fn select<'a, I>(&self, particles: I) -> Vec<&'a Particle>
    where
        I: IntoIterator<Item = &'a Particle>,
    {
        let mut hits: Vec<&Particle> = particles.into_iter().filter(|p| self.matches(p)).collect();
        hits.sort_by(|a, b| {
            b.activation()
                .partial_cmp(&a.activation())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = self.limit {
            hits.truncate(limit);
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use thoughtclaw_core::{ContentKey, ParticleId, SessionId};

    fn particle(id: u64, key: &str, activation: f64) -> Particle {
        let mut p = Particle::new(
            ParticleId(id),
            ContentKey::new(key),
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
    fn glob_filters_keys() {
        let ps = vec![
            particle(1, "user.greeting", 0.5),
            particle(2, "user.farewell", 0.9),
            particle(3, "weather.rain", 1.0),
        ];
        let q = ParticleQuery::pattern("user.*").unwrap();
        let ids: Vec<u64> = q.select(&ps).iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn floor_and_limit_apply() {
        let ps = vec![
            particle(1, "a", 0.2),
            particle(2, "b", 0.8),
            particle(3, "c", 0.8),
        ];
        let q = ParticleQuery::all().min_activation(0.5).limit(1);
        let ids: Vec<u64> = q.select(&ps).iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn invalid_glob_is_reported() {
        let err = ParticleQuery::pattern("user.[").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern(_)));
    }
}
