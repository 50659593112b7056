//! Session continuity file
//!
//! One JSON document per store directory: the session ledger plus the
//! long-retention tiers and id counters, so the next session resumes where
//! the last one stopped. Writes go to a tmp file and are renamed into place.

use crate::episodic::Arrival;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thoughtclaw_core::{Basin, Error, Particle, ParticleId, Result, SessionId};
use tracing::{info, warn};

pub const CONTINUITY_VERSION: u32 = 1;
const CONTINUITY_FILE: &str = "session.json";

/// What one heartbeat session left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub basins: Vec<Basin>,
    /// Particles promoted out of working memory during the session.
    pub promoted: Vec<ParticleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuity {
    pub version: u32,
    pub sessions: Vec<SessionRecord>,
    pub episodic: Vec<Particle>,
    pub semantic: Vec<Particle>,
    pub arrivals: Vec<Arrival>,
    pub next_particle_id: u64,
    pub next_basin_id: u64,
}

impl Default for Continuity {
    fn default() -> Self {
        Self {
            version: CONTINUITY_VERSION,
            sessions: Vec::new(),
            episodic: Vec::new(),
            semantic: Vec::new(),
            arrivals: Vec::new(),
            next_particle_id: 1,
            next_basin_id: 1,
        }
    }
}

impl Continuity {
    pub fn last_session(&self) -> Option<&SessionRecord> {
        self.sessions.last()
    }

    /// The ordinal the next opened session should use.
    pub fn next_session(&self) -> SessionId {
        self.sessions
            .iter()
            .map(|r| r.session)
            .max()
            .map(SessionId::next)
            .unwrap_or(SessionId(1))
    }
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CONTINUITY_FILE)
    }

    /// Load the continuity file. A missing file starts fresh; a file that
    /// cannot be read or parsed is an error and is left on disk untouched.
    pub fn load(&self) -> Result<Continuity> {
        let path = self.path();
        if !path.exists() {
            info!("No session file at {} - starting fresh", path.display());
            return Ok(Continuity::default());
        }
        let json = std::fs::read_to_string(&path)?;
        let continuity = serde_json::from_str::<Continuity>(&json).map_err(|e| {
            warn!("Failed to parse {}: {}", path.display(), e);
            Error::config(format!("unreadable session file {}: {}", path.display(), e))
        })?;
        info!(
            "Hydrated {} sessions from {} ({} episodic, {} semantic)",
            continuity.sessions.len(),
            path.display(),
            continuity.episodic.len(),
            continuity.semantic.len()
        );
        Ok(continuity)
    }

    pub fn save(&self, continuity: &Continuity) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let json = serde_json::to_string_pretty(continuity)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: u32) -> SessionRecord {
        SessionRecord {
            session: SessionId(session),
            started_at: Utc::now(),
            ended_at: None,
            cycles: 4,
            basins: Vec::new(),
            promoted: vec![ParticleId(2)],
        }
    }

    #[test]
    fn fresh_store_starts_at_session_one() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let continuity = store.load().unwrap();
        assert!(continuity.sessions.is_empty());
        assert_eq!(continuity.next_session(), SessionId(1));
        assert_eq!(continuity.next_particle_id, 1);
    }

    #[test]
    fn save_is_atomic_via_rename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("nested"));
        let mut continuity = Continuity::default();
        continuity.sessions.push(record(1));
        continuity.next_particle_id = 42;
        store.save(&continuity).unwrap();

        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());

        let restored = store.load().unwrap();
        assert_eq!(restored.sessions, continuity.sessions);
        assert_eq!(restored.next_particle_id, 42);
        assert_eq!(restored.next_session(), SessionId(2));
    }

    #[test]
    fn corrupt_file_is_an_error_and_stays_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        std::fs::write(store.path(), "{ not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("session.json"), "{}", err);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ not json");
    }
}
