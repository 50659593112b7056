//! Thoughtclaw Memory - working, episodic and semantic tiers
//!
//! Each tier exclusively owns the particles it holds. Moving a particle
//! between tiers is always remove-then-insert on the same value, so no
//! particle is ever visible in two tiers.

pub mod episodic;
pub mod query;
pub mod semantic;
pub mod session;
pub mod sink;
pub mod tiers;
pub mod working;

pub use episodic::{Arrival, EpisodicMemory};
pub use query::ParticleQuery;
pub use semantic::SemanticMemory;
pub use session::{Continuity, SessionRecord, SessionStore, CONTINUITY_VERSION};
pub use sink::{spawn_persist, JsonlSink, SemanticSink};
pub use tiers::{MemoryStats, TierEvent, TierSet};
pub use working::WorkingMemory;
