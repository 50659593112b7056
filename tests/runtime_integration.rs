//! End-to-end runs of the cognitive runtime: reinforcement, eviction,
//! episodic retention, cross-session promotion, replanning, and replay.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use thoughtclaw_core::{
    ContentKey, Error, ExactKey, FnSimilarity, Result, RuntimeConfig, Tier, TokenJaccard,
};
use thoughtclaw_heartbeat::{
    CognitiveRuntime, Cycles, DefaultReasoning, Plan, PerceptionReport, Reasoning, ReasoningReport,
    RuntimeEvent, StageContext,
};
use thoughtclaw_inference::Outcome;

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.heartbeat.tick_ms = 0;
    config
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(seconds)
}

// ============================================================
// Reinforcement and eviction
// ============================================================

#[tokio::test]
async fn resonant_repeats_reinforce_one_particle() {
    let similarity = FnSimilarity(|_: &ContentKey, _: &ContentKey| 0.9);
    let rt = CognitiveRuntime::builder(config()).similarity(similarity).build().unwrap();
    let mut events = rt.events();
    let first = rt.observe("X", "one", at(0));
    rt.observe("X", "two", at(1));
    rt.observe("X", "three", at(2));
    rt.beat().await.unwrap();

    let snap = rt.snapshot();
    assert_eq!(snap.working.len(), 1);
    assert_eq!(snap.by_key("X").len(), 1);
    let particle = &snap.working[0];
    assert_eq!(particle.id, first);
    assert_eq!(particle.activation(), 1.0);
    assert_eq!(snap.stats.spawned, 1);
    assert_eq!(snap.stats.reinforced, 2);

    let mut outcomes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::Observed { particle, outcome, .. } = event {
            assert_eq!(particle, first);
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![Outcome::Spawned, Outcome::Reinforced, Outcome::Reinforced]);
}

#[tokio::test]
async fn recurrence_across_cycles_reinforces_one_particle() {
    let similarity = FnSimilarity(|_: &ContentKey, _: &ContentKey| 0.9);
    let rt = CognitiveRuntime::builder(config()).similarity(similarity).build().unwrap();
    let mut events = rt.events();
    let first = rt.observe("X", "one", at(0));
    rt.beat().await.unwrap();
    rt.observe("X", "two", at(1));
    rt.beat().await.unwrap();
    assert_eq!(rt.snapshot().tier_of(first), Some(Tier::Episodic));
    rt.observe("X", "three", at(2));
    rt.beat().await.unwrap();

    let snap = rt.snapshot();
    let xs = snap.by_key("X");
    assert_eq!(xs.len(), 1);
    assert_eq!(xs[0].id, first);
    assert_eq!(snap.tier_of(first), Some(Tier::Working));
    assert_eq!(xs[0].activation(), 1.0);
    assert_eq!(snap.stats.spawned, 1);
    assert_eq!(snap.stats.reinforced, 2);
    assert_eq!(snap.stats.recalled, 1);

    let mut outcomes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::Observed { particle, outcome, .. } = event {
            assert_eq!(particle, first);
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![Outcome::Spawned, Outcome::Reinforced, Outcome::Recalled]);
}

#[tokio::test]
async fn overflow_evicts_into_episodic_with_activation_intact() {
    let mut config = config();
    config.memory.working_capacity = 2;
    let rt = CognitiveRuntime::builder(config).similarity(ExactKey).build().unwrap();
    let a = rt.observe("a", "", at(0));
    let b = rt.observe("b", "", at(0));
    let c = rt.observe("c", "", at(0));
    rt.beat().await.unwrap();

    let snap = rt.snapshot();
    let working: Vec<_> = snap.working.iter().map(|p| p.id).collect();
    assert_eq!(working.len(), 2);
    assert!(working.contains(&b) && working.contains(&c));
    assert_eq!(snap.episodic.len(), 1);
    assert_eq!(snap.episodic[0].id, a);
    assert_eq!(snap.episodic[0].activation(), 1.0);
    assert!(snap.semantic.is_empty());
    assert_eq!(snap.stats.evictions, 1);
    assert_eq!(snap.stats.promotions, 0);
}

// ============================================================
// Episodic retention
// ============================================================

#[tokio::test]
async fn episodic_particles_expire_outside_the_window() {
    let mut config = config();
    config.memory.episodic_window_days = 1;
    let rt = CognitiveRuntime::builder(config).similarity(ExactKey).build().unwrap();
    let old = rt.observe("old", "", at(0));
    rt.run(Cycles::new(2)).await.unwrap();
    assert_eq!(rt.snapshot().tier_of(old), Some(Tier::Episodic));

    let fresh = rt.observe("new", "", at(2 * 86_400));
    rt.beat().await.unwrap();

    let snap = rt.snapshot();
    assert!(snap.get(old).is_none());
    assert_eq!(snap.stats.expired, 1);
    assert_eq!(snap.tier_of(fresh), Some(Tier::Working));
}

#[tokio::test]
async fn dormant_episodic_particles_are_pruned() {
    let mut config = config();
    config.memory.working_capacity = 1;
    config.memory.episodic_decay_rate = 0.6;
    config.memory.prune_epsilon = 0.5;
    config.memory.prune_grace_cycles = 1;
    let rt = CognitiveRuntime::builder(config).similarity(ExactKey).build().unwrap();
    let a = rt.observe("a", "", at(0));
    let b = rt.observe("b", "", at(0));
    rt.beat().await.unwrap();
    assert_eq!(rt.snapshot().tier_of(a), Some(Tier::Episodic));

    rt.run(Cycles::new(2)).await.unwrap();
    let snap = rt.snapshot();
    assert!(snap.get(a).is_none());
    assert_eq!(snap.stats.pruned, 1);
    assert_eq!(snap.tier_of(b), Some(Tier::Episodic));
}

// ============================================================
// Cross-session promotion
// ============================================================

async fn session_with(dir: &std::path::Path, config: &RuntimeConfig, start: i64) -> CognitiveRuntime {
    let rt = CognitiveRuntime::builder(config.clone())
        .similarity(ExactKey)
        .session_dir(dir)
        .build()
        .unwrap();
    rt.observe("x", "", at(start));
    rt.run(Cycles::new(2)).await.unwrap();
    rt
}

#[tokio::test]
async fn semantic_promotion_needs_prior_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.memory.semantic_promotion_count = 2;

    let first = session_with(dir.path(), &config, 0).await;
    let snap = first.snapshot();
    assert_eq!(snap.episodic.len(), 1);
    assert!(snap.semantic.is_empty());
    assert_eq!(snap.stats.promotion_conflicts, 1);
    first.close().await.unwrap();

    let second = session_with(dir.path(), &config, 100).await;
    let snap = second.snapshot();
    assert!(snap.semantic.is_empty(), "one prior session is not enough");
    assert_eq!(snap.by_key("x").len(), 1);
    assert_ne!(snap.tier_of(snap.by_key("x")[0].id), Some(Tier::Semantic));
    second.close().await.unwrap();

    let third = session_with(dir.path(), &config, 200).await;
    let snap = third.snapshot();
    assert_eq!(snap.semantic.len(), 1);
    assert_eq!(snap.semantic[0].key.as_str(), "x");
    assert!(snap.episodic.iter().all(|p| p.key.as_str() != "x"));
    let history = third.history().len();
    third.close().await.unwrap();
    assert_eq!(history, 2);
}

#[tokio::test]
async fn seeding_alone_never_reaches_semantic() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.memory.semantic_promotion_count = 2;

    let first = session_with(dir.path(), &config, 0).await;
    let x = first.snapshot().by_key("x")[0].id;
    first.close().await.unwrap();

    for session in 2..=4 {
        let rt = CognitiveRuntime::builder(config.clone())
            .similarity(ExactKey)
            .session_dir(dir.path())
            .build()
            .unwrap();
        rt.run(Cycles::new(2)).await.unwrap();
        let snap = rt.snapshot();
        assert!(snap.semantic.is_empty(), "session {} promoted an unobserved key", session);
        assert_eq!(snap.by_key("x").len(), 1);
        assert_eq!(snap.by_key("x")[0].id, x);
        assert_eq!(snap.stats.promotion_conflicts, 0);
        rt.close().await.unwrap();
    }
}

#[tokio::test]
async fn corrupt_session_file_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let first = session_with(dir.path(), &config(), 0).await;
    first.close().await.unwrap();

    let path = dir.path().join("session.json");
    let saved = std::fs::read_to_string(&path).unwrap();
    let truncated = &saved[..saved.len() / 2];
    std::fs::write(&path, truncated).unwrap();

    let err = CognitiveRuntime::builder(config())
        .similarity(ExactKey)
        .session_dir(dir.path())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)), "{}", err);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), truncated);
}

#[tokio::test]
async fn continuity_keeps_ids_unique_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let first = session_with(dir.path(), &config(), 0).await;
    let old = first.snapshot().by_key("x")[0].id;
    first.close().await.unwrap();

    let second = CognitiveRuntime::builder(config())
        .similarity(ExactKey)
        .session_dir(dir.path())
        .build()
        .unwrap();
    let fresh = second.observe("y", "", at(50));
    assert!(fresh > old);
    second.run(Cycles::new(1)).await.unwrap();
    let snap = second.snapshot();
    assert_eq!(snap.get(fresh).map(|p| p.key.as_str()), Some("y"));
    assert!(snap.get(old).is_some());
}

// ============================================================
// Replanning
// ============================================================

/// Records what Reasoning saw on every cycle.
struct Recording {
    seen: Arc<Mutex<Vec<(u64, bool, bool)>>>,
}

#[async_trait::async_trait]
impl Reasoning for Recording {
    async fn reason(
        &self,
        ctx: &mut StageContext<'_>,
        perception: &PerceptionReport,
        previous: Option<&Plan>,
    ) -> Result<ReasoningReport> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((ctx.cycle(), ctx.is_replan(), previous.is_none()));
        }
        DefaultReasoning::default().reason(ctx, perception, previous).await
    }
}

#[tokio::test]
async fn reasoning_replans_every_planning_interval() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let rt = CognitiveRuntime::builder(config())
        .reasoning(Recording { seen: seen.clone() })
        .build()
        .unwrap();
    rt.observe("morning light", "", at(0));
    let summary = rt.run(Cycles::new(6)).await.unwrap();
    assert_eq!(summary.committed, 6);

    let seen = seen.lock().unwrap().clone();
    let replans: Vec<u64> = seen.iter().filter(|(_, replan, _)| *replan).map(|(c, _, _)| *c).collect();
    assert_eq!(replans, vec![3, 6]);
    let fresh: Vec<u64> = seen.iter().filter(|(_, _, none)| *none).map(|(c, _, _)| *c).collect();
    assert_eq!(fresh, vec![1, 3, 6]);

    let snap = rt.snapshot();
    assert_eq!(snap.stats.replans, 2);
    assert!(snap.replanned);
    assert_eq!(snap.plan.as_ref().map(|p| p.rebuilt_at), Some(6));
}

// ============================================================
// Replay
// ============================================================

async fn replay(script: &[(&str, i64)]) -> String {
    let rt = CognitiveRuntime::builder(config()).similarity(TokenJaccard).build().unwrap();
    for (i, (key, ts)) in script.iter().enumerate() {
        rt.observe(*key, "", at(*ts));
        if i % 2 == 1 {
            rt.beat().await.unwrap();
        }
    }
    rt.run(Cycles::new(4)).await.unwrap();
    serde_json::to_string(&*rt.snapshot()).unwrap()
}

#[tokio::test]
async fn identical_input_replays_identically() {
    let script = [
        ("weather rain", 0),
        ("weather sun", 1),
        ("weather wind", 2),
        ("user greeting", 3),
        ("weather rain", 4),
        ("user farewell", 5),
        ("user greeting", 6),
        ("weather sun", 7),
    ];
    let first = replay(&script).await;
    let second = replay(&script).await;
    assert_eq!(first, second);

    let snapshot: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(snapshot["cycle"], 8);
    assert!(!snapshot["basins"].as_array().unwrap().is_empty());
}
