//! Basin tracker
//!
//! Clusters the active particles once per cycle with union-find over the
//! resonance graph, keeping only edges at or above the similarity threshold,
//! then diffs the clusters against last cycle's basins. Every change is one
//! whole-cycle transition; nothing is interpolated.

use std::collections::{BTreeMap, BTreeSet};
use thoughtclaw_core::config::BasinConfig;
use thoughtclaw_core::{
    Basin, BasinId, BasinTransition, ContentKey, IdAllocator, Particle, ParticleId, TransitionKind,
};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BasinTracker {
    config: BasinConfig,
    ids: IdAllocator,
    basins: BTreeMap<BasinId, Basin>,
}

struct Cluster {
    members: BTreeSet<ParticleId>,
    cumulative: f64,
    centroid: ParticleId,
    centroid_key: ContentKey,
}

impl BasinTracker {
    pub fn new(config: BasinConfig, ids: IdAllocator) -> Self {
        Self {
            config,
            ids,
            basins: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BasinConfig {
        &self.config
    }

    pub fn basins(&self) -> impl Iterator<Item = &Basin> {
        self.basins.values()
    }

    pub fn len(&self) -> usize {
        self.basins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.basins.is_empty()
    }

    pub fn get(&self, id: BasinId) -> Option<&Basin> {
        self.basins.get(&id)
    }

    pub fn basin_of(&self, particle: ParticleId) -> Option<BasinId> {
        self.basins
            .values()
            .find(|b| b.members.contains(&particle))
            .map(|b| b.id)
    }

    /// Reload basins recorded by an earlier session.
    pub fn restore(&mut self, basins: Vec<Basin>) {
        for basin in basins {
            self.ids.advance_to(basin.id.0 + 1);
            self.basins.insert(basin.id, basin);
        }
    }

    pub fn update(&mut self, active: &[&Particle], cycle: u64) -> Vec<BasinTransition> {
        let clusters = self.cluster(active);
        let mut transitions = Vec::new();

        // Each prior basin follows the cluster holding most of its members.
        let mut predecessors: Vec<Vec<BasinId>> = vec![Vec::new(); clusters.len()];
        let mut vanished = Vec::new();
        for basin in self.basins.values() {
            let successor = clusters
                .iter()
                .enumerate()
                .map(|(i, c)| (i, c.members.intersection(&basin.members).count()))
                .filter(|(_, overlap)| *overlap > 0)
                .fold(None, |best: Option<(usize, usize)>, (i, overlap)| match best {
                    Some((_, top)) if top >= overlap => best,
                    _ => Some((i, overlap)),
                });
            match successor {
                Some((i, _)) => predecessors[i].push(basin.id),
                None => vanished.push(basin.id),
            }
        }

        let previous = std::mem::take(&mut self.basins);
        for id in vanished {
            if let Some(basin) = previous.get(&id) {
                transitions.push(dissolved(basin, cycle));
            }
        }

        for (cluster, preds) in clusters.into_iter().zip(predecessors) {
            match preds.as_slice() {
                [] => {
                    if self.can_form(&cluster, &previous) {
                        let basin = self.open(cluster, cycle, cycle);
                        transitions.push(transition(TransitionKind::Formed, Vec::new(), &basin, cycle));
                        self.basins.insert(basin.id, basin);
                    }
                }
                [single] => {
                    let Some(prior) = previous.get(single) else { continue };
                    if cluster.cumulative < self.config.dissolution_floor
                        || cluster.members.len() < self.config.min_members
                    {
                        transitions.push(dissolved(prior, cycle));
                    } else if membership_change(&prior.members, &cluster.members) > 0.5 {
                        let basin = self.open(cluster, cycle, cycle);
                        transitions.push(transition(TransitionKind::Shifted, vec![prior.id], &basin, cycle));
                        self.basins.insert(basin.id, basin);
                    } else {
                        let mut basin = prior.clone();
                        basin.members = cluster.members;
                        basin.cumulative_activation = cluster.cumulative;
                        self.basins.insert(basin.id, basin);
                    }
                }
                merged => {
                    let formed = merged
                        .iter()
                        .filter_map(|id| previous.get(id))
                        .map(|b| b.formed_cycle)
                        .min()
                        .unwrap_or(cycle);
                    let basin = self.open(cluster, formed, cycle);
                    transitions.push(transition(TransitionKind::Merged, merged.to_vec(), &basin, cycle));
                    self.basins.insert(basin.id, basin);
                }
            }
        }

        for t in &transitions {
            info!(
                "Basin {} at cycle {}: {:?} -> {:?} ({} members, activation {:.3})",
                t.kind,
                cycle,
                t.before,
                t.after,
                t.members.len(),
                t.cumulative_activation
            );
        }
        transitions
    }

    /// Connected components over edges at or above the similarity threshold,
    /// ordered by their lowest member id.
    fn cluster(&self, active: &[&Particle]) -> Vec<Cluster> {
        let index: BTreeMap<ParticleId, usize> =
            active.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
        let mut sets = UnionFind::new(active.len());
        for (i, particle) in active.iter().enumerate() {
            for (target, weight) in &particle.resonance {
                if *weight < self.config.similarity_threshold {
                    continue;
                }
                if let Some(&j) = index.get(target) {
                    sets.union(i, j);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<&Particle>> = BTreeMap::new();
        for (i, particle) in active.iter().enumerate() {
            groups.entry(sets.find(i)).or_default().push(particle);
        }

        let mut clusters: Vec<Cluster> = groups
            .into_values()
            .filter_map(|members| {
                let centroid = members.iter().fold(None, |best: Option<&&Particle>, p| match best {
                    Some(b)
                        if b.activation() > p.activation()
                            || (b.activation() == p.activation() && b.id < p.id) =>
                    {
                        best
                    }
                    _ => Some(p),
                })?;
                Some(Cluster {
                    centroid: centroid.id,
                    centroid_key: centroid.key.clone(),
                    cumulative: members.iter().map(|p| p.activation()).sum(),
                    members: members.iter().map(|p| p.id).collect(),
                })
            })
            .collect();
        clusters.sort_by_key(|c| c.members.iter().next().copied());
        clusters
    }

    /// A cluster with no predecessor forms a basin once it is dense enough.
    /// A fragment split off a prior basin forms in the same cycle as the split.
    fn can_form(&self, cluster: &Cluster, previous: &BTreeMap<BasinId, Basin>) -> bool {
        if cluster.members.len() < self.config.min_members
            || cluster.cumulative < self.config.basin_formation_threshold
        {
            return false;
        }
        if let Some(origin) = previous.values().find(|b| !b.members.is_disjoint(&cluster.members)) {
            debug!("Cluster around {} split off basin {}", cluster.centroid, origin.id);
        }
        true
    }

    fn open(&self, cluster: Cluster, formed_cycle: u64, cycle: u64) -> Basin {
        Basin {
            id: BasinId(self.ids.next()),
            centroid: cluster.centroid,
            centroid_key: cluster.centroid_key,
            members: cluster.members,
            cumulative_activation: cluster.cumulative,
            formed_cycle,
            last_transition_cycle: cycle,
        }
    }
}

/// Share of the combined membership that changed hands.
fn membership_change(before: &BTreeSet<ParticleId>, after: &BTreeSet<ParticleId>) -> f64 {
    let union = before.union(after).count();
    if union == 0 {
        return 0.0;
    }
    let kept = before.intersection(after).count();
    1.0 - kept as f64 / union as f64
}

fn transition(kind: TransitionKind, before: Vec<BasinId>, basin: &Basin, cycle: u64) -> BasinTransition {
    BasinTransition {
        kind,
        before,
        after: Some(basin.id),
        cycle,
        members: basin.members.iter().copied().collect(),
        cumulative_activation: basin.cumulative_activation,
    }
}

fn dissolved(basin: &Basin, cycle: u64) -> BasinTransition {
    BasinTransition {
        kind: TransitionKind::Dissolved,
        before: vec![basin.id],
        after: None,
        cycle,
        members: basin.members.iter().copied().collect(),
        cumulative_activation: basin.cumulative_activation,
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}
