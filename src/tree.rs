//! Hierarchical index of arms keyed by CIDR prefix, with dynamic splitting.
//!
//! The tree owns every arm through an ordered `prefix → Arc<Arm>` map; arms
//! refer to relatives by prefix key only. Structural changes (insertion,
//! splitting) take the tree's write lock; enumeration and lookup share it.
//! Per-arm posterior updates go through the arm's own lock and never touch
//! the tree lock.
//!
//! The map is ordered deliberately: `leaves()` feeds seeded samplers, and a
//! stable enumeration order is what makes two runs with the same seed draw
//! the same scores for the same prefixes.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::arm::Arm;
use crate::net::split_prefix;

/// Structural configuration for the arm tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Prefix bits added when splitting an IPv4 arm.
    pub split_step_v4: u8,
    /// Prefix bits added when splitting an IPv6 arm.
    pub split_step_v6: u8,
    /// Maximum IPv4 prefix length to drill down to.
    pub max_bits_v4: u8,
    /// Maximum IPv6 prefix length to drill down to.
    pub max_bits_v6: u8,
    /// Minimum samples on an arm before it may be split.
    pub min_samples_split: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            split_step_v4: 2,
            split_step_v6: 4,
            max_bits_v4: 24,
            max_bits_v6: 56,
            min_samples_split: 5,
        }
    }
}

#[derive(Debug, Default)]
struct TreeInner {
    roots: Vec<IpNet>,
    nodes: BTreeMap<IpNet, Arc<Arm>>,
}

/// Tree of bandit arms over the searched CIDR blocks.
#[derive(Debug)]
pub struct ArmTree {
    cfg: TreeConfig,
    inner: RwLock<TreeInner>,
}

impl ArmTree {
    /// Build a tree with one root arm per (masked, deduplicated) prefix.
    pub fn new(prefixes: &[IpNet], cfg: TreeConfig) -> Self {
        let mut inner = TreeInner::default();
        for p in prefixes {
            let p = p.trunc();
            if inner.nodes.contains_key(&p) {
                continue;
            }
            inner.roots.push(p);
            inner.nodes.insert(p, Arc::new(Arm::new(p, None)));
        }
        Self {
            cfg,
            inner: RwLock::new(inner),
        }
    }

    /// Look up the arm for a prefix.
    pub fn get(&self, prefix: IpNet) -> Option<Arc<Arm>> {
        self.inner.read().nodes.get(&prefix.trunc()).cloned()
    }

    /// Look up the arm for a prefix, creating (and linking) it if absent.
    pub fn get_or_create(&self, prefix: IpNet) -> Arc<Arm> {
        let prefix = prefix.trunc();
        if let Some(arm) = self.inner.read().nodes.get(&prefix) {
            return arm.clone();
        }

        let mut inner = self.inner.write();
        // Double-check: another thread may have inserted between the locks.
        if let Some(arm) = inner.nodes.get(&prefix) {
            return arm.clone();
        }

        let parent = find_parent(&inner, prefix);
        let arm = Arc::new(Arm::new(prefix, parent));
        inner.nodes.insert(prefix, arm.clone());

        match parent {
            Some(pp) => {
                if let Some(parent_arm) = inner.nodes.get(&pp) {
                    parent_arm.add_child(prefix);
                }
            }
            None => inner.roots.push(prefix),
        }
        arm
    }

    /// All arms that have not been split, in prefix order.
    pub fn leaves(&self) -> Vec<Arc<Arm>> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|a| !a.is_split())
            .cloned()
            .collect()
    }

    /// All arms, in prefix order.
    pub fn all(&self) -> Vec<Arc<Arm>> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Root prefixes in insertion order.
    pub fn roots(&self) -> Vec<IpNet> {
        self.inner.read().roots.clone()
    }

    /// Number of arms in the tree.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Whether the tree holds no arms.
    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Total samples recorded across all arms.
    pub fn total_samples(&self) -> u64 {
        self.inner
            .read()
            .nodes
            .values()
            .map(|a| a.stats().samples)
            .sum()
    }

    /// Split an arm into its child prefixes, creating any that do not exist
    /// yet. Returns the newly created children (possibly fewer than
    /// `2^step` when some were already present), or an empty vec when the
    /// arm is not splittable.
    pub fn split_node(&self, arm: &Arm) -> Vec<Arc<Arm>> {
        if !arm.can_split(
            self.cfg.min_samples_split,
            self.cfg.max_bits_v4,
            self.cfg.max_bits_v6,
        ) {
            return Vec::new();
        }

        let prefix = arm.prefix();
        let step = match prefix {
            IpNet::V4(_) => self.cfg.split_step_v4,
            IpNet::V6(_) => self.cfg.split_step_v6,
        };
        let Ok(children) = split_prefix(prefix, step) else {
            return Vec::new();
        };
        if children.is_empty() {
            return Vec::new();
        }

        let mut inner = self.inner.write();
        // Re-check under the lock: a concurrent pass may have split it.
        if arm.is_split() {
            return Vec::new();
        }

        let mut created = Vec::with_capacity(children.len());
        for child in children {
            if inner.nodes.contains_key(&child) {
                continue;
            }
            let child_arm = Arc::new(Arm::new(child, Some(prefix)));
            inner.nodes.insert(child, child_arm.clone());
            arm.add_child(child);
            created.push(child_arm);
        }
        arm.mark_split();
        created
    }

    /// Splittable leaves ranked best-first for drilling down.
    ///
    /// Priority (lower = better) rewards low latency, high success rate, and
    /// high posterior uncertainty. Arms with no successes use a flat 10 000 ms
    /// latency sentinel so they rank behind anything that has worked.
    pub fn split_candidates(&self, limit: usize) -> Vec<Arc<Arm>> {
        let mut candidates: Vec<(f64, Arc<Arm>)> = Vec::new();
        for arm in self.leaves() {
            if !arm.can_split(
                self.cfg.min_samples_split,
                self.cfg.max_bits_v4,
                self.cfg.max_bits_v6,
            ) {
                continue;
            }
            let stats = arm.stats();
            let latency_score = if stats.successes == 0 {
                10_000.0
            } else {
                stats.mean_latency
            };
            let success_bonus = stats.success_rate * 500.0;
            let uncertainty_bonus = arm.information_gain() * 50.0;
            let priority = latency_score - success_bonus - uncertainty_bonus;
            candidates.push((priority, arm));
        }

        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.prefix().cmp(&b.1.prefix()))
        });
        candidates.truncate(limit);
        candidates.into_iter().map(|(_, arm)| arm).collect()
    }

    /// Record one probe result against a prefix.
    pub fn update(&self, prefix: IpNet, success: bool, latency_ms: f64, timeout_ms: f64) {
        self.get_or_create(prefix).update(success, latency_ms, timeout_ms);
    }
}

/// Find the tightest arm strictly containing `target`. Call with the tree
/// lock held.
fn find_parent(inner: &TreeInner, target: IpNet) -> Option<IpNet> {
    let root = *inner.roots.iter().find(|r| {
        r.contains(&target) && r.prefix_len() < target.prefix_len()
    })?;

    let mut current = root;
    loop {
        let arm = inner.nodes.get(&current)?;
        let next = arm.children().into_iter().find(|c| {
            c.contains(&target) && c.prefix_len() < target.prefix_len()
        });
        match next {
            Some(c) => current = c,
            None => return Some(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn tree(roots: &[&str]) -> ArmTree {
        let prefixes: Vec<IpNet> = roots.iter().map(|s| s.parse().unwrap()).collect();
        ArmTree::new(&prefixes, TreeConfig::default())
    }

    #[test]
    fn duplicate_roots_collapse() {
        let t = tree(&["1.1.0.0/16", "1.1.9.9/16"]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.roots(), vec![net("1.1.0.0/16")]);
    }

    #[test]
    fn get_or_create_links_to_tightest_ancestor() {
        let t = tree(&["1.1.0.0/16"]);
        let mid = t.get_or_create(net("1.1.0.0/20"));
        assert_eq!(mid.parent(), Some(net("1.1.0.0/16")));

        let deep = t.get_or_create(net("1.1.0.0/24"));
        assert_eq!(deep.parent(), Some(net("1.1.0.0/20")));

        // The /20 should list the /24 as its child.
        assert!(mid.children().contains(&net("1.1.0.0/24")));
    }

    #[test]
    fn orphan_prefix_becomes_a_root() {
        let t = tree(&["1.1.0.0/16"]);
        t.get_or_create(net("9.9.0.0/16"));
        assert_eq!(t.roots().len(), 2);
    }

    #[test]
    fn split_creates_children_and_retires_the_leaf() {
        let t = tree(&["1.1.0.0/16"]);
        let root = t.get(net("1.1.0.0/16")).unwrap();
        for _ in 0..5 {
            root.update(true, 20.0, 3000.0);
        }

        let created = t.split_node(&root);
        assert_eq!(created.len(), 4);
        assert!(root.is_split());
        assert_eq!(t.len(), 5);

        let leaves = t.leaves();
        assert_eq!(leaves.len(), 4);
        assert!(leaves.iter().all(|l| l.prefix().prefix_len() == 18));

        // A second split attempt is a no-op.
        assert!(t.split_node(&root).is_empty());
    }

    #[test]
    fn split_respects_sample_gate() {
        let t = tree(&["1.1.0.0/16"]);
        let root = t.get(net("1.1.0.0/16")).unwrap();
        root.update(true, 20.0, 3000.0);
        assert!(t.split_node(&root).is_empty());
        assert!(!root.is_split());
    }

    #[test]
    fn split_skips_existing_children() {
        let t = tree(&["1.1.0.0/16"]);
        // Pre-create one of the four /18 children.
        t.get_or_create(net("1.1.64.0/18"));
        let root = t.get(net("1.1.0.0/16")).unwrap();
        for _ in 0..5 {
            root.update(true, 20.0, 3000.0);
        }
        let created = t.split_node(&root);
        assert_eq!(created.len(), 3);
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn split_candidates_rank_fast_arms_first() {
        let t = tree(&["1.1.0.0/16", "2.2.0.0/16", "3.3.0.0/16"]);
        let fast = t.get(net("1.1.0.0/16")).unwrap();
        let slow = t.get(net("2.2.0.0/16")).unwrap();
        let dead = t.get(net("3.3.0.0/16")).unwrap();
        for _ in 0..10 {
            fast.update(true, 10.0, 3000.0);
            slow.update(true, 800.0, 3000.0);
            dead.update(false, 0.0, 3000.0);
        }

        let ranked = t.split_candidates(3);
        assert_eq!(ranked[0].prefix(), net("1.1.0.0/16"));
        assert_eq!(ranked[1].prefix(), net("2.2.0.0/16"));
        assert_eq!(ranked[2].prefix(), net("3.3.0.0/16"));

        let top_two = t.split_candidates(2);
        assert_eq!(top_two.len(), 2);
    }

    #[test]
    fn update_routes_through_get_or_create() {
        let t = tree(&["1.1.0.0/16"]);
        t.update(net("1.1.32.0/19"), true, 15.0, 3000.0);
        let arm = t.get(net("1.1.32.0/19")).unwrap();
        assert_eq!(arm.stats().samples, 1);
        assert_eq!(arm.parent(), Some(net("1.1.0.0/16")));
        assert_eq!(t.total_samples(), 1);
    }
}
