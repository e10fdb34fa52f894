//! Parallel search heads with diversity preservation.
//!
//! Each head is an independent explorer: it owns a seedable Thompson sampler
//! (seed derived from the base seed so heads never share a draw sequence), a
//! current focus prefix, and a short history of recent focuses. The manager
//! scores candidate leaves per head and applies a repulsion penalty against
//! the other heads' focuses, so heads spread out instead of piling onto the
//! same hot region.

use std::collections::VecDeque;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::net::prefix_distance;
use crate::thompson::ThompsonSampler;
use crate::tree::ArmTree;

/// Seed stride between heads; any odd constant works, this one is prime.
const HEAD_SEED_STRIDE: u64 = 9973;

/// Configuration for the head manager.
#[derive(Debug, Clone, Copy)]
pub struct HeadConfig {
    /// Number of parallel search heads.
    pub heads: usize,
    /// Probe timeout in milliseconds (score normalization).
    pub timeout_ms: f64,
    /// Base RNG seed; head `i` uses `base_seed + i × 9973`.
    pub base_seed: u64,
    /// Focus history capacity per head.
    pub history: usize,
    /// Weight of the inter-head repulsion penalty, in `[0, 1]`.
    pub diversity_weight: f64,
    /// Decay of repulsion with prefix distance, in `[0, 1)`.
    pub repulsion_decay: f64,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            heads: 4,
            timeout_ms: 3000.0,
            base_seed: 0,
            history: 32,
            diversity_weight: 0.3,
            repulsion_decay: 0.5,
        }
    }
}

/// One search head.
#[derive(Debug)]
pub struct SearchHead {
    id: usize,
    sampler: ThompsonSampler,
    state: RwLock<HeadState>,
}

#[derive(Debug)]
struct HeadState {
    focus: Option<IpNet>,
    history: VecDeque<IpNet>,
    capacity: usize,
}

impl SearchHead {
    fn new(id: usize, seed: u64, timeout_ms: f64, history: usize) -> Self {
        Self {
            id,
            sampler: ThompsonSampler::new(seed, timeout_ms),
            state: RwLock::new(HeadState {
                focus: None,
                history: VecDeque::with_capacity(history),
                capacity: history.max(1),
            }),
        }
    }

    /// Head index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// This head's sampler (draws are serialized internally).
    pub fn sampler(&self) -> &ThompsonSampler {
        &self.sampler
    }

    /// The prefix this head most recently selected.
    pub fn focus(&self) -> Option<IpNet> {
        self.state.read().focus
    }

    /// Recent focuses, oldest first.
    pub fn history(&self) -> Vec<IpNet> {
        self.state.read().history.iter().copied().collect()
    }

    fn set_focus(&self, prefix: IpNet) {
        let mut s = self.state.write();
        s.focus = Some(prefix);
        if s.history.len() == s.capacity {
            s.history.pop_front();
        }
        s.history.push_back(prefix);
    }
}

/// Owns the heads and applies diversity-aware selection.
#[derive(Debug)]
pub struct HeadManager {
    heads: Vec<SearchHead>,
    diversity_weight: f64,
    repulsion_decay: f64,
}

impl HeadManager {
    /// Create `cfg.heads` heads with derived seeds.
    pub fn new(cfg: HeadConfig) -> Self {
        let heads = (0..cfg.heads)
            .map(|i| {
                let seed = cfg.base_seed.wrapping_add(i as u64 * HEAD_SEED_STRIDE);
                SearchHead::new(i, seed, cfg.timeout_ms, cfg.history)
            })
            .collect();
        Self {
            heads,
            diversity_weight: cfg.diversity_weight,
            repulsion_decay: cfg.repulsion_decay,
        }
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether there are no heads.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// The head at `idx`, wrapping around.
    pub fn head(&self, idx: usize) -> &SearchHead {
        &self.heads[idx % self.heads.len()]
    }

    /// Pick the next prefix for `head`: Thompson score × diversity penalty ×
    /// depth bonus over all current leaves, minimized. Updates the head's
    /// focus. Returns `None` when the tree has no leaves.
    pub fn select_next_prefix(&self, head: &SearchHead, tree: &ArmTree) -> Option<IpNet> {
        let candidates = tree.leaves();
        if candidates.is_empty() {
            return None;
        }
        let others = self.other_focuses(head.id);

        let mut best: Option<(f64, IpNet)> = None;
        for arm in &candidates {
            let combined = self.combined_score(head, arm.as_ref(), &others);
            match best {
                Some((b, _)) if b <= combined => {}
                _ => best = Some((combined, arm.prefix())),
            }
        }

        let (_, prefix) = best?;
        head.set_focus(prefix);
        Some(prefix)
    }

    /// Pick the `width` best prefixes for `head` under the same scoring.
    /// The head's focus is set to the best of the beam.
    pub fn select_beam(&self, head: &SearchHead, tree: &ArmTree, width: usize) -> Vec<IpNet> {
        let candidates = tree.leaves();
        if candidates.is_empty() || width == 0 {
            return Vec::new();
        }
        let others = self.other_focuses(head.id);

        let mut scored: Vec<(f64, IpNet)> = candidates
            .iter()
            .map(|arm| (self.combined_score(head, arm.as_ref(), &others), arm.prefix()))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(width);

        let beam: Vec<IpNet> = scored.into_iter().map(|(_, p)| p).collect();
        if let Some(&first) = beam.first() {
            head.set_focus(first);
        }
        beam
    }

    /// Re-spread the heads when they have converged: if the mean pairwise
    /// distance between focuses drops below 4 bits, each head is reassigned
    /// to an evenly spaced leaf.
    pub fn rebalance(&self, tree: &ArmTree) {
        let focuses: Vec<IpNet> = self.heads.iter().filter_map(|h| h.focus()).collect();
        if focuses.len() < 2 {
            return;
        }

        let mut total = 0u64;
        let mut pairs = 0u64;
        for i in 0..focuses.len() {
            for j in (i + 1)..focuses.len() {
                total += u64::from(prefix_distance(focuses[i], focuses[j]));
                pairs += 1;
            }
        }
        let avg = total as f64 / pairs as f64;
        if avg >= 4.0 {
            return;
        }

        let leaves = tree.leaves();
        if leaves.len() < self.heads.len() {
            return;
        }
        for (i, head) in self.heads.iter().enumerate() {
            let idx = i * leaves.len() / self.heads.len();
            head.set_focus(leaves[idx].prefix());
        }
    }

    /// Current focuses of all heads except `exclude`.
    fn other_focuses(&self, exclude: usize) -> Vec<IpNet> {
        self.heads
            .iter()
            .filter(|h| h.id != exclude)
            .filter_map(|h| h.focus())
            .collect()
    }

    fn combined_score(&self, head: &SearchHead, arm: &crate::arm::Arm, others: &[IpNet]) -> f64 {
        let ts = head.sampler.sample_score(arm);
        let penalty = self.diversity_penalty(arm.prefix(), others);
        let depth = depth_bonus(arm.prefix());
        ts * (1.0 + self.diversity_weight * penalty) * (1.0 - depth)
    }

    /// Mean repulsion from the other heads' focuses: 1 on an identical
    /// prefix, `decay^distance` otherwise.
    fn diversity_penalty(&self, prefix: IpNet, others: &[IpNet]) -> f64 {
        if others.is_empty() {
            return 0.0;
        }
        let total: f64 = others
            .iter()
            .map(|other| {
                let d = prefix_distance(prefix, *other);
                if d == 0 {
                    1.0
                } else {
                    self.repulsion_decay.powi(d as i32)
                }
            })
            .sum();
        total / others.len() as f64
    }
}

/// Multiplicative reward for finer prefixes, capped at 20%. Biases heads
/// toward drilled-down regions once splits have happened.
fn depth_bonus(prefix: IpNet) -> f64 {
    let bits = f64::from(prefix.prefix_len());
    let raw = match prefix {
        IpNet::V4(_) => (bits - 16.0) / 8.0 * 0.2,
        IpNet::V6(_) => (bits - 32.0) / 24.0 * 0.2,
    };
    raw.clamp(0.0, 0.2)
}
