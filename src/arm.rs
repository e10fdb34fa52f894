//! A single arm of the hierarchical bandit: one CIDR prefix with Bayesian
//! posteriors for success rate (Beta) and latency (Normal–Gamma).
//!
//! Arms are owned by the [`ArmTree`](crate::ArmTree) map and refer to each
//! other by prefix key (`parent` / `children`), never by pointer, so the tree
//! stays cycle-free. All mutable state sits behind a per-arm `RwLock`;
//! updates are exclusive, snapshots are shared.

use ipnet::IpNet;
use parking_lot::RwLock;

/// Bandit arm for one prefix.
///
/// Priors: Beta `(1, 1)` (uniform success rate) and Normal–Gamma
/// `(μ=0, λ=0.001, α=1, β=1)` (weakly informative latency).
#[derive(Debug)]
pub struct Arm {
    prefix: IpNet,
    state: RwLock<ArmState>,
}

#[derive(Debug)]
struct ArmState {
    parent: Option<IpNet>,
    children: Vec<IpNet>,

    // Beta posterior for success probability.
    alpha: f64,
    beta: f64,

    // Normal–Gamma posterior for latency mean and precision.
    mu: f64,
    lambda: f64,
    alpha_ng: f64,
    beta_ng: f64,

    samples: u64,
    successes: u64,
    failures: u64,
    sum_latency: f64,
    // Welford accumulator over successful probes only.
    sum_sq_diff: f64,

    is_split: bool,
}

/// Point-in-time snapshot of an arm's statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmStats {
    pub prefix: IpNet,
    pub samples: u64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency: f64,
    pub var_latency: f64,
    pub sum_latency: f64,
    pub success_rate: f64,
    pub is_split: bool,
}

/// Posterior parameters handed to the Thompson sampler.
#[derive(Debug, Clone, Copy)]
pub struct Posterior {
    pub alpha: f64,
    pub beta: f64,
    pub mu: f64,
    pub lambda: f64,
    pub alpha_ng: f64,
    pub beta_ng: f64,
}

impl Arm {
    /// Create an arm with uninformative priors. `prefix` is canonicalized.
    pub fn new(prefix: IpNet, parent: Option<IpNet>) -> Self {
        Self {
            prefix: prefix.trunc(),
            state: RwLock::new(ArmState {
                parent,
                children: Vec::new(),
                alpha: 1.0,
                beta: 1.0,
                mu: 0.0,
                lambda: 0.001,
                alpha_ng: 1.0,
                beta_ng: 1.0,
                samples: 0,
                successes: 0,
                failures: 0,
                sum_latency: 0.0,
                sum_sq_diff: 0.0,
                is_split: false,
            }),
        }
    }

    /// The prefix this arm covers.
    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    /// Fold one probe result into the posterior.
    ///
    /// `latency_ms` is only meaningful when `success` is true. Failures apply
    /// a weak pessimistic latency update (`2 × timeout` at half weight) so
    /// persistently failing prefixes drift toward bad scores without a single
    /// timeout dominating the posterior. Variance state is only touched from
    /// the second success onward.
    pub fn update(&self, success: bool, latency_ms: f64, timeout_ms: f64) {
        let mut s = self.state.write();
        s.samples += 1;

        if success {
            s.successes += 1;
            s.alpha += 1.0;

            let old_mu = s.mu;
            let old_lambda = s.lambda;
            s.lambda = old_lambda + 1.0;
            s.mu = (old_lambda * old_mu + latency_ms) / s.lambda;

            s.sum_latency += latency_ms;
            if s.successes > 1 {
                // Welford with the precision-weighting adjustment factor.
                let delta = latency_ms - old_mu;
                let adj = delta * (latency_ms - s.mu) * old_lambda / s.lambda;
                s.sum_sq_diff += adj;
                s.alpha_ng += 0.5;
                s.beta_ng += 0.5 * adj;
            }
        } else {
            s.failures += 1;
            s.beta += 1.0;

            let penalty = timeout_ms * 2.0;
            let weight = 0.5;
            let old_mu = s.mu;
            let old_lambda = s.lambda;
            s.lambda = old_lambda + weight;
            s.mu = (old_lambda * old_mu + weight * penalty) / s.lambda;
        }
    }

    /// Snapshot the arm's statistics.
    pub fn stats(&self) -> ArmStats {
        let s = self.state.read();
        let var_latency = if s.successes > 1 {
            s.sum_sq_diff / (s.successes - 1) as f64
        } else {
            0.0
        };
        ArmStats {
            prefix: self.prefix,
            samples: s.samples,
            successes: s.successes,
            failures: s.failures,
            mean_latency: s.mu,
            var_latency,
            sum_latency: s.sum_latency,
            success_rate: s.alpha / (s.alpha + s.beta),
            is_split: s.is_split,
        }
    }

    /// Posterior parameters for Thompson sampling.
    pub fn posterior(&self) -> Posterior {
        let s = self.state.read();
        Posterior {
            alpha: s.alpha,
            beta: s.beta,
            mu: s.mu,
            lambda: s.lambda,
            alpha_ng: s.alpha_ng,
            beta_ng: s.beta_ng,
        }
    }

    /// Whether this arm may be split: a leaf with enough samples that has not
    /// yet reached its family's drill-down limit.
    pub fn can_split(&self, min_samples: u64, max_bits_v4: u8, max_bits_v6: u8) -> bool {
        let s = self.state.read();
        if s.is_split || s.samples < min_samples {
            return false;
        }
        let max = match self.prefix {
            IpNet::V4(_) => max_bits_v4,
            IpNet::V6(_) => max_bits_v6,
        };
        self.prefix.prefix_len() < max
    }

    /// Estimated information gain from splitting this arm: combined posterior
    /// uncertainty, weighted by `ln(samples + 1)`. Unsampled arms are
    /// infinitely interesting.
    pub fn information_gain(&self) -> f64 {
        let s = self.state.read();
        if s.samples == 0 {
            return f64::INFINITY;
        }
        let ab = s.alpha + s.beta;
        let success_variance = (s.alpha * s.beta) / (ab * ab * (ab + 1.0));
        let latency_uncertainty = 1.0 / (s.lambda + 1.0);
        let sample_weight = ((s.samples as f64) + 1.0).ln();
        (success_variance + latency_uncertainty) * sample_weight
    }

    /// Mark this arm as split. Split arms are no longer leaves and stop
    /// receiving new samples; children take over.
    pub fn mark_split(&self) {
        self.state.write().is_split = true;
    }

    /// Whether this arm has been split.
    pub fn is_split(&self) -> bool {
        self.state.read().is_split
    }

    /// Register a child prefix.
    pub fn add_child(&self, child: IpNet) {
        self.state.write().children.push(child);
    }

    /// Child prefix keys (empty until split).
    pub fn children(&self) -> Vec<IpNet> {
        self.state.read().children.clone()
    }

    /// Parent prefix key, if any.
    pub fn parent(&self) -> Option<IpNet> {
        self.state.read().parent
    }
}
