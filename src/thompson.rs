//! Thompson sampling over arm posteriors.
//!
//! Each sampler owns a seeded `StdRng` behind a mutex, so all draws made on
//! behalf of one search head are serialized: same seed + same call sequence →
//! same scores. This is the same reproducibility discipline as the rest of
//! the crate's stochastic components — deterministic given the seed.
//!
//! Scores are in milliseconds and **lower is better**: a sampled latency plus
//! a failure penalty proportional to the probe timeout.

use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::arm::Arm;
use crate::net::random_addr_in;

/// Failed probes count as this many timeouts in the combined score.
const FAILURE_PENALTY: f64 = 2.0;

/// Seedable posterior sampler for one search head.
#[derive(Debug)]
pub struct ThompsonSampler {
    rng: Mutex<StdRng>,
    timeout_ms: f64,
}

impl ThompsonSampler {
    /// Create a sampler with a fixed seed (reproducible).
    pub fn new(seed: u64, timeout_ms: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            timeout_ms,
        }
    }

    /// Sample a combined score from the arm's posterior (lower is better).
    ///
    /// Arms with fewer than 3 samples get an optimistic uniform score in
    /// `[0, 0.5 × timeout)` instead of a posterior draw, so unexplored
    /// regions always have a chance to be picked.
    pub fn sample_score(&self, arm: &Arm) -> f64 {
        let post = arm.posterior();
        let stats = arm.stats();

        let mut rng = self.rng.lock();

        if stats.samples < 3 {
            return rng.random::<f64>() * self.timeout_ms * 0.5;
        }

        let success_rate = sample_beta(&mut rng, post.alpha, post.beta);

        let mut precision = sample_gamma(&mut rng, post.alpha_ng, post.beta_ng);
        if precision <= 0.0 {
            precision = 0.001;
        }

        let mut variance = 1.0 / (post.lambda * precision);
        if variance <= 0.0 {
            variance = self.timeout_ms * self.timeout_ms;
        }

        // Exploration bonus: inflate variance while the arm is young.
        if stats.samples < 10 {
            let exploration = (10 - stats.samples) as f64 / 10.0;
            variance *= 1.0 + exploration * 2.0;
        }

        let latency = sample_normal(&mut rng, post.mu, variance.sqrt()).max(1.0);

        let failure_rate = 1.0 - success_rate;
        latency + failure_rate * self.timeout_ms * FAILURE_PENALTY
    }

    /// Draw a uniform random address inside `prefix`.
    pub fn sample_ip(&self, prefix: IpNet) -> IpAddr {
        let mut rng = self.rng.lock();
        random_addr_in(prefix, &mut *rng)
    }

    /// Uniform draw in `[0, 1)`.
    pub fn sample_uniform(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}

/// `Beta(a, b)` via the gamma ratio: `Γ(a,1) / (Γ(a,1) + Γ(b,1))`.
fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
    let alpha = if alpha > 0.0 { alpha } else { 1.0 };
    let beta = if beta > 0.0 { beta } else { 1.0 };

    let x = sample_gamma(rng, alpha, 1.0);
    let y = sample_gamma(rng, beta, 1.0);
    if x + y == 0.0 {
        return 0.5;
    }
    x / (x + y)
}

/// `Gamma(alpha, beta)` via Marsaglia–Tsang squeeze, with the Johnk boost
/// `Γ(a) = Γ(a + 1) · U^(1/a)` for shape < 1.
fn sample_gamma(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
    let alpha = if alpha > 0.0 { alpha } else { 1.0 };
    let beta = if beta > 0.0 { beta } else { 1.0 };

    if alpha < 1.0 {
        let u: f64 = rng.random();
        return sample_gamma(rng, alpha + 1.0, beta) * u.powf(1.0 / alpha);
    }

    let d = alpha - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        let mut x: f64;
        let mut v: f64;
        loop {
            x = rng.sample(StandardNormal);
            v = 1.0 + c * x;
            if v > 0.0 {
                break;
            }
        }

        v = v * v * v;
        let u: f64 = rng.random();

        if u < 1.0 - 0.0331 * (x * x) * (x * x) {
            return d * v / beta;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v / beta;
        }
    }
}

/// `Normal(mu, sigma)`.
fn sample_normal(rng: &mut StdRng, mu: f64, sigma: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mu + sigma * z
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn same_seed_same_draws() {
        let a = ThompsonSampler::new(42, 3000.0);
        let b = ThompsonSampler::new(42, 3000.0);
        let arm = Arm::new(net("10.0.0.0/24"), None);
        for _ in 0..5 {
            arm.update(true, 25.0, 3000.0);
        }
        for _ in 0..10 {
            assert_eq!(a.sample_score(&arm), b.sample_score(&arm));
        }
        for _ in 0..10 {
            assert_eq!(a.sample_ip(net("1.1.0.0/16")), b.sample_ip(net("1.1.0.0/16")));
        }
    }

    #[test]
    fn young_arms_get_optimistic_scores() {
        let s = ThompsonSampler::new(1, 3000.0);
        let arm = Arm::new(net("10.0.0.0/24"), None);
        arm.update(true, 2999.0, 3000.0);
        for _ in 0..50 {
            let score = s.sample_score(&arm);
            assert!(
                (0.0..1500.0).contains(&score),
                "optimistic score {score} out of range"
            );
        }
    }

    #[test]
    fn scores_separate_fast_from_slow_arms() {
        let s = ThompsonSampler::new(9, 3000.0);
        let fast = Arm::new(net("10.0.0.0/24"), None);
        let slow = Arm::new(net("10.0.1.0/24"), None);
        for _ in 0..40 {
            fast.update(true, 10.0, 3000.0);
            slow.update(true, 900.0, 3000.0);
        }
        let mut fast_wins = 0;
        for _ in 0..100 {
            if s.sample_score(&fast) < s.sample_score(&slow) {
                fast_wins += 1;
            }
        }
        assert!(fast_wins > 90, "fast arm only won {fast_wins}/100");
    }

    #[test]
    fn failing_arms_score_worse_than_healthy_ones() {
        let s = ThompsonSampler::new(3, 3000.0);
        let healthy = Arm::new(net("10.0.0.0/24"), None);
        let failing = Arm::new(net("10.0.1.0/24"), None);
        for _ in 0..30 {
            healthy.update(true, 50.0, 3000.0);
            failing.update(false, 0.0, 3000.0);
        }
        let mut healthy_wins = 0;
        for _ in 0..100 {
            if s.sample_score(&healthy) < s.sample_score(&failing) {
                healthy_wins += 1;
            }
        }
        assert!(healthy_wins > 90, "healthy arm only won {healthy_wins}/100");
    }

    #[test]
    fn gamma_sampler_is_positive_and_roughly_centered() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut sum = 0.0;
        let n = 4000;
        for _ in 0..n {
            let g = sample_gamma(&mut rng, 4.0, 2.0);
            assert!(g > 0.0);
            sum += g;
        }
        let mean = sum / n as f64;
        // E[Gamma(shape 4, rate 2)] = 2.
        assert!((mean - 2.0).abs() < 0.15, "mean {mean}");
    }

    #[test]
    fn beta_sampler_stays_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..2000 {
            let b = sample_beta(&mut rng, 0.5, 2.5);
            assert!((0.0..=1.0).contains(&b));
        }
    }

    #[test]
    fn sample_uniform_is_half_open() {
        let s = ThompsonSampler::new(5, 3000.0);
        for _ in 0..1000 {
            let u = s.sample_uniform();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
