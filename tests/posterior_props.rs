//! Property tests for the arm posterior.
//!
//! These enforce the arm's documented invariants under arbitrary update
//! sequences:
//!
//! 1. `samples = successes + failures`, `α ≥ 1`, `β ≥ 1`, `λ > 0`,
//!    `α_ng ≥ 1`, `β_ng > 0` at all times.
//! 2. The Bayesian posterior matches an independent reference implementation
//!    of the update equations to within 1e-9.
//! 3. The first success moves the mean but not the variance state.

use ipscout::Arm;
use proptest::prelude::*;

fn net(s: &str) -> ipnet::IpNet {
    s.parse().unwrap()
}

/// Straight-line reference implementation of the posterior update, kept
/// deliberately separate from the crate's locking and snapshotting.
#[derive(Debug, Clone)]
struct Reference {
    alpha: f64,
    beta: f64,
    mu: f64,
    lambda: f64,
    alpha_ng: f64,
    beta_ng: f64,
    samples: u64,
    successes: u64,
    failures: u64,
    sum_sq_diff: f64,
}

impl Reference {
    fn new() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            mu: 0.0,
            lambda: 0.001,
            alpha_ng: 1.0,
            beta_ng: 1.0,
            samples: 0,
            successes: 0,
            failures: 0,
            sum_sq_diff: 0.0,
        }
    }

    fn update(&mut self, success: bool, x: f64, timeout_ms: f64) {
        self.samples += 1;
        if success {
            self.successes += 1;
            self.alpha += 1.0;
            let old_mu = self.mu;
            let old_lambda = self.lambda;
            self.lambda = old_lambda + 1.0;
            self.mu = (old_lambda * old_mu + x) / self.lambda;
            if self.successes > 1 {
                let adj = (x - old_mu) * (x - self.mu) * old_lambda / self.lambda;
                self.sum_sq_diff += adj;
                self.alpha_ng += 0.5;
                self.beta_ng += 0.5 * adj;
            }
        } else {
            self.failures += 1;
            self.beta += 1.0;
            let penalty = timeout_ms * 2.0;
            let old_mu = self.mu;
            let old_lambda = self.lambda;
            self.lambda = old_lambda + 0.5;
            self.mu = (old_lambda * old_mu + 0.5 * penalty) / self.lambda;
        }
    }

    fn variance(&self) -> f64 {
        if self.successes > 1 {
            self.sum_sq_diff / (self.successes - 1) as f64
        } else {
            0.0
        }
    }
}

fn arb_updates() -> impl Strategy<Value = Vec<(bool, f64)>> {
    prop::collection::vec((any::<bool>(), 1.0f64..5_000.0), 0..200)
}

proptest! {
    /// Counter and parameter invariants hold after every single update.
    #[test]
    fn invariants_hold_throughout(updates in arb_updates()) {
        let arm = Arm::new(net("10.0.0.0/16"), None);
        for (success, latency) in &updates {
            arm.update(*success, *latency, 3000.0);

            let s = arm.stats();
            prop_assert_eq!(s.samples, s.successes + s.failures);

            let p = arm.posterior();
            prop_assert!(p.alpha >= 1.0);
            prop_assert!(p.beta >= 1.0);
            prop_assert!(p.lambda > 0.0);
            prop_assert!(p.alpha_ng >= 1.0);
            prop_assert!(p.beta_ng > 0.0);
            prop_assert!(s.var_latency >= 0.0);
            prop_assert!((0.0..=1.0).contains(&s.success_rate));
        }
    }

    /// The posterior agrees with the reference implementation to 1e-9.
    #[test]
    fn posterior_matches_reference(updates in arb_updates()) {
        let arm = Arm::new(net("10.0.0.0/16"), None);
        let mut reference = Reference::new();
        for (success, latency) in &updates {
            arm.update(*success, *latency, 3000.0);
            reference.update(*success, *latency, 3000.0);
        }

        let p = arm.posterior();
        let s = arm.stats();
        let tol = 1e-9;
        prop_assert!((p.alpha - reference.alpha).abs() < tol);
        prop_assert!((p.beta - reference.beta).abs() < tol);
        prop_assert!((p.mu - reference.mu).abs() < tol, "mu {} vs {}", p.mu, reference.mu);
        prop_assert!((p.lambda - reference.lambda).abs() < tol);
        prop_assert!((p.alpha_ng - reference.alpha_ng).abs() < tol);
        prop_assert!((p.beta_ng - reference.beta_ng).abs() < tol);
        prop_assert!((s.var_latency - reference.variance()).abs() < tol);
        prop_assert_eq!(s.samples, reference.samples);
        prop_assert_eq!(s.successes, reference.successes);
        prop_assert_eq!(s.failures, reference.failures);
    }

    /// Success-rate estimate equals α / (α + β) exactly.
    #[test]
    fn success_rate_is_posterior_mean(updates in arb_updates()) {
        let arm = Arm::new(net("10.0.0.0/16"), None);
        for (success, latency) in &updates {
            arm.update(*success, *latency, 3000.0);
        }
        let p = arm.posterior();
        let s = arm.stats();
        prop_assert!((s.success_rate - p.alpha / (p.alpha + p.beta)).abs() < 1e-12);
    }

    /// Information gain is finite for any sampled arm and +∞ before the
    /// first sample.
    #[test]
    fn information_gain_edges(updates in arb_updates()) {
        let arm = Arm::new(net("10.0.0.0/16"), None);
        prop_assert!(arm.information_gain().is_infinite());
        for (success, latency) in &updates {
            arm.update(*success, *latency, 3000.0);
            prop_assert!(arm.information_gain().is_finite());
            prop_assert!(arm.information_gain() >= 0.0);
        }
    }
}

#[test]
fn first_success_leaves_variance_state_at_prior() {
    let arm = Arm::new(net("10.0.0.0/16"), None);
    // Failures first: they must not touch the Normal–Gamma variance terms.
    arm.update(false, 0.0, 3000.0);
    arm.update(false, 0.0, 3000.0);
    arm.update(true, 123.0, 3000.0);

    let p = arm.posterior();
    assert_eq!(p.alpha_ng, 1.0);
    assert_eq!(p.beta_ng, 1.0);
    assert_eq!(arm.stats().var_latency, 0.0);

    // The second success starts accumulating.
    arm.update(true, 456.0, 3000.0);
    let p = arm.posterior();
    assert!(p.alpha_ng > 1.0);
    assert!(p.beta_ng > 1.0);
}
