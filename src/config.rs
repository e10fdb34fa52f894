//! Search configuration and the crate's error kinds.
//!
//! Every field has a documented range; `validate` rejects anything outside it
//! before a single probe is sent. Probe failures are never errors — they are
//! recorded on the arm and surfaced per-result — and cancellation is a normal
//! termination, so the only error paths out of a run are bad configuration
//! and an empty prefix set.

use thiserror::Error;

use crate::head::HeadConfig;
use crate::net::CidrError;
use crate::tree::TreeConfig;

/// Errors returned by [`Engine::run`](crate::Engine::run) before any probing
/// starts.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A configuration field is outside its documented range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The deduplicated prefix set was empty.
    #[error("no CIDR prefixes provided")]
    NoInput,
    /// CIDR parsing or splitting failed.
    #[error(transparent)]
    Cidr(#[from] CidrError),
}

/// Tunables for a search run. `Default` matches the documented defaults.
#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    /// Total probe budget: the run performs exactly this many probes.
    pub budget: u64,
    /// How many best results to keep.
    pub top_n: usize,
    /// Parallel probe workers.
    pub concurrency: usize,
    /// Number of search heads (diversification).
    pub heads: usize,
    /// Beam width per head (focus history capacity).
    pub beam: usize,
    /// Prefix bits added when splitting IPv4, in `[1, 8]`.
    pub split_step_v4: u8,
    /// Prefix bits added when splitting IPv6, in `[1, 16]`.
    pub split_step_v6: u8,
    /// Minimum samples on a prefix before it can be split.
    pub min_samples_split: u64,
    /// Maximum IPv4 prefix length to drill down to, in `[1, 32]`.
    pub max_bits_v4: u8,
    /// Maximum IPv6 prefix length to drill down to, in `[1, 128]`.
    pub max_bits_v6: u8,
    /// RNG seed; `0` derives one from the clock.
    pub seed: u64,
    /// Completed samples between split passes.
    pub split_interval: u64,
    /// Weight of the inter-head diversity penalty, in `[0, 1]`.
    pub diversity_weight: f64,
    /// Emit per-second progress at `info` level (otherwise `debug`).
    pub verbose: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget: 2000,
            top_n: 20,
            concurrency: 200,
            heads: 4,
            beam: 32,
            split_step_v4: 2,
            split_step_v6: 4,
            min_samples_split: 5,
            max_bits_v4: 24,
            max_bits_v6: 56,
            seed: 0,
            split_interval: 20,
            diversity_weight: 0.3,
            verbose: false,
        }
    }
}

impl SearchConfig {
    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.budget == 0 {
            return Err(invalid("budget must be > 0"));
        }
        if self.top_n == 0 {
            return Err(invalid("top_n must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be > 0"));
        }
        if self.heads == 0 {
            return Err(invalid("heads must be > 0"));
        }
        if self.beam == 0 {
            return Err(invalid("beam must be > 0"));
        }
        if !(1..=8).contains(&self.split_step_v4) {
            return Err(invalid(&format!(
                "split_step_v4 must be in [1, 8], got {}",
                self.split_step_v4
            )));
        }
        if !(1..=16).contains(&self.split_step_v6) {
            return Err(invalid(&format!(
                "split_step_v6 must be in [1, 16], got {}",
                self.split_step_v6
            )));
        }
        if self.min_samples_split == 0 {
            return Err(invalid("min_samples_split must be > 0"));
        }
        if !(1..=32).contains(&self.max_bits_v4) {
            return Err(invalid(&format!(
                "max_bits_v4 must be in [1, 32], got {}",
                self.max_bits_v4
            )));
        }
        if !(1..=128).contains(&self.max_bits_v6) {
            return Err(invalid(&format!(
                "max_bits_v6 must be in [1, 128], got {}",
                self.max_bits_v6
            )));
        }
        if self.split_interval == 0 {
            return Err(invalid("split_interval must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.diversity_weight) || !self.diversity_weight.is_finite() {
            return Err(invalid(&format!(
                "diversity_weight must be in [0, 1], got {}",
                self.diversity_weight
            )));
        }
        Ok(())
    }

    /// The seed to actually use: the configured one, or clock-derived when 0.
    pub(crate) fn effective_seed(&self) -> u64 {
        if self.seed != 0 {
            return self.seed;
        }
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    }

    pub(crate) fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            split_step_v4: self.split_step_v4,
            split_step_v6: self.split_step_v6,
            max_bits_v4: self.max_bits_v4,
            max_bits_v6: self.max_bits_v6,
            min_samples_split: self.min_samples_split,
        }
    }

    pub(crate) fn head_config(&self, seed: u64, timeout_ms: f64) -> HeadConfig {
        HeadConfig {
            heads: self.heads,
            timeout_ms,
            base_seed: seed,
            history: self.beam,
            diversity_weight: self.diversity_weight,
            repulsion_decay: 0.5,
        }
    }
}

fn invalid(msg: &str) -> SearchError {
    SearchError::InvalidConfig(msg.to_string())
}
