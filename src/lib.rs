//! `ipscout`: Monte-Carlo search for the fastest addresses in anycast CIDR
//! blocks.
//!
//! Given one or more CIDR blocks of a single anycast provider and a fixed
//! probe budget, the engine finds the addresses with the lowest HTTPS request
//! latency. The search space is combinatorial (a /16 holds 65 536 addresses,
//! a v6 /32 holds 2^96), so instead of scanning, a hierarchical multi-armed
//! bandit concentrates probes on sub-ranges that are empirically fast while
//! still exploring:
//!
//! - every prefix is an **arm** with a Beta posterior (success) and a
//!   Normal–Gamma posterior (latency);
//! - **Thompson sampling** scores arms by posterior draws, lower is better;
//! - promising arms are **split** into finer prefixes and the search drills
//!   down;
//! - several **search heads** explore in parallel, repelled from each
//!   other's focus so they do not pile onto one region;
//! - an event-driven **scheduler** keeps `concurrency` probes in flight
//!   against the budget and feeds a bounded **top-N** collector.
//!
//! Goals:
//! - **Reproducible by default**: all randomness flows from seedable
//!   per-head RNGs; same seed + same (mock) probe → same top-N.
//! - **Failures are data**: probe errors and timeouts update the posterior
//!   and show up in results; they never abort a run. Cancellation returns
//!   the partial top-N, also without an error.
//!
//! Non-goals:
//! - Exhaustive enumeration or optimality guarantees — this is Monte-Carlo
//!   search under a budget.
//! - Cross-run learning: every run starts from uniform priors.

#![forbid(unsafe_code)]

mod arm;
pub use arm::*;

mod cancel;
pub use cancel::*;

mod config;
pub use config::*;

mod download;
pub use download::*;

mod engine;
pub use engine::*;

mod head;
pub use head::*;

mod net;
pub use net::*;

mod output;
pub use output::*;

mod probe;
pub use probe::*;

mod result;
pub use result::*;

mod thompson;
pub use thompson::*;

mod topn;
pub use topn::*;

mod tree;
pub use tree::*;

pub const IPSCOUT_VERSION: &str = env!("CARGO_PKG_VERSION");
