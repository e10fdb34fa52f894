//! Result rows produced by a search run.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// One probed IP in the top-N, with the prefix statistics captured at the
/// time the probe completed.
///
/// `score_ms` is the ranking key (lower is better): the measured total
/// latency for successful probes, a `2 × timeout` penalty for failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopResult {
    pub ip: IpAddr,
    pub prefix: IpNet,
    pub ok: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    pub connect_ms: u64,
    pub tls_ms: u64,
    pub ttfb_ms: u64,
    pub total_ms: u64,
    pub score_ms: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace: BTreeMap<String, String>,

    pub download_ok: bool,
    pub download_bytes: u64,
    pub download_ms: u64,
    pub download_mbps: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_error: String,

    pub prefix_samples: u64,
    pub prefix_ok: u64,
    pub prefix_fail: u64,
}

/// The complete output of a search run: top results, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub top: Vec<TopResult>,
}
