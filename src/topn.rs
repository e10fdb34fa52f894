//! Bounded collector for the best observed results.
//!
//! A max-heap of at most `N` rows keyed on `score_ms` — the root is the worst
//! result currently kept, so displacement is O(log N) — plus an `ip → heap
//! index` map that enforces one entry per IP. The index map is maintained
//! through every sift instead of being rebuilt per mutation.
//!
//! One mutex guards the whole structure; contention is negligible because
//! `N` is small and probe latency dominates.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;

use crate::result::TopResult;

/// Concurrent bounded top-N collector, ranked by `score_ms` ascending.
#[derive(Debug)]
pub struct TopN {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    cap: usize,
    heap: Vec<TopResult>,
    by_ip: HashMap<IpAddr, usize>,
}

impl TopN {
    /// Create a collector keeping at most `cap` results.
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cap,
                heap: Vec::with_capacity(cap.saturating_add(1)),
                by_ip: HashMap::with_capacity(cap),
            }),
        }
    }

    /// Offer a result. It is kept when its IP is new and there is room, when
    /// it beats the worst kept result, or when it improves on an existing
    /// entry for the same IP.
    pub fn consider(&self, r: TopResult) {
        let mut g = self.inner.lock();
        if g.cap == 0 {
            return;
        }

        if let Some(&idx) = g.by_ip.get(&r.ip) {
            // Same IP seen again: keep only the better score.
            if r.score_ms < g.heap[idx].score_ms {
                g.heap[idx] = r;
                // The key decreased, so only the subtree below can be out of
                // order in a max-heap.
                g.sift_down(idx);
            }
            return;
        }

        if g.heap.len() < g.cap {
            let idx = g.heap.len();
            g.by_ip.insert(r.ip, idx);
            g.heap.push(r);
            g.sift_up(idx);
            return;
        }

        if r.score_ms < g.heap[0].score_ms {
            let worst_ip = g.heap[0].ip;
            g.by_ip.remove(&worst_ip);
            g.by_ip.insert(r.ip, 0);
            g.heap[0] = r;
            g.sift_down(0);
        }
    }

    /// The best (lowest-score) result so far, if any.
    pub fn best(&self) -> Option<TopResult> {
        let g = self.inner.lock();
        g.heap
            .iter()
            .min_by(|a, b| a.score_ms.total_cmp(&b.score_ms))
            .cloned()
    }

    /// All kept results, best first. Ties are broken by IP so snapshots are
    /// stable across identical runs.
    pub fn snapshot(&self) -> Vec<TopResult> {
        let g = self.inner.lock();
        let mut out = g.heap.clone();
        out.sort_by(|a, b| a.score_ms.total_cmp(&b.score_ms).then_with(|| a.ip.cmp(&b.ip)));
        out
    }

    /// Number of kept results.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether nothing has been kept yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

impl Inner {
    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.by_ip.insert(self.heap[i].ip, i);
        self.by_ip.insert(self.heap[j].ip, j);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].score_ms > self.heap[parent].score_ms {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut largest = idx;
            if left < len && self.heap[left].score_ms > self.heap[largest].score_ms {
                largest = left;
            }
            if right < len && self.heap[right].score_ms > self.heap[largest].score_ms {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.swap(idx, largest);
            idx = largest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(ip: &str, score: f64) -> TopResult {
        TopResult {
            ip: ip.parse().unwrap(),
            prefix: "0.0.0.0/0".parse().unwrap(),
            ok: true,
            status: 200,
            error: String::new(),
            connect_ms: 0,
            tls_ms: 0,
            ttfb_ms: 0,
            total_ms: score as u64,
            score_ms: score,
            trace: BTreeMap::new(),
            download_ok: false,
            download_bytes: 0,
            download_ms: 0,
            download_mbps: 0.0,
            download_error: String::new(),
            prefix_samples: 0,
            prefix_ok: 0,
            prefix_fail: 0,
        }
    }

    #[test]
    fn keeps_the_n_best() {
        let t = TopN::new(3);
        for (i, score) in [50.0, 10.0, 40.0, 20.0, 30.0].iter().enumerate() {
            t.consider(row(&format!("10.0.0.{i}"), *score));
        }
        let snap = t.snapshot();
        let scores: Vec<f64> = snap.iter().map(|r| r.score_ms).collect();
        assert_eq!(scores, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn snapshot_is_sorted_ascending() {
        let t = TopN::new(10);
        for (i, score) in [9.0, 3.0, 7.0, 1.0, 5.0].iter().enumerate() {
            t.consider(row(&format!("10.0.0.{i}"), *score));
        }
        let snap = t.snapshot();
        assert!(snap.windows(2).all(|w| w[0].score_ms <= w[1].score_ms));
    }

    #[test]
    fn duplicate_ip_keeps_better_score_only() {
        let t = TopN::new(5);
        t.consider(row("10.0.0.1", 50.0));
        t.consider(row("10.0.0.1", 80.0)); // worse: ignored
        assert_eq!(t.len(), 1);
        assert_eq!(t.snapshot()[0].score_ms, 50.0);

        t.consider(row("10.0.0.1", 20.0)); // better: replaces in place
        assert_eq!(t.len(), 1);
        assert_eq!(t.snapshot()[0].score_ms, 20.0);
    }

    #[test]
    fn displacement_evicts_the_worst_ip() {
        let t = TopN::new(2);
        t.consider(row("10.0.0.1", 100.0));
        t.consider(row("10.0.0.2", 200.0));
        t.consider(row("10.0.0.3", 50.0));

        let snap = t.snapshot();
        assert_eq!(snap.len(), 2);
        let ips: Vec<String> = snap.iter().map(|r| r.ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.1"]);

        // The evicted IP can re-enter later with a good enough score.
        t.consider(row("10.0.0.2", 10.0));
        assert_eq!(t.snapshot()[0].ip.to_string(), "10.0.0.2");
    }

    #[test]
    fn best_is_the_minimum() {
        let t = TopN::new(4);
        assert!(t.best().is_none());
        t.consider(row("10.0.0.1", 30.0));
        t.consider(row("10.0.0.2", 10.0));
        t.consider(row("10.0.0.3", 20.0));
        assert_eq!(t.best().unwrap().score_ms, 10.0);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let t = TopN::new(0);
        t.consider(row("10.0.0.1", 1.0));
        assert!(t.is_empty());
    }
}
