//! The search engine: an event-driven scheduler over a worker pool.
//!
//! One coordinator thread owns all search state (arm tree, heads, top-N,
//! dedup set) and `W` worker threads block on the external probe. Tasks and
//! completions flow over bounded channels (capacity `2W`) so the pipeline
//! stays full without unbounded queues: the coordinator pre-fills
//! `min(2W, budget)` tasks, then submits one replacement per completion.
//!
//! The coordinator never blocks on I/O; it only waits on the completion
//! channel or the cancel token. Cancellation is a normal way for a run to
//! end — whatever top-N has accumulated is returned without an error.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use dashmap::DashSet;
use ipnet::IpNet;
use tracing::{debug, info, trace};

use crate::cancel::CancelToken;
use crate::config::{SearchConfig, SearchError};
use crate::head::{HeadManager, SearchHead};
use crate::net::dedup_masked;
use crate::probe::{ProbeConfig, Prober};
use crate::result::{Response, TopResult};
use crate::topn::TopN;
use crate::tree::ArmTree;

/// Give up on drawing a fresh address after this many duplicate hits and
/// accept the duplicate rather than stall the pipeline.
const DEDUP_MAX_TRIES: u32 = 32;

/// Completions before exploitation of the top-N may kick in.
const EXPLOIT_WARMUP: u64 = 30;

struct ProbeTask {
    head_id: usize,
    prefix: IpNet,
    ip: IpAddr,
}

struct ProbeDone {
    task: ProbeTask,
    outcome: crate::probe::Outcome,
}

/// Monte-Carlo prefix search engine.
pub struct Engine<P> {
    cfg: SearchConfig,
    probe_cfg: ProbeConfig,
    prober: Arc<P>,
}

impl<P: Prober + 'static> Engine<P> {
    pub fn new(cfg: SearchConfig, probe_cfg: ProbeConfig, prober: P) -> Self {
        Self {
            cfg,
            probe_cfg,
            prober: Arc::new(prober),
        }
    }

    /// Run the search over `cidrs` until the probe budget is spent or the
    /// token is cancelled. Cancellation returns the partial top-N, not an
    /// error; only invalid configuration and an empty prefix set fail.
    pub fn run(&self, cancel: &CancelToken, cidrs: &[IpNet]) -> Result<Response, SearchError> {
        self.cfg.validate()?;
        let prefixes = dedup_masked(cidrs.to_vec());
        if prefixes.is_empty() {
            return Err(SearchError::NoInput);
        }

        let seed = self.cfg.effective_seed();
        let timeout_ms = self.probe_cfg.timeout_ms();
        let tree = ArmTree::new(&prefixes, self.cfg.tree_config());
        let heads = HeadManager::new(self.cfg.head_config(seed, timeout_ms));
        let topn = TopN::new(self.cfg.top_n);
        let seen = DashSet::new();

        let cap = self.cfg.concurrency * 2;
        let (task_tx, task_rx) = bounded::<ProbeTask>(cap);
        let (done_tx, done_rx) = bounded::<ProbeDone>(cap);
        let workers = self.spawn_workers(task_rx, done_tx, cancel);

        let mut sched = Scheduler {
            cfg: &self.cfg,
            timeout_ms,
            tree: &tree,
            heads: &heads,
            topn: &topn,
            seen: &seen,
            cancel,
            task_tx: Some(task_tx),
            submitted: 0,
            completed: 0,
            last_split: 0,
            started: Instant::now(),
            last_log: Instant::now(),
        };
        sched.run(&done_rx);
        sched.close_tasks();

        for w in workers {
            let _ = w.join();
        }
        // Fold in whatever was still in flight when the loop ended.
        while let Ok(done) = done_rx.try_recv() {
            sched.process_result(&done);
        }

        info!(
            probes = tree.total_samples(),
            nodes = tree.len(),
            kept = topn.len(),
            elapsed_ms = sched.started.elapsed().as_millis() as u64,
            "search finished"
        );
        Ok(Response {
            top: topn.snapshot(),
        })
    }

    fn spawn_workers(
        &self,
        task_rx: Receiver<ProbeTask>,
        done_tx: Sender<ProbeDone>,
        cancel: &CancelToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.cfg.concurrency)
            .map(|_| {
                let rx = task_rx.clone();
                let tx = done_tx.clone();
                let prober = Arc::clone(&self.prober);
                let cancel = cancel.clone();
                let timeout = self.probe_cfg.timeout;
                std::thread::spawn(move || {
                    while let Ok(task) = rx.recv() {
                        // After cancellation, drain the queue without probing
                        // so shutdown stays fast.
                        if cancel.is_cancelled() {
                            continue;
                        }
                        let outcome = prober.probe(task.ip, timeout, &cancel);
                        if tx.send(ProbeDone { task, outcome }).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }
}

/// Single-threaded coordinator state for one run.
struct Scheduler<'a> {
    cfg: &'a SearchConfig,
    timeout_ms: f64,
    tree: &'a ArmTree,
    heads: &'a HeadManager,
    topn: &'a TopN,
    seen: &'a DashSet<IpAddr>,
    cancel: &'a CancelToken,
    task_tx: Option<Sender<ProbeTask>>,
    submitted: u64,
    completed: u64,
    last_split: u64,
    started: Instant,
    last_log: Instant,
}

impl Scheduler<'_> {
    fn run(&mut self, done_rx: &Receiver<ProbeDone>) {
        let initial = (self.cfg.concurrency as u64 * 2).min(self.cfg.budget);
        for i in 0..initial {
            let head_id = (i % self.cfg.heads as u64) as usize;
            if !self.submit_one(head_id) {
                return;
            }
        }

        while self.completed < self.cfg.budget {
            select! {
                recv(done_rx) -> msg => {
                    let Ok(done) = msg else { return };
                    self.on_result(done);
                }
                recv(self.cancel.receiver()) -> _ => return,
            }
        }
    }

    fn on_result(&mut self, done: ProbeDone) {
        self.process_result(&done);
        self.completed += 1;

        if self.completed - self.last_split >= self.cfg.split_interval {
            self.try_split();
            self.heads.rebalance(self.tree);
            self.last_split = self.completed;
        }

        if self.submitted < self.cfg.budget {
            let head_id = (self.submitted % self.cfg.heads as u64) as usize;
            self.submit_one(head_id);
        }

        self.log_progress();
    }

    /// Record one completion: update the probed prefix's arm, then offer the
    /// row to the collector with the arm counters as of this probe.
    fn process_result(&self, done: &ProbeDone) {
        let r = &done.outcome;
        trace!(
            head = done.task.head_id,
            ip = %done.task.ip,
            prefix = %done.task.prefix,
            ok = r.ok,
            total_ms = r.total_ms,
            "probe done"
        );
        self.tree.update(
            done.task.prefix,
            r.ok,
            r.total_ms as f64,
            self.timeout_ms,
        );

        let stats = self.tree.get(done.task.prefix).map(|arm| arm.stats());
        let (prefix_samples, prefix_ok, prefix_fail) = match stats {
            Some(s) => (s.samples, s.successes, s.failures),
            None => (0, 0, 0),
        };

        let score_ms = if r.ok {
            r.total_ms as f64
        } else {
            self.timeout_ms * 2.0
        };

        self.topn.consider(TopResult {
            ip: done.task.ip,
            prefix: done.task.prefix,
            ok: r.ok,
            status: r.status,
            error: r.error.clone(),
            connect_ms: r.connect_ms,
            tls_ms: r.tls_ms,
            ttfb_ms: r.ttfb_ms,
            total_ms: r.total_ms,
            score_ms,
            trace: r.trace.clone(),
            download_ok: false,
            download_bytes: 0,
            download_ms: 0,
            download_mbps: 0.0,
            download_error: String::new(),
            prefix_samples,
            prefix_ok,
            prefix_fail,
        });
    }

    /// Pick a prefix for `head_id`, draw a deduplicated address in it, and
    /// hand the task to the worker pool. Returns false when the run is
    /// shutting down.
    fn submit_one(&mut self, head_id: usize) -> bool {
        let head = self.heads.head(head_id);

        let mut prefix: Option<IpNet> = None;

        // Exploitation: sample straight from prefixes that already hold
        // top-N entries, ramping from 20% to 50% as the budget burns down.
        let exploit_rate =
            (0.2 + 0.3 * self.completed as f64 / self.cfg.budget as f64).clamp(0.0, 0.5);
        if self.completed > EXPLOIT_WARMUP {
            let pool = self.exploit_prefixes();
            if !pool.is_empty() {
                let u = head.sampler().sample_uniform();
                if u < exploit_rate {
                    let idx = ((u / exploit_rate) * pool.len() as f64) as usize;
                    prefix = Some(pool[idx.min(pool.len() - 1)]);
                }
            }
        }

        let prefix = prefix
            .or_else(|| self.heads.select_next_prefix(head, self.tree))
            .or_else(|| {
                let leaves = self.tree.leaves();
                if leaves.is_empty() {
                    None
                } else {
                    Some(leaves[head_id % leaves.len()].prefix())
                }
            });
        let Some(prefix) = prefix else {
            return true;
        };

        let ip = self.sample_with_dedup(prefix, head);
        let Some(tx) = &self.task_tx else {
            return false;
        };
        let task = ProbeTask { head_id, prefix, ip };
        select! {
            send(tx, task) -> res => {
                if res.is_err() {
                    return false;
                }
            }
            recv(self.cancel.receiver()) -> _ => return false,
        }
        self.submitted += 1;
        true
    }

    /// Prefixes worth hammering, weighted: prefixes whose best kept score is
    /// within 1.2× of the overall best appear three times, those within 1.5×
    /// once. Ordered by the (deterministic) snapshot so seeded runs replay.
    fn exploit_prefixes(&self) -> Vec<IpNet> {
        let snapshot = self.topn.snapshot();
        let Some(first) = snapshot.first() else {
            return Vec::new();
        };
        let tier1 = first.score_ms * 1.2;
        let tier2 = first.score_ms * 1.5;

        let mut seen_prefixes: HashSet<IpNet> = HashSet::new();
        let mut pool = Vec::new();
        for r in &snapshot {
            if r.score_ms > tier2 {
                break;
            }
            if !seen_prefixes.insert(r.prefix) {
                continue;
            }
            if r.score_ms <= tier1 {
                pool.extend_from_slice(&[r.prefix, r.prefix, r.prefix]);
            } else {
                pool.push(r.prefix);
            }
        }
        pool
    }

    /// Draw an address from `prefix`, retrying against the dedup set. After
    /// [`DEDUP_MAX_TRIES`] duplicates the last draw is accepted as-is.
    fn sample_with_dedup(&self, prefix: IpNet, head: &SearchHead) -> IpAddr {
        let mut ip = head.sampler().sample_ip(prefix);
        for _ in 1..DEDUP_MAX_TRIES {
            if self.seen.insert(ip) {
                return ip;
            }
            ip = head.sampler().sample_ip(prefix);
        }
        self.seen.insert(ip);
        ip
    }

    fn try_split(&self) {
        let candidates = self.tree.split_candidates(self.cfg.heads * 4);
        let max_splits = self.cfg.heads * 2;
        let mut split = 0usize;
        for arm in candidates {
            if split >= max_splits {
                break;
            }
            if !self.tree.split_node(&arm).is_empty() {
                split += 1;
            }
        }
        if split > 0 {
            debug!(
                splits = split,
                nodes = self.tree.len(),
                completed = self.completed,
                "split pass"
            );
        }
    }

    fn log_progress(&mut self) {
        if self.last_log.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_log = Instant::now();
        let Some(best) = self.topn.best() else {
            return;
        };
        if self.cfg.verbose {
            info!(
                completed = self.completed,
                budget = self.cfg.budget,
                best_ms = best.score_ms,
                ip = %best.ip,
                prefix = %best.prefix,
                nodes = self.tree.len(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "progress"
            );
        } else {
            debug!(
                completed = self.completed,
                budget = self.cfg.budget,
                best_ms = best.score_ms,
                ip = %best.ip,
                prefix = %best.prefix,
                nodes = self.tree.len(),
                "progress"
            );
        }
    }

    fn close_tasks(&mut self) {
        self.task_tx.take();
    }
}
