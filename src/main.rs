//! `ipscout` command-line interface.
//!
//! Parses flags, wires SIGINT to the cancellation token, runs the search
//! with the HTTPS prober, optionally re-tests the best IPs for download
//! throughput, and encodes the results.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use ipscout::{
    measure_top, parse_cidrs, read_cidrs_from_file, write_csv, write_jsonl, write_text,
    CancelToken, DownloadConfig, Engine, HttpsProber, ProbeConfig, SearchConfig, TopResult,
};

#[derive(Debug, Parser)]
#[command(name = "ipscout", version, about = "Find the fastest IPs in anycast CIDR blocks")]
struct Args {
    /// CIDR to search (repeatable), e.g. 1.1.0.0/16 or 2606:4700::/32.
    #[arg(long = "cidr")]
    cidrs: Vec<String>,

    /// File with one CIDR per line (# comments allowed).
    #[arg(long)]
    cidr_file: Option<PathBuf>,

    /// Total probe budget (number of IPs to probe).
    #[arg(long, default_value_t = 2000)]
    budget: u64,

    /// Top N IPs to output.
    #[arg(long = "top", default_value_t = 20)]
    top: usize,

    /// Probe concurrency.
    #[arg(long, default_value_t = 200)]
    concurrency: usize,

    /// Number of search heads (diversification).
    #[arg(long, default_value_t = 4)]
    heads: usize,

    /// Beam width per head.
    #[arg(long, default_value_t = 32)]
    beam: usize,

    /// Per-probe timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Host name used for both the TLS SNI and the HTTP Host header.
    #[arg(long, default_value = "example.com")]
    host: String,

    /// HTTP path to request.
    #[arg(long, default_value = "/cdn-cgi/trace")]
    path: String,

    /// After the search, run a download speed test for this many of the top
    /// IPs (0 disables).
    #[arg(long, default_value_t = 5)]
    download_top: usize,

    /// Download test size in bytes.
    #[arg(long, default_value_t = 50_000_000)]
    download_bytes: u64,

    /// Per-IP download test timeout in milliseconds.
    #[arg(long, default_value_t = 45_000)]
    download_timeout_ms: u64,

    /// Output format.
    #[arg(long = "out", value_enum, default_value = "jsonl")]
    out: OutputFormat,

    /// Write output to a file instead of stdout.
    #[arg(long)]
    out_file: Option<PathBuf>,

    /// Prefix bits added when splitting an IPv4 prefix.
    #[arg(long, default_value_t = 2)]
    split_step_v4: u8,

    /// Prefix bits added when splitting an IPv6 prefix.
    #[arg(long, default_value_t = 4)]
    split_step_v6: u8,

    /// Minimum samples on a prefix before it can be split.
    #[arg(long, default_value_t = 5)]
    min_samples_split: u64,

    /// Maximum IPv4 prefix bits to drill down to.
    #[arg(long, default_value_t = 24)]
    max_bits_v4: u8,

    /// Maximum IPv6 prefix bits to drill down to.
    #[arg(long, default_value_t = 56)]
    max_bits_v6: u8,

    /// Random seed (0 = time-based).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Completed probes between split passes.
    #[arg(long, default_value_t = 20)]
    split_interval: u64,

    /// Weight for head diversity (0-1, higher spreads heads more).
    #[arg(long, default_value_t = 0.3)]
    diversity_weight: f64,

    /// Verbose progress on stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Jsonl,
    Csv,
    Text,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut prefixes = parse_cidrs(&args.cidrs)?;
    if let Some(path) = &args.cidr_file {
        prefixes.extend(read_cidrs_from_file(path)?);
    }

    let cancel = CancelToken::new();
    {
        let token = cancel.clone();
        ctrlc::set_handler(move || token.cancel())
            .context("failed to install signal handler")?;
    }

    let probe_cfg = ProbeConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        sni: args.host.clone(),
        host_header: args.host.clone(),
        path: args.path.clone(),
    };
    let cfg = SearchConfig {
        budget: args.budget,
        top_n: args.top,
        concurrency: args.concurrency,
        heads: args.heads,
        beam: args.beam,
        split_step_v4: args.split_step_v4,
        split_step_v6: args.split_step_v6,
        min_samples_split: args.min_samples_split,
        max_bits_v4: args.max_bits_v4,
        max_bits_v6: args.max_bits_v6,
        seed: args.seed,
        split_interval: args.split_interval,
        diversity_weight: args.diversity_weight,
        verbose: args.verbose,
    };

    let engine = Engine::new(cfg, probe_cfg.clone(), HttpsProber::new(probe_cfg));
    let mut response = engine.run(&cancel, &prefixes)?;

    if args.download_top > 0 && args.download_bytes > 0 && !cancel.is_cancelled() {
        let dl_cfg = DownloadConfig {
            timeout: Duration::from_millis(args.download_timeout_ms),
            bytes: args.download_bytes,
            ..DownloadConfig::default()
        };
        measure_top(dl_cfg, &mut response.top, args.download_top, &cancel);
    }

    match &args.out_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            encode(file, args.out, &response.top)?;
        }
        None => {
            let stdout = std::io::stdout();
            encode(stdout.lock(), args.out, &response.top)?;
        }
    }
    Ok(())
}

fn encode<W: Write>(w: W, format: OutputFormat, rows: &[TopResult]) -> std::io::Result<()> {
    match format {
        OutputFormat::Jsonl => write_jsonl(w, rows),
        OutputFormat::Csv => write_csv(w, rows),
        OutputFormat::Text => write_text(w, rows),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "ipscout=debug" } else { "ipscout=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
