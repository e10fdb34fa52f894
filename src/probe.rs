//! Probe interface and the HTTPS trace prober.
//!
//! The search core only depends on the [`Prober`] trait; anything that can
//! turn an address into an [`Outcome`] within a deadline will do, which is
//! what the scenario tests exploit with closure mocks. The shipped
//! implementation, [`HttpsProber`], dials `ip:443`, handshakes TLS under the
//! configured SNI, issues a single `GET`, and reports per-phase timings:
//!
//! - `connect_ms`: TCP connect duration
//! - `tls_ms`: TLS handshake duration
//! - `ttfb_ms`: start → first response byte
//! - `total_ms`: start → response fully read
//!
//! Transport failures and timeouts are data (`ok = false`), never panics or
//! errors: the scheduler records them on the arm and keeps going.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

/// Cap on how much response body the trace probe will buffer.
const MAX_TRACE_BODY: usize = 256 * 1024;

/// Result of probing one address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub connect_ms: u64,
    pub tls_ms: u64,
    pub ttfb_ms: u64,
    pub total_ms: u64,
    /// Parsed `key=value` lines from the trace body (e.g. `colo`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace: BTreeMap<String, String>,
}

/// Anything that can probe an address within a deadline.
pub trait Prober: Send + Sync {
    /// Probe one address. Implementations should honor `timeout` as a hard
    /// deadline and check `cancel` between blocking phases; both conditions
    /// come back as `ok = false` outcomes.
    fn probe(&self, ip: IpAddr, timeout: Duration, cancel: &CancelToken) -> Outcome;
}

/// Adapter turning a closure into a [`Prober`]. Mostly useful for tests and
/// simulations. Annotate the closure's parameter types so the higher-ranked
/// `Fn` bound can be inferred:
///
/// ```rust
/// use std::net::IpAddr;
/// use std::time::Duration;
/// use ipscout::{CancelToken, FnProber, Outcome, Prober};
///
/// let prober = FnProber(|_ip: IpAddr, _timeout: Duration, _cancel: &CancelToken| Outcome {
///     ok: true,
///     total_ms: 12,
///     ..Outcome::default()
/// });
/// let out = prober.probe("1.1.1.1".parse().unwrap(), Duration::from_secs(1), &CancelToken::new());
/// assert!(out.ok);
/// ```
pub struct FnProber<F>(pub F);

impl<F> Prober for FnProber<F>
where
    F: Fn(IpAddr, Duration, &CancelToken) -> Outcome + Send + Sync,
{
    fn probe(&self, ip: IpAddr, timeout: Duration, cancel: &CancelToken) -> Outcome {
        (self.0)(ip, timeout, cancel)
    }
}

/// Configuration for the HTTPS trace probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Per-probe hard deadline.
    pub timeout: Duration,
    /// TLS SNI server name.
    pub sni: String,
    /// HTTP `Host` header (usually the same as `sni`).
    pub host_header: String,
    /// Path to request.
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            sni: "example.com".to_string(),
            host_header: "example.com".to_string(),
            path: "/cdn-cgi/trace".to_string(),
        }
    }
}

impl ProbeConfig {
    /// The probe timeout in milliseconds, as used by scores and posteriors.
    pub fn timeout_ms(&self) -> f64 {
        self.timeout.as_secs_f64() * 1000.0
    }
}

/// HTTPS prober with per-phase timings.
#[derive(Debug)]
pub struct HttpsProber {
    cfg: ProbeConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl HttpsProber {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self {
            cfg,
            tls: tls_client_config(),
        }
    }
}

impl Prober for HttpsProber {
    fn probe(&self, ip: IpAddr, timeout: Duration, cancel: &CancelToken) -> Outcome {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut out = Outcome::default();
        if let Err(error) = self.trace_once(ip, start, deadline, cancel, &mut out) {
            out.ok = false;
            out.error = error;
        }
        out.total_ms = ms_since(start);
        out
    }
}

impl HttpsProber {
    fn trace_once(
        &self,
        ip: IpAddr,
        start: Instant,
        deadline: Instant,
        cancel: &CancelToken,
        out: &mut Outcome,
    ) -> Result<(), String> {
        let budget = remaining(deadline).ok_or_else(timeout_msg)?;
        let addr = SocketAddr::new(ip, 443);

        let connect_start = Instant::now();
        let mut tcp = TcpStream::connect_timeout(&addr, budget).map_err(io_msg)?;
        out.connect_ms = ms_since(connect_start);
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.cfg.sni.clone())
            .map_err(|_| format!("invalid sni {:?}", self.cfg.sni))?;
        let mut conn = rustls::ClientConnection::new(self.tls.clone(), server_name)
            .map_err(|e| e.to_string())?;

        let tls_start = Instant::now();
        while conn.is_handshaking() {
            set_io_deadline(&tcp, deadline)?;
            conn.complete_io(&mut tcp).map_err(io_msg)?;
        }
        out.tls_ms = ms_since(tls_start);
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: ipscout/0.1\r\nAccept: text/plain\r\nConnection: close\r\n\r\n",
            self.cfg.path, self.cfg.host_header
        );
        set_io_deadline(&tcp, deadline)?;
        {
            let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
            tls.write_all(request.as_bytes()).map_err(io_msg)?;
        }

        let mut response = Vec::with_capacity(8 * 1024);
        let mut buf = [0u8; 4096];
        loop {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            set_io_deadline(&tcp, deadline)?;
            let read = {
                let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
                tls.read(&mut buf)
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    if out.ttfb_ms == 0 {
                        out.ttfb_ms = ms_since(start).max(1);
                    }
                    response.extend_from_slice(&buf[..n]);
                    if response.len() >= MAX_TRACE_BODY {
                        break;
                    }
                }
                // Peers that skip close_notify still gave us the response.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_msg(e)),
            }
        }

        let text = String::from_utf8_lossy(&response);
        let status = parse_status_line(&text).ok_or_else(|| "malformed response".to_string())?;
        out.status = status;
        if !(200..300).contains(&status) {
            return Err(format!("http_status_{status}"));
        }
        out.trace = parse_trace_body(&text);
        out.ok = true;
        Ok(())
    }
}

/// Lazily built TLS client config shared by all probers in the process.
pub(crate) fn tls_client_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

pub(crate) fn ms_since(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Time left until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

/// Bound the socket's blocking reads/writes by the remaining deadline.
pub(crate) fn set_io_deadline(tcp: &TcpStream, deadline: Instant) -> Result<(), String> {
    let left = remaining(deadline).ok_or_else(timeout_msg)?;
    tcp.set_read_timeout(Some(left)).map_err(io_msg)?;
    tcp.set_write_timeout(Some(left)).map_err(io_msg)?;
    Ok(())
}

pub(crate) fn io_msg(e: std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => timeout_msg(),
        _ => e.to_string(),
    }
}

fn timeout_msg() -> String {
    "timeout".to_string()
}

/// Pull the status code out of an HTTP/1.x status line.
pub(crate) fn parse_status_line(response: &str) -> Option<u16> {
    let line = response.lines().next()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Parse `key=value` lines (the `/cdn-cgi/trace` body format) from whatever
/// follows the header block.
pub(crate) fn parse_trace_body(response: &str) -> BTreeMap<String, String> {
    let body = match response.split_once("\r\n\r\n") {
        Some((_, body)) => body,
        None => return BTreeMap::new(),
    };
    let mut out = BTreeMap::new();
    for line in body.lines() {
        if let Some((k, v)) = line.split_once('=') {
            let k = k.trim();
            if !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                out.insert(k.to_string(), v.trim().to_string());
            }
        }
    }
    out
}
