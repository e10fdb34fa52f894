//! Bulk download throughput measurement for already-ranked IPs.
//!
//! After a search run, the best candidates can be re-tested for sustained
//! throughput: stream `path?bytes=N` from each IP (SNI/Host pinned to the
//! speed-test endpoint), count body bytes against a deadline, and report
//! Mbps. This runs sequentially over the top K rows — a handful of IPs, and
//! parallel downloads would contend for the same uplink anyway.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::probe::{
    io_msg, ms_since, parse_status_line, remaining, set_io_deadline, tls_client_config,
};
use crate::result::TopResult;

/// Configuration for the download prober.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Per-IP download deadline.
    pub timeout: Duration,
    /// How many bytes to request.
    pub bytes: u64,
    /// TLS SNI server name.
    pub sni: String,
    /// HTTP `Host` header.
    pub host: String,
    /// Path to request; `?bytes=N` is appended.
    pub path: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            bytes: 50_000_000,
            sni: "speed.cloudflare.com".to_string(),
            host: "speed.cloudflare.com".to_string(),
            path: "/__down".to_string(),
        }
    }
}

/// Result of one download test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub ok: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub bytes: u64,
    pub total_ms: u64,
    pub mbps: f64,
}

/// Streams the speed-test endpoint from a fixed IP.
#[derive(Debug)]
pub struct DownloadProber {
    cfg: DownloadConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl DownloadProber {
    pub fn new(cfg: DownloadConfig) -> Self {
        Self {
            cfg,
            tls: tls_client_config(),
        }
    }

    /// Download up to `cfg.bytes` from `ip` and measure throughput.
    pub fn download(&self, ip: IpAddr, cancel: &CancelToken) -> DownloadResult {
        let start = Instant::now();
        let deadline = start + self.cfg.timeout;
        let mut out = DownloadResult::default();
        if let Err(error) = self.download_once(ip, deadline, cancel, &mut out) {
            out.ok = false;
            out.error = error;
        }
        out.total_ms = ms_since(start);
        let secs = start.elapsed().as_secs_f64();
        if secs > 0.0 {
            out.mbps = (out.bytes as f64 * 8.0) / secs / 1e6;
        }
        out
    }

    fn download_once(
        &self,
        ip: IpAddr,
        deadline: Instant,
        cancel: &CancelToken,
        out: &mut DownloadResult,
    ) -> Result<(), String> {
        let budget = remaining(deadline).ok_or_else(|| "timeout".to_string())?;
        let mut tcp =
            TcpStream::connect_timeout(&SocketAddr::new(ip, 443), budget).map_err(io_msg)?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.cfg.sni.clone())
            .map_err(|_| format!("invalid sni {:?}", self.cfg.sni))?;
        let mut conn = rustls::ClientConnection::new(self.tls.clone(), server_name)
            .map_err(|e| e.to_string())?;
        while conn.is_handshaking() {
            set_io_deadline(&tcp, deadline)?;
            conn.complete_io(&mut tcp).map_err(io_msg)?;
        }

        let request = format!(
            "GET {}?bytes={} HTTP/1.1\r\nHost: {}\r\nUser-Agent: ipscout/0.1\r\nAccept: application/octet-stream\r\nConnection: close\r\n\r\n",
            self.cfg.path, self.cfg.bytes, self.cfg.host
        );
        set_io_deadline(&tcp, deadline)?;
        {
            let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
            tls.write_all(request.as_bytes()).map_err(io_msg)?;
        }

        // Read the header block first so status failures do not count bytes.
        let mut head = Vec::with_capacity(2048);
        let mut buf = [0u8; 64 * 1024];
        let body_start = loop {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            set_io_deadline(&tcp, deadline)?;
            let n = {
                let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
                tls.read(&mut buf).map_err(io_msg)?
            };
            if n == 0 {
                return Err("connection closed before headers".to_string());
            }
            head.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_header_end(&head) {
                break pos;
            }
            if head.len() > 64 * 1024 {
                return Err("oversized response headers".to_string());
            }
        };

        let header_text = String::from_utf8_lossy(&head[..body_start]);
        let status =
            parse_status_line(&header_text).ok_or_else(|| "malformed response".to_string())?;
        out.status = status;
        if !(200..300).contains(&status) {
            return Err(format!("http_status_{status}"));
        }

        out.bytes = (head.len() - body_start) as u64;
        while out.bytes < self.cfg.bytes {
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
                Ok(n) => out.bytes += n as u64,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_msg(e)),
            }
        }

        out.ok = true;
        Ok(())
    }
}

/// Run the download test over the first `k` rows, annotating them in place.
pub fn measure_top(
    cfg: DownloadConfig,
    rows: &mut [TopResult],
    k: usize,
    cancel: &CancelToken,
) {
    let prober = DownloadProber::new(cfg);
    for row in rows.iter_mut().take(k) {
        if cancel.is_cancelled() {
            return;
        }
        let dr = prober.download(row.ip, cancel);
        debug!(ip = %row.ip, ok = dr.ok, mbps = dr.mbps, ms = dr.total_ms, "download test");
        row.download_ok = dr.ok;
        row.download_bytes = dr.bytes;
        row.download_ms = dr.total_ms;
        row.download_mbps = dr.mbps;
        row.download_error = dr.error;
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
