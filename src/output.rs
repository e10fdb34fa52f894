//! Output encoders for search results: JSONL, CSV, and a terse text table.

use std::io::Write;

use crate::result::TopResult;

/// Write one JSON object per line.
pub fn write_jsonl<W: Write>(mut w: W, rows: &[TopResult]) -> std::io::Result<()> {
    for r in rows {
        serde_json::to_writer(&mut w, r)?;
        writeln!(w)?;
    }
    Ok(())
}

/// Write a CSV table with a header row.
pub fn write_csv<W: Write>(w: W, rows: &[TopResult]) -> std::io::Result<()> {
    let mut cw = csv::Writer::from_writer(w);
    cw.write_record([
        "rank",
        "ip",
        "prefix",
        "ok",
        "status",
        "connect_ms",
        "tls_ms",
        "ttfb_ms",
        "total_ms",
        "score_ms",
        "samples_prefix",
        "ok_prefix",
        "fail_prefix",
        "download_ok",
        "download_mbps",
        "download_ms",
        "download_bytes",
        "download_error",
        "colo",
    ])
    .map_err(std::io::Error::other)?;

    for (i, r) in rows.iter().enumerate() {
        let colo = r.trace.get("colo").map(String::as_str).unwrap_or("");
        cw.write_record([
            (i + 1).to_string(),
            r.ip.to_string(),
            r.prefix.to_string(),
            r.ok.to_string(),
            r.status.to_string(),
            r.connect_ms.to_string(),
            r.tls_ms.to_string(),
            r.ttfb_ms.to_string(),
            r.total_ms.to_string(),
            format!("{:.2}", r.score_ms),
            r.prefix_samples.to_string(),
            r.prefix_ok.to_string(),
            r.prefix_fail.to_string(),
            r.download_ok.to_string(),
            format!("{:.2}", r.download_mbps),
            r.download_ms.to_string(),
            r.download_bytes.to_string(),
            r.download_error.clone(),
            colo.to_string(),
        ])
        .map_err(std::io::Error::other)?;
    }
    cw.flush()?;
    Ok(())
}

/// Write a tab-separated human-readable listing, best first.
pub fn write_text<W: Write>(mut w: W, rows: &[TopResult]) -> std::io::Result<()> {
    for (i, r) in rows.iter().enumerate() {
        let colo = r.trace.get("colo").map(String::as_str).unwrap_or("");
        let mut line = format!(
            "{}\t{}\t{:.1}ms\tok={}\tstatus={}\tprefix={}\tcolo={}",
            i + 1,
            r.ip,
            r.score_ms,
            r.ok,
            r.status,
            r.prefix,
            colo,
        );
        if r.download_ok || !r.download_error.is_empty() || r.download_ms != 0 {
            line.push_str(&format!(
                "\tdl_ok={}\tdl_mbps={:.2}\tdl_ms={}",
                r.download_ok, r.download_mbps, r.download_ms
            ));
            if !r.download_error.is_empty() {
                line.push_str("\tdl_err=");
                line.push_str(&r.download_error);
            }
        }
        writeln!(w, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(ip: &str, score: f64) -> TopResult {
        let mut trace = BTreeMap::new();
        trace.insert("colo".to_string(), "LAX".to_string());
        TopResult {
            ip: ip.parse().unwrap(),
            prefix: "1.1.0.0/16".parse().unwrap(),
            ok: true,
            status: 200,
            error: String::new(),
            connect_ms: 3,
            tls_ms: 5,
            ttfb_ms: 9,
            total_ms: score as u64,
            score_ms: score,
            trace,
            download_ok: false,
            download_bytes: 0,
            download_ms: 0,
            download_mbps: 0.0,
            download_error: String::new(),
            prefix_samples: 4,
            prefix_ok: 4,
            prefix_fail: 0,
        }
    }

    #[test]
    fn jsonl_is_one_object_per_line() {
        let mut buf = Vec::new();
        write_jsonl(&mut buf, &[row("1.1.1.1", 10.0), row("1.1.1.2", 20.0)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TopResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.ip.to_string(), "1.1.1.1");
        assert_eq!(parsed.trace.get("colo").map(String::as_str), Some("LAX"));
    }

    #[test]
    fn csv_has_header_and_rank() {
        let mut buf = Vec::new();
        write_csv(&mut buf, &[row("1.1.1.1", 10.0)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("rank,ip,prefix"));
        let first = lines.next().unwrap();
        assert!(first.starts_with("1,1.1.1.1,1.1.0.0/16,true,200"));
        assert!(first.ends_with("LAX"));
    }

    #[test]
    fn text_is_rank_ordered() {
        let mut buf = Vec::new();
        write_text(&mut buf, &[row("1.1.1.1", 10.0), row("1.1.1.2", 20.0)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("1\t1.1.1.1\t10.0ms"));
        assert!(text.lines().nth(1).unwrap().starts_with("2\t1.1.1.2"));
    }
}
