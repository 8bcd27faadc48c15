//! On-demand traceroute via the system tool.
//!
//! Handles both the Unix `traceroute` and Windows `tracert` dialects.
//! Intermediate-hop timeouts (`*` rows) are ordinary hop entries, not errors;
//! only a missing binary, an overall deadline, or a hard tool failure fail
//! the call.

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

/// Traceroute error types.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Traceroute binary not found on host")]
    ToolUnavailable,
    #[error("Traceroute timed out after {0:?}")]
    ToolTimeout(Duration),
    #[error("Traceroute failed: {0}")]
    Failed(String),
}

/// One parsed hop line.
#[derive(Debug, Clone, Serialize)]
pub struct TraceHop {
    pub hop: i64,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub rtt_ms: Option<f64>,
    pub is_timeout: bool,
    pub raw: String,
}

/// Full traceroute outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub hops: Vec<TraceHop>,
}

/// Run the platform traceroute tool against `ip`.
///
/// The child process is killed when `timeout` elapses.
pub async fn run_traceroute(
    ip: &str,
    max_hops: u32,
    timeout: Duration,
    binary: Option<&str>,
) -> Result<TraceResult, TraceError> {
    let max_hops = max_hops.to_string();
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new(binary.unwrap_or("tracert"));
        cmd.args(["-h", &max_hops, ip]);
        cmd
    } else {
        let mut cmd = Command::new(binary.unwrap_or("traceroute"));
        cmd.args(["-q", "1", "-m", &max_hops, ip]);
        cmd
    };

    let started_at = Utc::now();
    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TraceError::ToolUnavailable
            } else {
                TraceError::Failed(e.to_string())
            }
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(TraceError::Failed(e.to_string())),
        Err(_) => return Err(TraceError::ToolTimeout(timeout)),
    };

    // Exit code 1 is still parseable output (unreachable final hop).
    let code = output.status.code().unwrap_or(-1);
    if code != 0 && code != 1 {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TraceError::Failed(if stderr.is_empty() {
            format!("exit status {}", code)
        } else {
            stderr
        }));
    }

    let finished_at = Utc::now();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hops = stdout.lines().filter_map(parse_hop_line).collect();

    Ok(TraceResult {
        started_at,
        finished_at,
        duration_ms: (finished_at - started_at).num_milliseconds() as f64,
        hops,
    })
}

/// Parse one output line into a hop entry; header and banner lines yield None.
fn parse_hop_line(line: &str) -> Option<TraceHop> {
    static HOP_RE: OnceLock<Regex> = OnceLock::new();
    let hop_re = HOP_RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.*)$").unwrap());

    static IP_RE: OnceLock<Regex> = OnceLock::new();
    let ip_re = IP_RE.get_or_init(|| Regex::new(r"\(([0-9a-fA-F:.]+)\)").unwrap());

    static RTT_RE: OnceLock<Regex> = OnceLock::new();
    let rtt_re = RTT_RE.get_or_init(|| Regex::new(r"(?i)([0-9]+\.?[0-9]*)\s*ms").unwrap());

    let caps = hop_re.captures(line)?;
    let hop: i64 = caps.get(1)?.as_str().parse().ok()?;
    let remainder = caps.get(2)?.as_str();

    let is_timeout = remainder.contains('*');
    let ip = ip_re
        .captures(remainder)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let host = if remainder.starts_with('*') {
        None
    } else {
        remainder.split_whitespace().next().map(str::to_string)
    };
    let rtt_ms = rtt_re
        .captures(remainder)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    Some(TraceHop {
        hop,
        host: host.or_else(|| ip.clone()),
        ip,
        rtt_ms,
        is_timeout,
        raw: line.trim().to_string(),
    })
}
