//! Single-echo ping via the system tool.
//!
//! Failures of any kind (timeout, missing binary, non-zero exit, unparseable
//! output) are reported as packet loss, never as errors: the probe loop treats
//! loss as a normal observation.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

/// Outcome of one ping probe.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeResult {
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

impl ProbeResult {
    pub fn loss() -> Self {
        Self {
            latency_ms: None,
            hops: None,
            packet_loss: true,
        }
    }

    pub fn reply(latency_ms: f64, hops: i64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            hops: Some(hops),
            packet_loss: false,
        }
    }
}

/// Send exactly one echo request to `ip` and parse the reply.
///
/// The child process is killed if it outlives `timeout`.
pub async fn ping(ip: &str, timeout: Duration) -> ProbeResult {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };

    let child = Command::new("ping")
        .args([count_flag, "1", ip])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(_) => return ProbeResult::loss(),
    };

    // Dropping the in-flight future on timeout kills the child.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) | Err(_) => return ProbeResult::loss(),
    };

    if !output.status.success() {
        return ProbeResult::loss();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_output(&stdout) {
        Some((latency_ms, hops)) => ProbeResult::reply(latency_ms, hops),
        None => ProbeResult::loss(),
    }
}

/// Extract latency and inferred hop count from ping output.
///
/// Hops are derived from the reply TTL against the nearest initial TTL above
/// it (64, 128 or 255). A reply with no TTL field is assumed to come from an
/// adjacent host.
fn parse_ping_output(output: &str) -> Option<(f64, i64)> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let time_re = TIME_RE.get_or_init(|| Regex::new(r"time[=<]([0-9.]+)\s*ms").unwrap());

    let latency_ms: f64 = time_re.captures(output)?.get(1)?.as_str().parse().ok()?;

    static TTL_RE: OnceLock<Regex> = OnceLock::new();
    let ttl_re = TTL_RE.get_or_init(|| Regex::new(r"(?i)ttl=(\d+)").unwrap());

    let ttl: i64 = ttl_re
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(64);

    let initial_ttl = if ttl > 128 {
        255
    } else if ttl > 64 {
        128
    } else {
        64
    };

    Some((latency_ms, initial_ttl - ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_reply() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let (latency, hops) = parse_ping_output(output).unwrap();
        assert!((latency - 12.345).abs() < 1e-9);
        assert_eq!(hops, 128 - 117);
    }

    #[test]
    fn test_parse_windows_reply() {
        let output = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";
        let (latency, hops) = parse_ping_output(output).unwrap();
        assert!((latency - 1.0).abs() < 1e-9);
        assert_eq!(hops, 0);
    }

    #[test]
    fn test_parse_high_ttl_infers_255_start() {
        let output = "64 bytes from 10.0.0.1: icmp_seq=1 ttl=250 time=3.2 ms";
        let (_, hops) = parse_ping_output(output).unwrap();
        assert_eq!(hops, 5);
    }

    #[test]
    fn test_missing_ttl_defaults_to_zero_hops() {
        let output = "64 bytes from 127.0.0.1: icmp_seq=1 time=0.041 ms";
        let (_, hops) = parse_ping_output(output).unwrap();
        assert_eq!(hops, 0);
    }

    #[test]
    fn test_unparseable_output_is_loss() {
        assert!(parse_ping_output("Request timeout for icmp_seq 0").is_none());
        assert!(parse_ping_output("").is_none());
    }

    #[test]
    fn test_loss_result_shape() {
        let loss = ProbeResult::loss();
        assert!(loss.packet_loss);
        assert!(loss.latency_ms.is_none());
        assert!(loss.hops.is_none());

        let reply = ProbeResult::reply(4.2, 3);
        assert!(!reply.packet_loss);
        assert_eq!(reply.hops, Some(3));
    }
}
