//! Command-line front-end re-exposing the service operations.
//!
//! Commands operate directly on the database: lifecycle changes are recorded
//! with the same events the HTTP API emits, and probe loops pick the state up
//! the next time `serve` boots. `ping` and `seed` are standalone utilities.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Subcommand;
use rand::Rng;
use serde_json::json;

use crate::config::Settings;
use crate::db::{DbError, EventKind, NewTarget, PingSample, Store};
use crate::probe;

/// Number of samples per seeding batch insert.
const SEED_CHUNK_SIZE: usize = 10_000;
/// First address of the benchmarking range seeded targets are drawn from.
const SEED_BASE_IP: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler and the HTTP API (the default)
    Serve,
    /// Send a single probe and print the parsed result
    Ping {
        ip: String,
        /// Probe timeout in seconds; defaults to the configured ping_timeout
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Manage monitor targets
    #[command(subcommand)]
    Target(TargetCommand),
    /// Print recent samples for a target, oldest first
    Logs {
        target_id: i64,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Print lifecycle events for a target, newest first
    Events {
        target_id: i64,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Load synthetic ping history for aggregation and retention testing
    Seed {
        #[arg(long, default_value_t = 8)]
        targets: u32,
        #[arg(long, default_value_t = 2.0)]
        days: f64,
        /// Seconds between synthetic samples
        #[arg(long, default_value_t = 60)]
        interval: u32,
        /// Mean packet-loss rate of the generated data
        #[arg(long, default_value_t = 0.02)]
        loss: f64,
    },
}

#[derive(Debug, Subcommand)]
pub enum TargetCommand {
    /// Register a new target
    Add {
        ip: String,
        #[arg(long, default_value_t = 1)]
        frequency: u32,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List all targets, paused ones included
    List,
    Pause { target_id: i64 },
    Resume { target_id: i64 },
    Delete { target_id: i64 },
}

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Execute a CLI command against the configured database.
pub async fn run(command: Command, settings: &Settings, as_json: bool) -> CliResult {
    match command {
        Command::Serve => unreachable!("serve is dispatched in main"),
        Command::Ping { ip, timeout } => {
            let timeout = match timeout {
                None => settings.ping_timeout_duration(),
                Some(secs) => {
                    if !secs.is_finite() || secs <= 0.0 {
                        return Err("Timeout must be a positive number of seconds".into());
                    }
                    Duration::from_secs_f64(secs.min(60.0))
                }
            };
            let result = probe::ping(&ip, timeout).await;
            print_value(
                json!({
                    "ip": ip,
                    "latency_ms": result.latency_ms,
                    "hops": result.hops,
                    "packet_loss": result.packet_loss,
                }),
                as_json,
            );
            Ok(())
        }
        Command::Target(cmd) => run_target(cmd, settings, as_json),
        Command::Logs { target_id, limit } => {
            let store = open_store(settings)?;
            store.get_target(target_id)?;
            let samples = store.recent_samples(target_id, limit)?;
            print_values(
                samples
                    .into_iter()
                    .map(|s| {
                        json!({
                            "time": s.time,
                            "latency_ms": s.latency_ms,
                            "hops": s.hops,
                            "packet_loss": s.packet_loss,
                        })
                    })
                    .collect(),
                as_json,
            );
            Ok(())
        }
        Command::Events { target_id, limit } => {
            let store = open_store(settings)?;
            store.get_target(target_id)?;
            let events = store.events_for_target(target_id, limit)?;
            print_values(
                events
                    .into_iter()
                    .map(|e| serde_json::to_value(e).unwrap_or_default())
                    .collect(),
                as_json,
            );
            Ok(())
        }
        Command::Seed {
            targets,
            days,
            interval,
            loss,
        } => seed(settings, targets, days, interval.clamp(1, 3600), loss, as_json),
    }
}

fn run_target(cmd: TargetCommand, settings: &Settings, as_json: bool) -> CliResult {
    let store = open_store(settings)?;
    match cmd {
        TargetCommand::Add {
            ip,
            frequency,
            url,
            notes,
        } => {
            let ip: IpAddr = ip.trim().parse().map_err(|_| "Invalid IP address")?;
            if !(1..=3600).contains(&frequency) {
                return Err("Frequency must be between 1 and 3600 seconds".into());
            }
            let target = store.add_target(&NewTarget {
                ip: ip.to_string(),
                frequency_seconds: frequency,
                url,
                notes,
            })?;
            store.record_event(
                Some(target.id),
                EventKind::Start,
                &format!("Started tracking {}", target.ip),
            )?;
            print_value(serde_json::to_value(&target)?, as_json);
            Ok(())
        }
        TargetCommand::List => {
            let targets = store.get_targets()?;
            print_values(
                targets
                    .into_iter()
                    .map(|t| serde_json::to_value(t).unwrap_or_default())
                    .collect(),
                as_json,
            );
            Ok(())
        }
        TargetCommand::Pause { target_id } => {
            let target = live_target(&store, target_id)?;
            if target.is_active {
                store.set_target_state(target_id, false, false)?;
                store.record_event(Some(target_id), EventKind::Stop, "Tracking paused")?;
            }
            print_value(json!({ "message": "Tracking paused", "id": target_id }), as_json);
            Ok(())
        }
        TargetCommand::Resume { target_id } => {
            let target = live_target(&store, target_id)?;
            if !target.is_active {
                store.set_target_state(target_id, true, false)?;
                store.record_event(Some(target_id), EventKind::Start, "Tracking resumed")?;
            }
            print_value(json!({ "message": "Tracking resumed", "id": target_id }), as_json);
            Ok(())
        }
        TargetCommand::Delete { target_id } => {
            live_target(&store, target_id)?;
            store.set_target_state(target_id, false, true)?;
            store.record_event(
                Some(target_id),
                EventKind::Delete,
                "Tracking stopped and target deleted",
            )?;
            print_value(json!({ "message": "Target deleted", "id": target_id }), as_json);
            Ok(())
        }
    }
}

/// Generate synthetic targets and history in the benchmarking address range,
/// then roll the seeded span up so aggregate queries work immediately.
fn seed(
    settings: &Settings,
    target_count: u32,
    days: f64,
    interval: u32,
    loss_rate: f64,
    as_json: bool,
) -> CliResult {
    let store = open_store(settings)?;
    let mut rng = rand::thread_rng();

    let now = Utc::now();
    let span = ChronoDuration::seconds((days.max(0.01) * 86_400.0) as i64);
    let start = now - span;

    let base = u32::from(SEED_BASE_IP);
    let mut created = 0u32;
    let mut total_samples = 0usize;
    let mut offset = 0u32;

    while created < target_count {
        let ip = Ipv4Addr::from(base + offset).to_string();
        offset += 1;

        let target = match store.add_target(&NewTarget {
            ip,
            frequency_seconds: interval,
            url: None,
            notes: Some("synthetic seed data".to_string()),
        }) {
            Ok(target) => target,
            Err(DbError::Duplicate) => continue,
            Err(e) => return Err(e.into()),
        };
        created += 1;

        let base_latency = rng.gen_range(8.0..120.0);
        let jitter_ms = rng.gen_range(1.5..18.0);
        let base_hops = rng.gen_range(3..=18i64);
        let target_loss = (loss_rate + rng.gen_range(-0.01..0.01)).clamp(0.0, 0.2);

        let mut chunk: Vec<PingSample> = Vec::with_capacity(SEED_CHUNK_SIZE);
        let mut time = start;
        while time < now {
            chunk.push(simulate_sample(
                &mut rng,
                target.id,
                time,
                base_latency,
                jitter_ms,
                base_hops,
                target_loss,
            ));
            if chunk.len() >= SEED_CHUNK_SIZE {
                total_samples += store.insert_samples(&chunk)?;
                chunk.clear();
            }
            time += ChronoDuration::seconds(i64::from(interval));
        }
        total_samples += store.insert_samples(&chunk)?;
    }

    store.rollup_minute(start, now)?;
    store.rollup_hour(start, now)?;

    print_value(
        json!({ "targets": created, "samples": total_samples }),
        as_json,
    );
    Ok(())
}

fn simulate_sample(
    rng: &mut impl Rng,
    target_id: i64,
    time: DateTime<Utc>,
    base_latency: f64,
    jitter_ms: f64,
    base_hops: i64,
    loss_rate: f64,
) -> PingSample {
    if rng.gen::<f64>() < loss_rate {
        return PingSample {
            time,
            target_id,
            latency_ms: None,
            hops: None,
            packet_loss: true,
        };
    }

    let seasonal = (time.timestamp() as f64 / 86_400.0).sin() * jitter_ms;
    let noise = rng.gen_range(-jitter_ms..jitter_ms);
    let latency = (base_latency + seasonal + noise).max(0.2);
    let hops = (base_hops + rng.gen_range(-1..=1)).max(1);

    PingSample {
        time,
        target_id,
        latency_ms: Some((latency * 10_000.0).round() / 10_000.0),
        hops: Some(hops),
        packet_loss: false,
    }
}

fn open_store(settings: &Settings) -> Result<Arc<Store>, DbError> {
    Ok(Arc::new(Store::new(settings.db_path())?))
}

fn live_target(store: &Store, id: i64) -> Result<crate::db::MonitorTarget, Box<dyn std::error::Error + Send + Sync>> {
    let target = store.get_target(id)?;
    if target.is_deleted {
        return Err(DbError::NotFound.into());
    }
    Ok(target)
}

fn print_value(value: serde_json::Value, as_json: bool) {
    if as_json {
        println!("{}", value);
        return;
    }
    println!("{}", flat_line(&value));
}

fn print_values(values: Vec<serde_json::Value>, as_json: bool) {
    if as_json {
        println!("{}", serde_json::Value::Array(values));
        return;
    }
    for value in values {
        println!("{}", flat_line(&value));
    }
}

fn flat_line(value: &serde_json::Value) -> String {
    match value.as_object() {
        Some(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, flatten(v)))
            .collect::<Vec<_>>()
            .join(" | "),
        None => value.to_string(),
    }
}

fn flatten(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_line_formats_objects() {
        let line = flat_line(&json!({ "id": 1, "ip": "10.0.0.1", "notes": null }));
        assert_eq!(line, "id=1 | ip=10.0.0.1 | notes=null");
    }

    #[tokio::test]
    async fn test_ping_rejects_invalid_timeout() {
        let settings = Settings::default();
        for bad in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let result = run(
                Command::Ping {
                    ip: "127.0.0.1".to_string(),
                    timeout: Some(bad),
                },
                &settings,
                true,
            )
            .await;
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_simulate_sample_respects_loss_invariant() {
        let mut rng = rand::thread_rng();
        let now = Utc::now();
        for _ in 0..200 {
            let sample = simulate_sample(&mut rng, 1, now, 30.0, 5.0, 8, 0.5);
            if sample.packet_loss {
                assert!(sample.latency_ms.is_none());
                assert!(sample.hops.is_none());
            } else {
                assert!(sample.latency_ms.unwrap() >= 0.2);
                assert!(sample.hops.unwrap() >= 1);
            }
        }
    }
}
