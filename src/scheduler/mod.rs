//! Scheduler module: one probe loop per active target.
//!
//! Every loop shares one global concurrency gate, sleeps on deadline
//! arithmetic rather than a free-running ticker, and observes its stop signal
//! at every suspension point so pause/delete return deterministically.

mod retention;
mod rollup;

pub use retention::RetentionManager;
pub use rollup::{floor_to_bucket, RollupManager};

use crate::config::Settings;
use crate::db::{MonitorTarget, PingSample, Store};
use crate::probe;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// How long a graceful shutdown waits for loops before abandoning them.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// Cap on the internal-error backoff inside a loop.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct LoopHandle {
    stop: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// Counters exposed for observability.
#[derive(Default)]
pub struct SchedulerStats {
    /// Ticks whose probe ran past the target's interval.
    pub missed_ticks: AtomicU64,
    /// Samples dropped after a failed write and its retry.
    pub store_errors: AtomicU64,
}

/// The main scheduler orchestrating probe loops, roll-up and retention.
pub struct Scheduler {
    store: Arc<Store>,
    gate: Arc<Semaphore>,
    loops: Arc<RwLock<HashMap<i64, LoopHandle>>>,
    ping_timeout: Duration,
    stats: Arc<SchedulerStats>,
    rollup: RollupManager,
    retention: RetentionManager,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, settings: &Settings) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(settings.ping_concurrency_limit)),
            loops: Arc::new(RwLock::new(HashMap::new())),
            ping_timeout: settings.ping_timeout_duration(),
            stats: Arc::new(SchedulerStats::default()),
            rollup: RollupManager::new(store.clone()),
            retention: RetentionManager::new(store.clone()),
            store,
        }
    }

    /// Launch loops for every active target and start the background tasks.
    ///
    /// Called before the HTTP listener binds, so boot-time targets are probed
    /// from the first accepted request onward.
    pub async fn start(&self) -> Result<(), crate::db::DbError> {
        let targets = self.store.get_active_targets()?;
        tracing::info!("Starting scheduler with {} active targets", targets.len());

        for target in &targets {
            self.launch(target).await;
        }

        self.rollup.start();
        self.retention.start();
        Ok(())
    }

    /// Start a probe loop for the target. No-op when a loop already runs.
    pub async fn launch(&self, target: &MonitorTarget) {
        let mut loops = self.loops.write().await;
        if loops.contains_key(&target.id) {
            return;
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        tracing::info!(target_id = target.id, ip = %target.ip, "Scheduler: launching probe loop");

        let ctx = LoopCtx {
            target_id: target.id,
            ip: target.ip.clone(),
            interval: Duration::from_secs(u64::from(target.frequency_seconds.max(1))),
            ping_timeout: self.ping_timeout,
            store: self.store.clone(),
            gate: self.gate.clone(),
            stats: self.stats.clone(),
        };
        let join = tokio::spawn(run_probe_loop(ctx, stop_rx));

        loops.insert(target.id, LoopHandle { stop: stop_tx, join });
    }

    /// Stop the target's loop, waiting up to the probe timeout for it to
    /// finish. Returns `false` when no loop was running.
    ///
    /// A loop that does not exit within the deadline is abandoned; its
    /// kill-on-drop child reclaims the probe subprocess.
    pub async fn stop(&self, target_id: i64) -> bool {
        let handle = self.loops.write().await.remove(&target_id);
        let Some(handle) = handle else {
            return false;
        };

        let _ = handle.stop.send(());
        match tokio::time::timeout(self.ping_timeout, handle.join).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target_id, "Scheduler: loop did not stop in time, abandoning");
            }
        }
        tracing::info!(target_id, "Scheduler: probe loop stopped");
        true
    }

    /// Restart the target's loop, picking up a changed cadence.
    pub async fn restart(&self, target: &MonitorTarget) {
        self.stop(target.id).await;
        self.launch(target).await;
    }

    /// Whether a loop is currently registered for the target.
    pub async fn is_running(&self, target_id: i64) -> bool {
        self.loops.read().await.contains_key(&target_id)
    }

    /// Signal every loop and wait up to the shutdown deadline for them.
    pub async fn shutdown(&self) {
        self.rollup.stop();
        self.retention.stop();

        let handles: Vec<LoopHandle> = self.loops.write().await.drain().map(|(_, h)| h).collect();
        tracing::info!("Scheduler: shutting down {} probe loops", handles.len());

        for handle in &handles {
            let _ = handle.stop.send(());
        }

        let join_all = async {
            for handle in handles {
                let _ = handle.join.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all).await.is_err() {
            tracing::warn!("Scheduler: shutdown deadline elapsed, abandoning remaining loops");
        }
    }

    /// Ticks that overran their interval since start.
    pub fn missed_ticks(&self) -> u64 {
        self.stats.missed_ticks.load(Ordering::Relaxed)
    }

    /// Samples dropped on store failure since start.
    pub fn store_errors(&self) -> u64 {
        self.stats.store_errors.load(Ordering::Relaxed)
    }
}

struct LoopCtx {
    target_id: i64,
    ip: String,
    interval: Duration,
    ping_timeout: Duration,
    store: Arc<Store>,
    gate: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
}

/// The probe loop for a single target.
///
/// Suspension points (gate, probe, backoff, inter-tick sleep) all race the
/// stop channel, so cancellation is observable everywhere the loop can wait.
async fn run_probe_loop(ctx: LoopCtx, mut stop_rx: broadcast::Receiver<()>) {
    let backoff = ctx.interval.min(MAX_BACKOFF);

    loop {
        let tick_start = Instant::now();

        let permit = tokio::select! {
            _ = stop_rx.recv() => break,
            permit = ctx.gate.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let result = tokio::select! {
            _ = stop_rx.recv() => break,
            result = probe::ping(&ctx.ip, ctx.ping_timeout) => result,
        };

        let sample = PingSample {
            time: Utc::now(),
            target_id: ctx.target_id,
            latency_ms: result.latency_ms,
            hops: result.hops,
            packet_loss: result.packet_loss,
        };

        // One immediate retry; after that the sample is dropped and the loop
        // backs off before returning to its cadence.
        let mut write_failed = false;
        if let Err(first) = ctx.store.insert_sample(&sample) {
            if let Err(second) = ctx.store.insert_sample(&sample) {
                ctx.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    target_id = ctx.target_id,
                    %first,
                    %second,
                    "Probe loop: dropping sample after failed write and retry"
                );
                write_failed = true;
            }
        }

        drop(permit);

        if write_failed {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            continue;
        }

        let elapsed = tick_start.elapsed();
        if elapsed >= ctx.interval {
            ctx.stats.missed_ticks.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(ctx.interval - elapsed) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewTarget;
    use tempfile::NamedTempFile;

    fn test_setup() -> (NamedTempFile, Arc<Store>, Scheduler) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut settings = Settings::default();
        settings.ping_timeout = 0.2;
        let scheduler = Scheduler::new(store.clone(), &settings);
        (tmp, store, scheduler)
    }

    fn idle_target(store: &Store, ip: &str) -> MonitorTarget {
        store
            .add_target(&NewTarget {
                ip: ip.to_string(),
                // Long cadence: the loop probes at most once during a test.
                frequency_seconds: 3600,
                url: None,
                notes: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let (_tmp, store, scheduler) = test_setup();
        let target = idle_target(&store, "198.18.0.10");

        scheduler.launch(&target).await;
        scheduler.launch(&target).await;
        assert!(scheduler.is_running(target.id).await);
        assert_eq!(scheduler.loops.read().await.len(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_removes_loop_and_reports() {
        let (_tmp, store, scheduler) = test_setup();
        let target = idle_target(&store, "198.18.0.11");

        scheduler.launch(&target).await;
        assert!(scheduler.stop(target.id).await);
        assert!(!scheduler.is_running(target.id).await);
        // Second stop has nothing to do.
        assert!(!scheduler.stop(target.id).await);
    }

    #[tokio::test]
    async fn test_shutdown_clears_all_loops() {
        let (_tmp, store, scheduler) = test_setup();
        let a = idle_target(&store, "198.18.0.12");
        let b = idle_target(&store, "198.18.0.13");

        scheduler.launch(&a).await;
        scheduler.launch(&b).await;
        scheduler.shutdown().await;

        assert!(!scheduler.is_running(a.id).await);
        assert!(!scheduler.is_running(b.id).await);
    }

    #[tokio::test]
    async fn test_start_launches_only_active_targets() {
        let (_tmp, store, scheduler) = test_setup();
        let active = idle_target(&store, "198.18.0.14");
        let paused = idle_target(&store, "198.18.0.15");
        store.set_target_state(paused.id, false, false).unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running(active.id).await);
        assert!(!scheduler.is_running(paused.id).await);

        scheduler.shutdown().await;
    }
}
