//! Retention manager: periodic deletion of data past its retention horizon.
//!
//! Raw samples live 3 days, minute aggregates 30 days; hour aggregates are
//! kept indefinitely.

use crate::db::{Resolution, Store};

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Manager for the retention background task.
pub struct RetentionManager {
    store: Arc<Store>,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Mutex::new(None),
        }
    }

    /// Start the retention sweep task.
    pub fn start(&self) {
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(stop_tx);

        let store = self.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => sweep(&store, Utc::now()),
                }
            }
        });
    }

    /// Stop the retention task.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete everything past its level's retention horizon.
pub fn sweep(store: &Store, now: DateTime<Utc>) {
    if let Some(horizon) = Resolution::Raw.retention() {
        match store.purge_raw_before(now - horizon) {
            Ok(rows) if rows > 0 => {
                tracing::debug!(rows, "Retention: purged raw samples");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Retention: raw purge failed: {}", e);
            }
        }
    }

    if let Some(horizon) = Resolution::Minute.retention() {
        match store.purge_minute_before(now - horizon) {
            Ok(rows) if rows > 0 => {
                tracing::debug!(rows, "Retention: purged minute aggregates");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Retention: minute purge failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTarget, PingSample};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sweep_leaves_fresh_data() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let target = store
            .add_target(&NewTarget {
                ip: "198.18.2.1".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let now = Utc::now();
        let stale = now - ChronoDuration::days(4);
        let fresh = now - ChronoDuration::hours(1);
        for time in [stale, fresh] {
            store
                .insert_sample(&PingSample {
                    time,
                    target_id: target.id,
                    latency_ms: Some(3.0),
                    hops: Some(2),
                    packet_loss: false,
                })
                .unwrap();
        }

        sweep(&store, now);

        let remaining = store.recent_samples(target.id, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].time, fresh);
    }
}
