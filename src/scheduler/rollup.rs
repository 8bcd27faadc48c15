//! Roll-up manager: periodic recomputation of the minute and hour levels.
//!
//! Mirrors a continuous-aggregate refresh policy: each level is refreshed on
//! its own cadence, over a bounded source window, with an end offset that
//! keeps the still-filling bucket out of the tables. Because refresh is a
//! recomputation, late or out-of-order samples inside the source window are
//! folded in on the next run.

use crate::db::{Resolution, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Minute refresh cadence.
const MINUTE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Hour refresh cadence.
const HOUR_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Manager for the two roll-up background tasks.
pub struct RollupManager {
    store: Arc<Store>,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Mutex::new(None),
        }
    }

    /// Start both refresh tasks. Each runs once immediately, then on its
    /// cadence.
    pub fn start(&self) {
        let (stop_tx, _) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(stop_tx.clone());

        let store = self.store.clone();
        let mut stop_rx = stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MINUTE_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => refresh_minute(&store, Utc::now()),
                }
            }
        });

        let store = self.store.clone();
        let mut stop_rx = stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUR_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => refresh_hour(&store, Utc::now()),
                }
            }
        });
    }

    /// Stop both refresh tasks.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Refresh the minute level: all complete minute buckets within raw
/// retention, stopping one bucket short of now.
pub fn refresh_minute(store: &Store, now: DateTime<Utc>) {
    let end = floor_to_bucket(now - ChronoDuration::minutes(1), 60);
    let start = end
        - Resolution::Raw
            .retention()
            .expect("raw level has a retention horizon");

    match store.rollup_minute(start, end) {
        Ok(rows) => {
            tracing::debug!(rows, "Rollup: refreshed minute aggregates");
        }
        Err(e) => {
            tracing::error!("Rollup: minute refresh failed: {}", e);
        }
    }
}

/// Refresh the hour level from the minute tables, one hour behind live.
pub fn refresh_hour(store: &Store, now: DateTime<Utc>) {
    let end = floor_to_bucket(now - ChronoDuration::hours(1), 3600);
    let start = end
        - Resolution::Minute
            .retention()
            .expect("minute level has a retention horizon");

    match store.rollup_hour(start, end) {
        Ok(rows) => {
            tracing::debug!(rows, "Rollup: refreshed hour aggregates");
        }
        Err(e) => {
            tracing::error!("Rollup: hour refresh failed: {}", e);
        }
    }
}

/// Truncate a datetime to the start of its containing bucket.
pub fn floor_to_bucket(dt: DateTime<Utc>, bucket_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(bucket_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTarget, PingSample};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_floor_to_bucket() {
        let dt = Utc.with_ymd_and_hms(2026, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            floor_to_bucket(dt, 60),
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(
            floor_to_bucket(dt, 300),
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap()
        );
        assert_eq!(
            floor_to_bucket(dt, 3600),
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_refresh_never_materialises_current_bucket() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let target = store
            .add_target(&NewTarget {
                ip: "198.18.1.1".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 10, 30).unwrap();
        // One sample well inside the window, one in the still-filling minute.
        store
            .insert_sample(&PingSample {
                time: now - ChronoDuration::minutes(5),
                target_id: target.id,
                latency_ms: Some(9.0),
                hops: Some(4),
                packet_loss: false,
            })
            .unwrap();
        store
            .insert_sample(&PingSample {
                time: now,
                target_id: target.id,
                latency_ms: Some(9.0),
                hops: Some(4),
                packet_loss: false,
            })
            .unwrap();

        refresh_minute(&store, now);

        let rows = store
            .aggregate_range(
                Resolution::Minute,
                target.id,
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket, floor_to_bucket(now, 60) - ChronoDuration::minutes(5));
    }
}
