//! SQLite store implementation.
//!
//! Owns the raw sample log, the minute/hour roll-up tables, target rows and
//! the lifecycle event log. Roll-up is recomputed SQL-side over a caller-given
//! source window, so out-of-order inserts (seeding, CSV re-ingest) converge to
//! the same aggregate rows.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("IP already monitored")]
    Duplicate,
    #[error("Not found")]
    NotFound,
}

/// Timestamp format used for sample rows. Fixed-width fractional seconds keep
/// text comparison equivalent to chronological comparison.
const SAMPLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
/// Bucket columns hold whole seconds (the output format of SQLite `datetime()`).
const BUCKET_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Targets ---

    /// Insert a new target. Fails with [`DbError::Duplicate`] when any row,
    /// active or not, already holds the IP.
    pub fn add_target(&self, new: &NewTarget) -> Result<MonitorTarget, DbError> {
        let created_at = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitor_targets (ip, frequency_seconds, is_active, is_deleted, url, notes, created_at)
             VALUES (?1, ?2, 1, 0, ?3, ?4, ?5)",
            params![
                new.ip,
                new.frequency_seconds,
                new.url,
                new.notes,
                fmt_sample_time(&created_at),
            ],
        )
        .map_err(map_constraint)?;

        let id = conn.last_insert_rowid();
        Ok(MonitorTarget {
            id,
            ip: new.ip.clone(),
            frequency_seconds: new.frequency_seconds,
            is_active: true,
            is_deleted: false,
            url: new.url.clone(),
            notes: new.notes.clone(),
            created_at,
        })
    }

    /// Fetch a target by id, deleted rows included.
    pub fn get_target(&self, id: i64) -> Result<MonitorTarget, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM monitor_targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            row_to_target,
        )
        .map_err(map_not_found)
    }

    /// All non-deleted targets ordered by id; paused targets included.
    pub fn get_targets(&self) -> Result<Vec<MonitorTarget>, DbError> {
        self.select_targets("is_deleted = 0")
    }

    /// Targets that should have a running probe loop.
    pub fn get_active_targets(&self) -> Result<Vec<MonitorTarget>, DbError> {
        self.select_targets("is_active = 1 AND is_deleted = 0")
    }

    fn select_targets(&self, filter: &str) -> Result<Vec<MonitorTarget>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM monitor_targets WHERE {} ORDER BY id",
            TARGET_COLUMNS, filter
        ))?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Overwrite the mutable metadata of a target.
    pub fn update_target(&self, target: &MonitorTarget) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE monitor_targets SET frequency_seconds = ?1, url = ?2, notes = ?3 WHERE id = ?4",
            params![target.frequency_seconds, target.url, target.notes, target.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Flip the lifecycle flags of a target.
    pub fn set_target_state(&self, id: i64, is_active: bool, is_deleted: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE monitor_targets SET is_active = ?1, is_deleted = ?2 WHERE id = ?3",
            params![is_active, is_deleted, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Raw samples ---

    /// Append one sample. Idempotent on `(time, target_id)`: a duplicate insert
    /// is a no-op and returns `false`.
    pub fn insert_sample(&self, sample: &PingSample) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ping_logs (time, target_id, latency_ms, hops, packet_loss)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fmt_sample_time(&sample.time),
                sample.target_id,
                sample.latency_ms,
                sample.hops,
                sample.packet_loss,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Append a batch of samples atomically, with the same idempotence as
    /// [`Store::insert_sample`]. Returns the number actually inserted.
    pub fn insert_samples(&self, samples: &[PingSample]) -> Result<usize, DbError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO ping_logs (time, target_id, latency_ms, hops, packet_loss)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for s in samples {
                inserted += stmt.execute(params![
                    fmt_sample_time(&s.time),
                    s.target_id,
                    s.latency_ms,
                    s.hops,
                    s.packet_loss,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Latest `limit` samples for a target, returned oldest-first.
    pub fn recent_samples(&self, target_id: i64, limit: i64) -> Result<Vec<PingSample>, DbError> {
        let limit = limit.clamp(1, 1000);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let mut samples = stmt
            .query_map(params![target_id, limit], row_to_sample)?
            .collect::<SqlResult<Vec<_>>>()?;
        samples.reverse();
        Ok(samples)
    }

    /// Samples in `[from, to)`, newest `max` of them, returned oldest-first.
    pub fn samples_in_range(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max: i64,
    ) -> Result<Vec<PingSample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time >= ?2 AND time < ?3
             ORDER BY time DESC LIMIT ?4",
        )?;
        let mut samples = stmt
            .query_map(
                params![target_id, fmt_sample_time(&from), fmt_sample_time(&to), max],
                row_to_sample,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        samples.reverse();
        Ok(samples)
    }

    /// One page of a target's samples within `[from, to)`, ascending.
    ///
    /// The first page passes `after = None`; subsequent pages pass the `time`
    /// of the last row of the previous page. Lets callers aggregate over
    /// windows too large to hold in memory.
    pub fn samples_page_in_range(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        page_size: i64,
    ) -> Result<Vec<PingSample>, DbError> {
        let (op, floor) = match after {
            Some(t) => (">", fmt_sample_time(&t)),
            None => (">=", fmt_sample_time(&from)),
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time {} ?2 AND time < ?3 ORDER BY time ASC LIMIT ?4",
            op
        ))?;
        let samples = stmt
            .query_map(
                params![target_id, floor, fmt_sample_time(&to), page_size],
                row_to_sample,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Keyset cursor over a target's full history in ascending time order.
    ///
    /// Pass the `time` of the last row of the previous page as `after`; the
    /// caller never holds more than one page in memory.
    pub fn samples_page(
        &self,
        target_id: i64,
        after: Option<DateTime<Utc>>,
        page_size: i64,
    ) -> Result<Vec<PingSample>, DbError> {
        let floor = after
            .map(|t| fmt_sample_time(&t))
            .unwrap_or_else(|| "".to_string());
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time > ?2 ORDER BY time ASC LIMIT ?3",
        )?;
        let samples = stmt
            .query_map(params![target_id, floor, page_size], row_to_sample)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    // --- Roll-up ---

    /// Recompute minute aggregates for every bucket sourced from raw samples
    /// in `[from, to)`. Existing rows are overwritten, so repeated runs and
    /// late-arriving samples converge.
    pub fn rollup_minute(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO ping_minute (bucket, target_id, avg_latency, min_latency, max_latency, loss_count, samples)
             SELECT datetime((CAST(strftime('%s', time) AS INTEGER) / 60) * 60, 'unixepoch'),
                    target_id,
                    AVG(latency_ms),
                    MIN(latency_ms),
                    MAX(latency_ms),
                    SUM(packet_loss),
                    COUNT(*)
             FROM ping_logs
             WHERE time >= ?1 AND time < ?2
             GROUP BY datetime((CAST(strftime('%s', time) AS INTEGER) / 60) * 60, 'unixepoch'), target_id
             ON CONFLICT (bucket, target_id) DO UPDATE SET
                 avg_latency = excluded.avg_latency,
                 min_latency = excluded.min_latency,
                 max_latency = excluded.max_latency,
                 loss_count = excluded.loss_count,
                 samples = excluded.samples",
            params![fmt_sample_time(&from), fmt_sample_time(&to)],
        )?;
        Ok(changed)
    }

    /// Recompute hour aggregates from the minute level over `[from, to)`.
    /// Averages are weighted by per-minute non-loss sample counts.
    pub fn rollup_hour(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO ping_hour (bucket, target_id, avg_latency, min_latency, max_latency, loss_count, samples)
             SELECT datetime((CAST(strftime('%s', bucket) AS INTEGER) / 3600) * 3600, 'unixepoch'),
                    target_id,
                    SUM(avg_latency * (samples - loss_count)) / NULLIF(SUM(samples - loss_count), 0),
                    MIN(min_latency),
                    MAX(max_latency),
                    SUM(loss_count),
                    SUM(samples)
             FROM ping_minute
             WHERE bucket >= ?1 AND bucket < ?2
             GROUP BY datetime((CAST(strftime('%s', bucket) AS INTEGER) / 3600) * 3600, 'unixepoch'), target_id
             ON CONFLICT (bucket, target_id) DO UPDATE SET
                 avg_latency = excluded.avg_latency,
                 min_latency = excluded.min_latency,
                 max_latency = excluded.max_latency,
                 loss_count = excluded.loss_count,
                 samples = excluded.samples",
            params![fmt_bucket_time(&from), fmt_bucket_time(&to)],
        )?;
        Ok(changed)
    }

    /// Aggregate rows for one target in `[from, to)`, oldest-first.
    /// `resolution` must be a roll-up level, not raw.
    pub fn aggregate_range(
        &self,
        resolution: Resolution,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateRow>, DbError> {
        let table = resolution
            .table()
            .ok_or_else(|| DbError::Migration("raw level has no aggregate table".to_string()))?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT bucket, target_id, avg_latency, min_latency, max_latency, loss_count, samples
             FROM {} WHERE target_id = ?1 AND bucket >= ?2 AND bucket < ?3 ORDER BY bucket ASC",
            table
        ))?;
        let rows = stmt
            .query_map(
                params![target_id, fmt_bucket_time(&from), fmt_bucket_time(&to)],
                row_to_aggregate,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Retention ---

    /// Delete raw samples older than the cutoff. Returns rows removed.
    pub fn purge_raw_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM ping_logs WHERE time < ?1",
            params![fmt_sample_time(&cutoff)],
        )?)
    }

    /// Delete minute aggregates older than the cutoff. Returns rows removed.
    pub fn purge_minute_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM ping_minute WHERE bucket < ?1",
            params![fmt_bucket_time(&cutoff)],
        )?)
    }

    // --- Events ---

    /// Append a lifecycle event; `target_id` is null for system events.
    pub fn record_event(
        &self,
        target_id: Option<i64>,
        kind: EventKind,
        message: &str,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_logs (target_id, event_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![target_id, kind.as_str(), message, fmt_sample_time(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events for one target, newest-first.
    pub fn events_for_target(&self, target_id: i64, limit: i64) -> Result<Vec<EventRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, event_type, message, created_at FROM event_logs
             WHERE target_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![target_id, limit], row_to_event)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

const TARGET_COLUMNS: &str =
    "id, ip, frequency_seconds, is_active, is_deleted, url, notes, created_at";

fn row_to_target(row: &rusqlite::Row<'_>) -> SqlResult<MonitorTarget> {
    let created: String = row.get(7)?;
    Ok(MonitorTarget {
        id: row.get(0)?,
        ip: row.get(1)?,
        frequency_seconds: row.get(2)?,
        is_active: row.get(3)?,
        is_deleted: row.get(4)?,
        url: row.get(5)?,
        notes: row.get(6)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> SqlResult<PingSample> {
    let time: String = row.get(0)?;
    Ok(PingSample {
        time: parse_db_time(&time).unwrap_or_else(Utc::now),
        target_id: row.get(1)?,
        latency_ms: row.get(2)?,
        hops: row.get(3)?,
        packet_loss: row.get(4)?,
    })
}

fn row_to_aggregate(row: &rusqlite::Row<'_>) -> SqlResult<AggregateRow> {
    let bucket: String = row.get(0)?;
    Ok(AggregateRow {
        bucket: parse_db_time(&bucket).unwrap_or_else(Utc::now),
        target_id: row.get(1)?,
        avg_latency: row.get(2)?,
        min_latency: row.get(3)?,
        max_latency: row.get(4)?,
        loss_count: row.get(5)?,
        samples: row.get(6)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> SqlResult<EventRecord> {
    let kind: String = row.get(2)?;
    let created: String = row.get(4)?;
    Ok(EventRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        event_type: EventKind::parse(&kind).unwrap_or(EventKind::Stop),
        message: row.get(3)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn map_constraint(e: rusqlite::Error) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DbError::Duplicate
        }
        _ => DbError::Sqlite(e),
    }
}

fn map_not_found(e: rusqlite::Error) -> DbError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
        other => DbError::Sqlite(other),
    }
}

pub(crate) fn fmt_sample_time(t: &DateTime<Utc>) -> String {
    t.format(SAMPLE_TIME_FORMAT).to_string()
}

pub(crate) fn fmt_bucket_time(t: &DateTime<Utc>) -> String {
    t.format(BUCKET_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database or a re-ingested export.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn sample(target_id: i64, time: DateTime<Utc>, latency: Option<f64>) -> PingSample {
        PingSample {
            time,
            target_id,
            latency_ms: latency,
            hops: latency.map(|_| 7),
            packet_loss: latency.is_none(),
        }
    }

    #[test]
    fn test_target_crud() {
        let (_tmp, store) = test_store();

        let target = store
            .add_target(&NewTarget {
                ip: "192.168.1.254".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: Some("gateway".to_string()),
            })
            .unwrap();
        assert!(target.id > 0);
        assert!(target.is_active);

        let fetched = store.get_target(target.id).unwrap();
        assert_eq!(fetched.ip, "192.168.1.254");
        assert_eq!(fetched.notes.as_deref(), Some("gateway"));

        let mut updated = fetched;
        updated.frequency_seconds = 30;
        updated.notes = None;
        store.update_target(&updated).unwrap();
        let fetched = store.get_target(target.id).unwrap();
        assert_eq!(fetched.frequency_seconds, 30);
        assert!(fetched.notes.is_none());

        store.set_target_state(target.id, false, true).unwrap();
        let fetched = store.get_target(target.id).unwrap();
        assert!(!fetched.is_active);
        assert!(fetched.is_deleted);
        assert!(store.get_targets().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_ip_rejected_even_after_delete() {
        let (_tmp, store) = test_store();
        let new = NewTarget {
            ip: "10.0.0.1".to_string(),
            frequency_seconds: 5,
            url: None,
            notes: None,
        };

        let first = store.add_target(&new).unwrap();
        assert!(matches!(store.add_target(&new), Err(DbError::Duplicate)));

        // Soft-deleted rows still hold the IP.
        store.set_target_state(first.id, false, true).unwrap();
        assert!(matches!(store.add_target(&new), Err(DbError::Duplicate)));
    }

    #[test]
    fn test_insert_sample_idempotent() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.2".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let s = sample(target.id, t, Some(12.5));
        assert!(store.insert_sample(&s).unwrap());
        assert!(!store.insert_sample(&s).unwrap());

        let batch = vec![
            s.clone(),
            sample(target.id, t + ChronoDuration::seconds(1), Some(13.0)),
            sample(target.id, t + ChronoDuration::seconds(2), None),
        ];
        // One row of the batch already exists.
        assert_eq!(store.insert_samples(&batch).unwrap(), 2);

        let rows = store.recent_samples(target.id, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].time < w[1].time));
        assert!(rows[2].packet_loss);
        assert!(rows[2].latency_ms.is_none());
    }

    #[test]
    fn test_rollup_minute_counts_every_sample() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.3".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut batch = Vec::new();
        // First minute: 4 replies + 2 losses, second minute: 3 replies.
        for i in 0..4 {
            batch.push(sample(target.id, base + ChronoDuration::seconds(i * 10), Some(10.0 + i as f64)));
        }
        for i in 0..2 {
            batch.push(sample(target.id, base + ChronoDuration::seconds(45 + i), None));
        }
        for i in 0..3 {
            batch.push(sample(target.id, base + ChronoDuration::seconds(60 + i * 15), Some(20.0)));
        }
        store.insert_samples(&batch).unwrap();

        store
            .rollup_minute(base, base + ChronoDuration::minutes(2))
            .unwrap();

        let rows = store
            .aggregate_range(Resolution::Minute, target.id, base, base + ChronoDuration::minutes(2))
            .unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].bucket, base);
        assert_eq!(rows[0].samples, 6);
        assert_eq!(rows[0].loss_count, 2);
        assert_eq!(rows[0].min_latency, Some(10.0));
        assert_eq!(rows[0].max_latency, Some(13.0));
        assert!((rows[0].avg_latency.unwrap() - 11.5).abs() < 1e-9);

        assert_eq!(rows[1].samples, 3);
        assert_eq!(rows[1].loss_count, 0);
        assert_eq!(rows[1].avg_latency, Some(20.0));
    }

    #[test]
    fn test_rollup_is_recomputed_after_late_insert() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.4".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        store
            .insert_sample(&sample(target.id, base, Some(10.0)))
            .unwrap();
        store.rollup_minute(base, base + ChronoDuration::minutes(1)).unwrap();

        // An out-of-order sample lands in the already-materialised bucket.
        store
            .insert_sample(&sample(target.id, base + ChronoDuration::seconds(30), Some(30.0)))
            .unwrap();
        store.rollup_minute(base, base + ChronoDuration::minutes(1)).unwrap();

        let rows = store
            .aggregate_range(Resolution::Minute, target.id, base, base + ChronoDuration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].samples, 2);
        assert_eq!(rows[0].avg_latency, Some(20.0));
    }

    #[test]
    fn test_rollup_hour_weights_by_sample_count() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.5".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let hour = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut batch = Vec::new();
        // Minute one: 3 samples at 10 ms; minute two: 1 sample at 50 ms.
        for i in 0..3 {
            batch.push(sample(target.id, hour + ChronoDuration::seconds(i * 20), Some(10.0)));
        }
        batch.push(sample(target.id, hour + ChronoDuration::seconds(60), Some(50.0)));
        store.insert_samples(&batch).unwrap();

        store.rollup_minute(hour, hour + ChronoDuration::hours(1)).unwrap();
        store.rollup_hour(hour, hour + ChronoDuration::hours(1)).unwrap();

        let rows = store
            .aggregate_range(Resolution::Hour, target.id, hour, hour + ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].samples, 4);
        // Weighted: (3 * 10 + 1 * 50) / 4, not the 30.0 a bucket average would give.
        assert!((rows[0].avg_latency.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(rows[0].min_latency, Some(10.0));
        assert_eq!(rows[0].max_latency, Some(50.0));
    }

    #[test]
    fn test_all_loss_bucket_has_null_latency() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.6".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        for i in 0..3 {
            store
                .insert_sample(&sample(target.id, base + ChronoDuration::seconds(i), None))
                .unwrap();
        }
        store.rollup_minute(base, base + ChronoDuration::minutes(1)).unwrap();

        let rows = store
            .aggregate_range(Resolution::Minute, target.id, base, base + ChronoDuration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].loss_count, 3);
        assert_eq!(rows[0].samples, 3);
        assert!(rows[0].avg_latency.is_none());
        assert!(rows[0].min_latency.is_none());
        assert!(rows[0].max_latency.is_none());
    }

    #[test]
    fn test_retention_purges_old_rows() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.7".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let fresh = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.insert_sample(&sample(target.id, old, Some(5.0))).unwrap();
        store.insert_sample(&sample(target.id, fresh, Some(5.0))).unwrap();
        store.rollup_minute(old, fresh + ChronoDuration::minutes(1)).unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(store.purge_raw_before(cutoff).unwrap(), 1);
        assert_eq!(store.purge_minute_before(cutoff).unwrap(), 1);

        let remaining = store.recent_samples(target.id, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].time, fresh);
    }

    #[test]
    fn test_samples_page_walks_history_in_order() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.8".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let batch: Vec<_> = (0..7)
            .map(|i| sample(target.id, base + ChronoDuration::seconds(i), Some(i as f64)))
            .collect();
        store.insert_samples(&batch).unwrap();

        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store.samples_page(target.id, after, 3).unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|s| s.time);
            seen.extend(page);
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_samples_page_in_range_respects_bounds() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.10".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let batch: Vec<_> = (0..10)
            .map(|i| sample(target.id, base + ChronoDuration::seconds(i), Some(i as f64)))
            .collect();
        store.insert_samples(&batch).unwrap();

        // Window [base+2, base+8): samples 2..=7, walked in pages of 3.
        let from = base + ChronoDuration::seconds(2);
        let to = base + ChronoDuration::seconds(8);
        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store
                .samples_page_in_range(target.id, from, to, after, 3)
                .unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|s| s.time);
            seen.extend(page);
        }

        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0].time, from);
        assert_eq!(seen[5].time, to - ChronoDuration::seconds(1));
        assert!(seen.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_events_newest_first() {
        let (_tmp, store) = test_store();
        let target = store
            .add_target(&NewTarget {
                ip: "10.0.0.9".to_string(),
                frequency_seconds: 1,
                url: None,
                notes: None,
            })
            .unwrap();

        store
            .record_event(Some(target.id), EventKind::Start, "Started tracking 10.0.0.9")
            .unwrap();
        store
            .record_event(Some(target.id), EventKind::Stop, "Tracking paused")
            .unwrap();

        let events = store.events_for_target(target.id, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventKind::Stop);
        assert_eq!(events[1].event_type, EventKind::Start);
    }

    #[test]
    fn test_parse_db_time_accepts_export_formats() {
        assert!(parse_db_time("2026-03-01 09:00:00.123456789").is_some());
        assert!(parse_db_time("2026-03-01 09:00:00").is_some());
        assert!(parse_db_time("2026-03-01T09:00:00.123456789+00:00").is_some());
        assert!(parse_db_time("not a time").is_none());
    }
}
