//! Analytics engine: windowed insights over a target's samples.
//!
//! Picks the finest resolution level that still covers the requested window,
//! then computes uptime, latency statistics and a bucketed timeline from it.
//! Percentiles are exact when the raw level serves the window and labelled
//! approximations otherwise.

use crate::db::{AggregateRow, DbError, MonitorTarget, Resolution, Store};
use crate::scheduler::floor_to_bucket;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_BUCKET_SECONDS: i64 = 60;
const MAX_WINDOW_MINUTES: i64 = 24 * 60;
/// Page size for walking a raw window through the keyset cursor.
const RAW_PAGE_SIZE: i64 = 1000;

/// How the percentile fields of a response were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentileMode {
    /// Interpolated over the raw latencies in the window.
    Exact,
    /// Derived from aggregate rows: p50 from the weighted average, p95 from
    /// the decile boundary of bucket maxima, p99 from the overall maximum.
    Approximate,
}

/// One point of the insights timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelinePoint {
    pub bucket: DateTime<Utc>,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub loss_rate: f64,
    pub sample_count: i64,
}

/// Aggregated metrics for one target over a rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct Insights {
    pub target_id: i64,
    pub target_ip: String,
    pub created_at: DateTime<Utc>,
    pub window_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Level that served this response.
    pub resolution: Resolution,
    /// Effective timeline bucket width; never finer than the serving level.
    pub bucket_seconds: i64,
    pub percentile_mode: PercentileMode,
    pub sample_count: i64,
    pub loss_count: i64,
    pub uptime_percent: Option<f64>,
    pub latency_avg_ms: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub timeline: Vec<TimelinePoint>,
}

/// Compute the insights payload for a target.
pub fn compute_insights(
    store: &Store,
    target: &MonitorTarget,
    window_minutes: i64,
    bucket_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Insights, DbError> {
    let window_minutes = window_minutes.clamp(1, MAX_WINDOW_MINUTES);
    let bucket_seconds = bucket_seconds.max(1);

    let window_end = floor_to_bucket(now, bucket_seconds);
    let window_start = window_end - ChronoDuration::minutes(window_minutes);

    let resolution = pick_resolution(window_start, now, bucket_seconds);
    let effective_bucket = bucket_seconds.max(resolution.bucket_seconds());

    let mut insights = Insights {
        target_id: target.id,
        target_ip: target.ip.clone(),
        created_at: target.created_at,
        window_minutes,
        window_start,
        window_end,
        resolution,
        bucket_seconds: effective_bucket,
        percentile_mode: if resolution == Resolution::Raw {
            PercentileMode::Exact
        } else {
            PercentileMode::Approximate
        },
        sample_count: 0,
        loss_count: 0,
        uptime_percent: None,
        latency_avg_ms: None,
        latency_min_ms: None,
        latency_max_ms: None,
        latency_p50_ms: None,
        latency_p95_ms: None,
        latency_p99_ms: None,
        timeline: Vec::new(),
    };

    match resolution {
        Resolution::Raw => {
            fill_from_raw(
                &mut insights,
                store,
                target.id,
                window_start,
                window_end,
                effective_bucket,
            )?;
        }
        Resolution::Minute | Resolution::Hour => {
            let rows = store.aggregate_range(resolution, target.id, window_start, window_end)?;
            fill_from_aggregates(&mut insights, &rows, effective_bucket);
        }
    }

    if insights.sample_count > 0 {
        insights.uptime_percent =
            Some((1.0 - insights.loss_count as f64 / insights.sample_count as f64) * 100.0);
    }

    Ok(insights)
}

/// Finest level whose retention still covers the window start and whose
/// native bucket is no coarser than the requested one.
fn pick_resolution(
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
    bucket_seconds: i64,
) -> Resolution {
    let covers = |res: Resolution| match res.retention() {
        Some(horizon) => window_start >= now - horizon,
        None => true,
    };

    if bucket_seconds < 60 && covers(Resolution::Raw) {
        Resolution::Raw
    } else if bucket_seconds < 3600 && covers(Resolution::Minute) {
        Resolution::Minute
    } else {
        Resolution::Hour
    }
}

/// Aggregate the whole raw window, one cursor page at a time, so every
/// sample in the window counts no matter how large it is.
fn fill_from_raw(
    insights: &mut Insights,
    store: &Store,
    target_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    bucket_seconds: i64,
) -> Result<(), DbError> {
    let mut latencies: Vec<f64> = Vec::new();
    let mut buckets: BTreeMap<i64, RawBucket> = BTreeMap::new();
    let mut after = None;

    loop {
        let page = store.samples_page_in_range(target_id, from, to, after, RAW_PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        after = page.last().map(|s| s.time);

        for sample in &page {
            insights.sample_count += 1;
            if sample.packet_loss {
                insights.loss_count += 1;
            }

            let key = sample.time.timestamp() - sample.time.timestamp().rem_euclid(bucket_seconds);
            let entry = buckets.entry(key).or_default();
            entry.sample_count += 1;
            match (sample.packet_loss, sample.latency_ms) {
                (false, Some(latency)) => {
                    latencies.push(latency);
                    entry.latencies.push(latency);
                }
                _ => entry.loss_count += 1,
            }
        }
    }

    latencies.sort_by(|a, b| a.total_cmp(b));
    if !latencies.is_empty() {
        insights.latency_min_ms = latencies.first().copied();
        insights.latency_max_ms = latencies.last().copied();
        insights.latency_avg_ms = Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
        insights.latency_p50_ms = percentile(&latencies, 0.50);
        insights.latency_p95_ms = percentile(&latencies, 0.95);
        insights.latency_p99_ms = percentile(&latencies, 0.99);
    }

    insights.timeline = buckets
        .into_iter()
        .filter_map(|(key, acc)| {
            let bucket = DateTime::from_timestamp(key, 0)?;
            Some(acc.into_point(bucket))
        })
        .collect();
    Ok(())
}

#[derive(Default)]
struct RawBucket {
    latencies: Vec<f64>,
    loss_count: i64,
    sample_count: i64,
}

impl RawBucket {
    fn into_point(self, bucket: DateTime<Utc>) -> TimelinePoint {
        let (min, max, avg) = if self.latencies.is_empty() {
            (None, None, None)
        } else {
            let min = self.latencies.iter().copied().fold(f64::INFINITY, f64::min);
            let max = self.latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = self.latencies.iter().sum::<f64>() / self.latencies.len() as f64;
            (Some(min), Some(max), Some(avg))
        };
        TimelinePoint {
            bucket,
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            loss_rate: if self.sample_count == 0 {
                0.0
            } else {
                self.loss_count as f64 / self.sample_count as f64
            },
            sample_count: self.sample_count,
        }
    }
}

fn fill_from_aggregates(insights: &mut Insights, rows: &[AggregateRow], bucket_seconds: i64) {
    let mut ok_weight = 0i64;
    let mut weighted_sum = 0.0;
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;
    let mut bucket_maxima: Vec<f64> = Vec::new();

    for row in rows {
        insights.sample_count += row.samples;
        insights.loss_count += row.loss_count;

        let ok = row.samples - row.loss_count;
        if let (Some(avg), true) = (row.avg_latency, ok > 0) {
            weighted_sum += avg * ok as f64;
            ok_weight += ok;
        }
        if let Some(row_min) = row.min_latency {
            min = Some(min.map_or(row_min, |m: f64| m.min(row_min)));
        }
        if let Some(row_max) = row.max_latency {
            max = Some(max.map_or(row_max, |m: f64| m.max(row_max)));
            bucket_maxima.push(row_max);
        }
    }

    if ok_weight > 0 {
        insights.latency_avg_ms = Some(weighted_sum / ok_weight as f64);
    }
    insights.latency_min_ms = min;
    insights.latency_max_ms = max;

    // Approximations: the aggregates carry no distributional data.
    insights.latency_p50_ms = insights.latency_avg_ms;
    bucket_maxima.sort_by(|a, b| a.total_cmp(b));
    insights.latency_p95_ms = percentile(&bucket_maxima, 0.90);
    insights.latency_p99_ms = max;

    let mut grouped: BTreeMap<i64, AggBucket> = BTreeMap::new();
    for row in rows {
        let key = row.bucket.timestamp() - row.bucket.timestamp().rem_euclid(bucket_seconds);
        let entry = grouped.entry(key).or_default();
        entry.samples += row.samples;
        entry.loss_count += row.loss_count;
        let ok = row.samples - row.loss_count;
        if let (Some(avg), true) = (row.avg_latency, ok > 0) {
            entry.weighted_sum += avg * ok as f64;
            entry.ok_weight += ok;
        }
        if let Some(row_min) = row.min_latency {
            entry.min = Some(entry.min.map_or(row_min, |m: f64| m.min(row_min)));
        }
        if let Some(row_max) = row.max_latency {
            entry.max = Some(entry.max.map_or(row_max, |m: f64| m.max(row_max)));
        }
    }

    insights.timeline = grouped
        .into_iter()
        .filter_map(|(key, acc)| {
            let bucket = DateTime::from_timestamp(key, 0)?;
            Some(acc.into_point(bucket))
        })
        .collect();
}

#[derive(Default)]
struct AggBucket {
    samples: i64,
    loss_count: i64,
    weighted_sum: f64,
    ok_weight: i64,
    min: Option<f64>,
    max: Option<f64>,
}

impl AggBucket {
    fn into_point(self, bucket: DateTime<Utc>) -> TimelinePoint {
        TimelinePoint {
            bucket,
            avg_latency_ms: (self.ok_weight > 0).then(|| self.weighted_sum / self.ok_weight as f64),
            min_latency_ms: self.min,
            max_latency_ms: self.max,
            loss_rate: if self.samples == 0 {
                0.0
            } else {
                self.loss_count as f64 / self.samples as f64
            },
            sample_count: self.samples,
        }
    }
}

/// Linearly interpolated percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if p <= 0.0 {
        return sorted.first().copied();
    }
    if p >= 1.0 {
        return sorted.last().copied();
    }
    let k = (sorted.len() - 1) as f64 * p;
    let lower = k.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = k - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}
