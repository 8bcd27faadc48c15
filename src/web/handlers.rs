//! HTTP request handlers for the target routes.

use super::{ApiError, ApiJson, AppState};
use crate::db::{EventRecord, MonitorTarget, PingSample};
use crate::probe;
use crate::registry::TargetPatch;
use crate::stats::{self, Insights};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

const EXPORT_PAGE_SIZE: i64 = 500;

// ============================================================================
// Request / response shapes
// ============================================================================

fn default_frequency() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub ip: String,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetRequest {
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub message: String,
    pub id: i64,
}

/// Sample row as exposed on `/logs`; the target id is implied by the path.
#[derive(Debug, Serialize)]
pub struct LogRow {
    pub time: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

impl From<PingSample> for LogRow {
    fn from(s: PingSample) -> Self {
        Self {
            time: s.time,
            latency_ms: s.latency_ms,
            hops: s.hops,
            packet_loss: s.packet_loss,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TracerouteResponse {
    pub target_id: i64,
    pub target_ip: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub hops: Vec<probe::TraceHop>,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_window_minutes() -> i64 {
    stats::DEFAULT_WINDOW_MINUTES
}

fn default_bucket_seconds() -> i64 {
    stats::DEFAULT_BUCKET_SECONDS
}

#[derive(Debug, Deserialize)]
pub struct InsightsQuery {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: i64,
}

fn default_max_hops() -> u32 {
    20
}

fn default_trace_timeout() -> f64 {
    25.0
}

#[derive(Debug, Deserialize)]
pub struct TracerouteQuery {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_trace_timeout")]
    pub timeout: f64,
}

// ============================================================================
// Targets
// ============================================================================

pub async fn handle_create_target(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateTargetRequest>,
) -> Result<Json<TargetStatus>, ApiError> {
    let target = state
        .registry
        .create(&req.ip, req.frequency, req.url, req.notes)
        .await?;

    Ok(Json(TargetStatus {
        message: format!("Started tracking {}", target.ip),
        id: target.id,
    }))
}

pub async fn handle_list_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<MonitorTarget>>, ApiError> {
    Ok(Json(state.registry.list()?))
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<UpdateTargetRequest>,
) -> Result<Json<MonitorTarget>, ApiError> {
    let target = state
        .registry
        .update(
            id,
            TargetPatch {
                frequency_seconds: req.frequency,
                url: req.url,
                notes: req.notes,
            },
        )
        .await?;
    Ok(Json(target))
}

pub async fn handle_pause_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TargetStatus>, ApiError> {
    state.registry.pause(id).await?;
    Ok(Json(TargetStatus {
        message: "Tracking paused".to_string(),
        id,
    }))
}

pub async fn handle_resume_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TargetStatus>, ApiError> {
    state.registry.resume(id).await?;
    Ok(Json(TargetStatus {
        message: "Tracking resumed".to_string(),
        id,
    }))
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TargetStatus>, ApiError> {
    state.registry.delete(id).await?;
    Ok(Json(TargetStatus {
        message: "Target deleted".to_string(),
        id,
    }))
}

// ============================================================================
// Samples & events
// ============================================================================

pub async fn handle_get_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LogRow>>, ApiError> {
    // History endpoints work for deleted targets too.
    state.registry.get(id)?;
    let samples = state.store.recent_samples(id, query.limit)?;
    Ok(Json(samples.into_iter().map(LogRow::from).collect()))
}

/// Streaming CSV export of a target's full raw history, oldest-first.
///
/// Rows are produced page by page from a keyset cursor; the response never
/// materialises the whole result.
pub async fn handle_export_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let target = state.registry.get(id)?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(8);
    let store = state.store.clone();
    let target_ip = target.ip.clone();

    tokio::task::spawn_blocking(move || {
        let header = "time,target_id,target_ip,latency_ms,hops,packet_loss\n";
        if tx.blocking_send(Ok(Bytes::from(header))).is_err() {
            return;
        }

        let mut after: Option<DateTime<Utc>> = None;
        loop {
            let page = match store.samples_page(id, after, EXPORT_PAGE_SIZE) {
                Ok(page) => page,
                Err(e) => {
                    let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
                    return;
                }
            };
            if page.is_empty() {
                return;
            }
            after = page.last().map(|s| s.time);

            let mut chunk = String::new();
            for sample in &page {
                csv_row(&mut chunk, sample, &target_ip);
            }
            if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                return;
            }
        }
    });

    let disposition = format!(
        "attachment; filename=pingmedaddy-target-{}-logs.csv",
        target.id
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

fn csv_row(out: &mut String, sample: &PingSample, target_ip: &str) {
    out.push_str(&sample.time.to_rfc3339());
    out.push(',');
    out.push_str(&sample.target_id.to_string());
    out.push(',');
    out.push_str(target_ip);
    out.push(',');
    if let Some(latency) = sample.latency_ms {
        out.push_str(&latency.to_string());
    }
    out.push(',');
    if let Some(hops) = sample.hops {
        out.push_str(&hops.to_string());
    }
    out.push(',');
    out.push_str(if sample.packet_loss { "1" } else { "0" });
    out.push('\n');
}

pub async fn handle_get_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    state.registry.get(id)?;
    Ok(Json(state.store.events_for_target(id, query.limit.clamp(1, 1000))?))
}

// ============================================================================
// Insights & traceroute
// ============================================================================

pub async fn handle_get_insights(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<Insights>, ApiError> {
    let target = state.registry.get(id)?;
    let insights = stats::compute_insights(
        &state.store,
        &target,
        query.window_minutes,
        query.bucket_seconds,
        Utc::now(),
    )?;
    Ok(Json(insights))
}

pub async fn handle_traceroute(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TracerouteQuery>,
) -> Result<Json<TracerouteResponse>, ApiError> {
    let target = state.registry.get(id)?;

    let max_hops = query.max_hops.clamp(1, 64);
    let timeout = Duration::from_secs_f64(query.timeout.clamp(1.0, 60.0));

    let result = probe::run_traceroute(
        &target.ip,
        max_hops,
        timeout,
        state.settings.traceroute_binary.as_deref(),
    )
    .await?;

    Ok(Json(TracerouteResponse {
        target_id: target.id,
        target_ip: target.ip,
        started_at: result.started_at,
        finished_at: result.finished_at,
        duration_ms: result.duration_ms,
        hops: result.hops,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_row_formats_nulls_as_empty() {
        let time = DateTime::parse_from_rfc3339("2026-03-01T09:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);

        let mut out = String::new();
        csv_row(
            &mut out,
            &PingSample {
                time,
                target_id: 3,
                latency_ms: Some(12.5),
                hops: Some(7),
                packet_loss: false,
            },
            "10.0.0.1",
        );
        assert_eq!(out, "2026-03-01T09:00:00+00:00,3,10.0.0.1,12.5,7,0\n");

        let mut out = String::new();
        csv_row(
            &mut out,
            &PingSample {
                time,
                target_id: 3,
                latency_ms: None,
                hops: None,
                packet_loss: true,
            },
            "10.0.0.1",
        );
        assert_eq!(out, "2026-03-01T09:00:00+00:00,3,10.0.0.1,,,1\n");
    }
}
