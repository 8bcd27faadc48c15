//! Database model types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// A monitored endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorTarget {
    pub id: i64,
    pub ip: String,
    pub frequency_seconds: u32,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub is_deleted: bool,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to create a target; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub ip: String,
    pub frequency_seconds: u32,
    pub url: Option<String>,
    pub notes: Option<String>,
}

/// One probe's recorded outcome.
///
/// A loss sample carries null latency and hops; a reply carries both.
#[derive(Debug, Clone, Serialize)]
pub struct PingSample {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

/// A roll-up row at minute or hour resolution.
///
/// Latency columns are computed over non-loss samples and are all null when
/// every sample in the bucket was a loss.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub bucket: DateTime<Utc>,
    pub target_id: i64,
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub loss_count: i64,
    pub samples: i64,
}

/// Lifecycle event kinds recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Pause,
    Resume,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            "pause" => Some(EventKind::Pause),
            "resume" => Some(EventKind::Resume),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }
}

/// A row of the lifecycle event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    /// Null for system-level events.
    pub target_id: Option<i64>,
    pub event_type: EventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One of the three retention levels samples are stored at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Raw,
    Minute,
    Hour,
}

impl Resolution {
    /// Native bucket width in seconds.
    pub fn bucket_seconds(self) -> i64 {
        match self {
            Resolution::Raw => 1,
            Resolution::Minute => 60,
            Resolution::Hour => 3600,
        }
    }

    /// Retention horizon, or `None` for levels kept indefinitely.
    pub fn retention(self) -> Option<ChronoDuration> {
        match self {
            Resolution::Raw => Some(ChronoDuration::days(3)),
            Resolution::Minute => Some(ChronoDuration::days(30)),
            Resolution::Hour => None,
        }
    }

    /// Roll-up table backing this level, or `None` for raw.
    pub fn table(self) -> Option<&'static str> {
        match self {
            Resolution::Raw => None,
            Resolution::Minute => Some("ping_minute"),
            Resolution::Hour => Some("ping_hour"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::Start,
            EventKind::Stop,
            EventKind::Pause,
            EventKind::Resume,
            EventKind::Delete,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("reboot"), None);
    }

    #[test]
    fn test_resolution_metadata() {
        assert_eq!(Resolution::Raw.bucket_seconds(), 1);
        assert_eq!(Resolution::Minute.bucket_seconds(), 60);
        assert_eq!(Resolution::Hour.bucket_seconds(), 3600);
        assert!(Resolution::Hour.retention().is_none());
        assert_eq!(Resolution::Minute.table(), Some("ping_minute"));
        assert_eq!(Resolution::Raw.table(), None);
    }
}
