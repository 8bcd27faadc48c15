//! Target registry: CRUD over monitor targets with lifecycle events.
//!
//! Every mutation goes through here so the event log and the scheduler stay
//! in step with the rows: create/resume launch a probe loop, pause/delete
//! cancel it before returning, and frequency changes restart it.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::db::{DbError, EventKind, MonitorTarget, NewTarget, Store};
use crate::scheduler::Scheduler;

/// Registry error types.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Target not found")]
    NotFound,
    #[error("IP already monitored")]
    DuplicateTarget,
    #[error("Invalid IP address")]
    InvalidIp,
    #[error("Frequency must be between 1 and 3600 seconds")]
    InvalidFrequency,
    #[error("Store error: {0}")]
    Store(DbError),
}

impl From<DbError> for RegistryError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => RegistryError::NotFound,
            DbError::Duplicate => RegistryError::DuplicateTarget,
            other => RegistryError::Store(other),
        }
    }
}

/// Partial update for a target; absent fields stay unchanged, empty strings
/// clear the optional metadata.
#[derive(Debug, Default, Clone)]
pub struct TargetPatch {
    pub frequency_seconds: Option<u32>,
    pub url: Option<String>,
    pub notes: Option<String>,
}

pub struct Registry {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
}

impl Registry {
    pub fn new(store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Create a target and start probing it.
    ///
    /// Concurrent creates for the same IP race on the unique index: exactly
    /// one wins, the rest observe [`RegistryError::DuplicateTarget`].
    pub async fn create(
        &self,
        ip: &str,
        frequency_seconds: u32,
        url: Option<String>,
        notes: Option<String>,
    ) -> Result<MonitorTarget, RegistryError> {
        let ip: IpAddr = ip.trim().parse().map_err(|_| RegistryError::InvalidIp)?;
        validate_frequency(frequency_seconds)?;

        let target = self.store.add_target(&NewTarget {
            ip: ip.to_string(),
            frequency_seconds,
            url: normalize(url),
            notes: normalize(notes),
        })?;

        self.store.record_event(
            Some(target.id),
            EventKind::Start,
            &format!("Started tracking {}", target.ip),
        )?;
        self.scheduler.launch(&target).await;

        Ok(target)
    }

    /// All targets, paused ones included; deleted rows are hidden.
    pub fn list(&self) -> Result<Vec<MonitorTarget>, RegistryError> {
        Ok(self.store.get_targets()?)
    }

    /// Fetch any row, deleted or not. History endpoints go through this.
    pub fn get(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        Ok(self.store.get_target(id)?)
    }

    /// Apply a partial update. A frequency change on an active target
    /// restarts its loop at the new cadence.
    pub async fn update(&self, id: i64, patch: TargetPatch) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.live(id)?;

        let mut cadence_changed = false;
        if let Some(frequency) = patch.frequency_seconds {
            validate_frequency(frequency)?;
            cadence_changed = frequency != target.frequency_seconds;
            target.frequency_seconds = frequency;
        }
        if let Some(url) = patch.url {
            target.url = normalize(Some(url));
        }
        if let Some(notes) = patch.notes {
            target.notes = normalize(Some(notes));
        }

        self.store.update_target(&target)?;

        if cadence_changed && target.is_active {
            self.scheduler.restart(&target).await;
        }

        Ok(target)
    }

    /// Stop probing a target. The probe loop is cancelled before this
    /// returns; repeated pauses are no-ops.
    pub async fn pause(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.live(id)?;
        if !target.is_active {
            return Ok(target);
        }

        self.scheduler.stop(id).await;
        self.store.set_target_state(id, false, false)?;
        self.store
            .record_event(Some(id), EventKind::Stop, "Tracking paused")?;

        target.is_active = false;
        Ok(target)
    }

    /// Resume probing a paused target; no-op when already active.
    pub async fn resume(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.live(id)?;
        if target.is_active {
            return Ok(target);
        }

        self.store.set_target_state(id, true, false)?;
        self.store
            .record_event(Some(id), EventKind::Start, "Tracking resumed")?;

        target.is_active = true;
        self.scheduler.launch(&target).await;
        Ok(target)
    }

    /// Soft-delete: stop the loop, mark the row permanently stopped, keep
    /// its history. Subsequent lifecycle calls observe `NotFound`.
    pub async fn delete(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let mut target = self.live(id)?;

        self.scheduler.stop(id).await;
        self.store.set_target_state(id, false, true)?;
        self.store.record_event(
            Some(id),
            EventKind::Delete,
            "Tracking stopped and target deleted",
        )?;

        target.is_active = false;
        target.is_deleted = true;
        Ok(target)
    }

    fn live(&self, id: i64) -> Result<MonitorTarget, RegistryError> {
        let target = self.store.get_target(id)?;
        if target.is_deleted {
            return Err(RegistryError::NotFound);
        }
        Ok(target)
    }
}

fn validate_frequency(frequency_seconds: u32) -> Result<(), RegistryError> {
    if !(1..=3600).contains(&frequency_seconds) {
        return Err(RegistryError::InvalidFrequency);
    }
    Ok(())
}

fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
