//! Latest-known status of lockers and hardware units.
//!
//! Writes are last-write-wins; a record expires unless refreshed by the next
//! device report.  Lock status changes are always broadcast on
//! `locker-status`; hardware reports are broadcast on `hardware-alerts` only
//! when their severity is warning or error, and errors additionally go to
//! `maintenance-alerts`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{now_ms, CacheClient, PubSub};
use crate::keyspace::Channel;
use crate::metrics::{Metrics, StatusKind, StatusLabels};

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Open,
    Closed,
    Locked,
    Unlocked,
    Jammed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareState {
    Online,
    Offline,
    Degraded,
    Fault,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Warning and error reports are broadcast and listed as problematic.
    pub fn is_notable(self) -> bool {
        matches!(self, Severity::Warning | Severity::Error)
    }
}

/// A lock status report as received from a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReport {
    pub status: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl LockReport {
    pub fn new(status: LockState) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// A hardware-unit status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareReport {
    pub status: HardwareState,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locker_id: String,
    pub status: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareStatus {
    pub hardware_id: String,
    pub status: HardwareState,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StatusBoard {
    locks: CacheClient,
    hardware: CacheClient,
    pubsub: PubSub,
    metrics: Arc<Metrics>,
}

impl StatusBoard {
    /// `locks` and `hardware` must be bound to the lock-status and
    /// hardware-status namespaces respectively.
    pub fn new(
        locks: CacheClient,
        hardware: CacheClient,
        pubsub: PubSub,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            locks,
            hardware,
            pubsub,
            metrics,
        }
    }

    fn count_write(&self, kind: StatusKind) {
        self.metrics
            .status_writes
            .get_or_create(&StatusLabels { kind })
            .inc();
    }

    /// Record a locker's status and broadcast it on `locker-status`.
    pub async fn set_lock_status(
        &self,
        locker_id: &str,
        report: LockReport,
        ttl: Option<Duration>,
    ) -> LockStatus {
        let record = LockStatus {
            locker_id: locker_id.to_string(),
            status: report.status,
            detail: report.detail,
            timestamp: now_ms(),
        };
        self.locks.set(locker_id, &record, ttl).await;
        self.count_write(StatusKind::Locker);
        self.pubsub.publish(Channel::LockerStatus, &record).await;
        debug!(%locker_id, status = ?record.status, "lock status recorded");
        record
    }

    /// Record a hardware unit's status, broadcasting warnings and errors.
    pub async fn set_hardware_status(
        &self,
        hardware_id: &str,
        report: HardwareReport,
        ttl: Option<Duration>,
    ) -> HardwareStatus {
        let record = HardwareStatus {
            hardware_id: hardware_id.to_string(),
            status: report.status,
            severity: report.severity,
            detail: report.detail,
            timestamp: now_ms(),
        };
        self.hardware.set(hardware_id, &record, ttl).await;
        self.count_write(StatusKind::Hardware);
        if record.severity.is_notable() {
            self.pubsub.publish(Channel::HardwareAlerts, &record).await;
        }
        if record.severity == Severity::Error {
            self.pubsub.publish(Channel::MaintenanceAlerts, &record).await;
        }
        debug!(
            %hardware_id,
            status = ?record.status,
            severity = ?record.severity,
            "hardware status recorded"
        );
        record
    }

    pub async fn get_lock_status(&self, locker_id: &str) -> Option<LockStatus> {
        self.locks.get(locker_id).await
    }

    pub async fn get_hardware_status(&self, hardware_id: &str) -> Option<HardwareStatus> {
        self.hardware.get(hardware_id).await
    }

    /// Concurrent lookup of several lockers.  Every requested id is present
    /// in the result; `None` means no current record.
    pub async fn get_many_lock_status(
        &self,
        locker_ids: &[&str],
    ) -> HashMap<String, Option<LockStatus>> {
        let reads = locker_ids.iter().map(|id| self.locks.get::<LockStatus>(id));
        locker_ids
            .iter()
            .map(|id| id.to_string())
            .zip(join_all(reads).await)
            .collect()
    }

    /// Concurrent lookup of several hardware units; see
    /// [`StatusBoard::get_many_lock_status`].
    pub async fn get_many_hardware_status(
        &self,
        hardware_ids: &[&str],
    ) -> HashMap<String, Option<HardwareStatus>> {
        let reads = hardware_ids
            .iter()
            .map(|id| self.hardware.get::<HardwareStatus>(id));
        hardware_ids
            .iter()
            .map(|id| id.to_string())
            .zip(join_all(reads).await)
            .collect()
    }

    /// Snapshot of every hardware unit currently reporting a warning or error,
    /// most severe first.
    pub async fn list_problematic(&self) -> Vec<HardwareStatus> {
        let ids = self.hardware.ids("*").await;
        let reads = ids.iter().map(|id| self.hardware.get::<HardwareStatus>(id));
        let mut problems: Vec<HardwareStatus> = join_all(reads)
            .await
            .into_iter()
            .flatten()
            .filter(|record| record.severity.is_notable())
            .collect();
        problems.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.hardware_id.cmp(&b.hardware_id))
        });
        problems
    }

    /// Drop a locker's status record (e.g. locker decommissioned).
    pub async fn clear_lock_status(&self, locker_id: &str) -> bool {
        self.locks.del(locker_id).await
    }
}
