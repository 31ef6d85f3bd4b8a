//! Background reconciliation of dirty local records with the remote service.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::Acknowledgement;
use crate::models::{EntityKind, now_timestamp};
use crate::repo::{PendingPush, SharedRepository, lock};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// The remote authority records are pushed to.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Create a record remotely and return its remote id.
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<String>;

    async fn update(&self, kind: EntityKind, external_id: &str, payload: &Value) -> Result<()>;
}

pub trait SessionProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// A single record that could not be pushed. Logged and reported, never
/// propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("failed to push {kind} {id}: {reason}")]
pub struct SyncItemFailed {
    pub kind: EntityKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    /// Children left dirty because their parent has no remote id yet.
    pub deferred: usize,
    /// Pushed, but edited again while the push was in flight.
    pub still_dirty: usize,
    pub failures: Vec<SyncItemFailed>,
}

impl SyncReport {
    fn fail(&mut self, item: &PendingPush, err: &anyhow::Error) {
        let failure = SyncItemFailed {
            kind: item.kind,
            id: item.id.clone(),
            reason: format!("{err:#}"),
        };
        warn!(kind = %failure.kind, id = %failure.id, reason = %failure.reason, "sync push failed");
        self.failed += 1;
        self.failures.push(failure);
    }

    #[must_use]
    pub fn pushed(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAuthenticated,
    Offline,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => f.write_str("not authenticated"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was in flight; this trigger did nothing.
    AlreadyRunning,
    Skipped(SkipReason),
    Completed(SyncReport),
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    repo: SharedRepository,
    remote: Arc<dyn RemoteApi>,
    session: Arc<dyn SessionProvider>,
    connectivity: Arc<dyn Connectivity>,
    interval: Duration,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        repo: SharedRepository,
        remote: Arc<dyn RemoteApi>,
        session: Arc<dyn SessionProvider>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        SyncEngine {
            repo,
            remote,
            session,
            connectivity,
            interval: DEFAULT_SYNC_INTERVAL,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Push every record that is dirty right now.
    ///
    /// At most one pass runs at a time. Per-record failures are recorded in
    /// the report and leave the record dirty; only a failure to read the
    /// store is returned as an error.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(_guard) = PassGuard::acquire(&self.in_flight) else {
            debug!("sync pass already running");
            return Ok(PassOutcome::AlreadyRunning);
        };
        if !self.session.is_authenticated() {
            return Ok(PassOutcome::Skipped(SkipReason::NotAuthenticated));
        }
        if !self.connectivity.is_online().await {
            return Ok(PassOutcome::Skipped(SkipReason::Offline));
        }

        let snapshot = lock(&self.repo).dirty_snapshot()?;
        let mut report = SyncReport::default();
        for item in &snapshot {
            self.push(item, &mut report).await;
        }

        info!(
            scanned = snapshot.len(),
            created = report.created,
            updated = report.updated,
            failed = report.failed,
            deferred = report.deferred,
            still_dirty = report.still_dirty,
            "sync pass finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn push(&self, item: &PendingPush, report: &mut SyncReport) {
        let payload = match self.payload(item) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(kind = %item.kind, id = %item.id, "parent not synced yet, deferring");
                report.deferred += 1;
                return;
            }
            Err(e) => return report.fail(item, &e),
        };

        let pushed = match &item.external_id {
            None => self
                .remote
                .create(item.kind, &payload)
                .await
                .map(|external_id| (external_id, true)),
            Some(external_id) => self
                .remote
                .update(item.kind, external_id, &payload)
                .await
                .map(|()| (external_id.clone(), false)),
        };
        let (external_id, created) = match pushed {
            Ok(pushed) => pushed,
            Err(e) => return report.fail(item, &e),
        };

        let ack = lock(&self.repo).acknowledge(
            item.kind,
            &item.id,
            &external_id,
            &now_timestamp(),
            &item.updated_at,
        );
        match ack {
            Ok(Acknowledgement::Missing) => {
                debug!(kind = %item.kind, id = %item.id, "record deleted during push");
                return;
            }
            Ok(Acknowledgement::StillDirty) => report.still_dirty += 1,
            Ok(Acknowledgement::Clean) => {}
            Err(e) => return report.fail(item, &e),
        }
        if created {
            report.created += 1;
        } else {
            report.updated += 1;
        }
        debug!(kind = %item.kind, id = %item.id, %external_id, created, "pushed record");
    }

    /// The record's payload with its parent's remote id attached, or `None`
    /// if the parent has not been pushed yet.
    fn payload(&self, item: &PendingPush) -> Result<Option<Value>> {
        let mut payload = item.payload.clone();
        if let Some(parent) = &item.parent {
            let Some(parent_external_id) = lock(&self.repo).external_id(parent.kind, &parent.id)?
            else {
                return Ok(None);
            };
            if let Some(fields) = payload.as_object_mut() {
                fields.insert(parent.field.to_string(), Value::String(parent_external_id));
            }
        }
        Ok(Some(payload))
    }

    /// Run passes on a timer and whenever connectivity comes back, until
    /// `shutdown` flips to true. The first pass starts immediately. A pass
    /// that is already running when shutdown arrives is allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        mut online: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut was_online = *online.borrow_and_update();
        let mut monitor_open = true;
        let mut passes = JoinSet::new();

        info!(interval_secs = self.interval.as_secs(), "sync engine started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    passes.spawn(Arc::clone(&self).trigger("timer"));
                }
                changed = online.changed(), if monitor_open => {
                    if changed.is_err() {
                        monitor_open = false;
                        continue;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        passes.spawn(Arc::clone(&self).trigger("connectivity"));
                    }
                    was_online = now_online;
                }
                Some(_) = passes.join_next(), if !passes.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while passes.join_next().await.is_some() {}
        info!("sync engine stopped");
    }

    async fn trigger(self: Arc<Self>, source: &'static str) {
        match self.run_pass().await {
            Ok(PassOutcome::Completed(_)) => {}
            Ok(PassOutcome::Skipped(reason)) => debug!(source, %reason, "sync pass skipped"),
            Ok(PassOutcome::AlreadyRunning) => debug!(source, "sync trigger ignored"),
            Err(e) => warn!(source, error = %format!("{e:#}"), "sync pass failed"),
        }
    }
}
