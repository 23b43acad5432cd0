// # Housekeeper
//
// Periodic sweep over the entry table:
//
// - entries closed longer ago than the grace period are reaped
// - entries in flight longer than the timeout get their dispatch cancelled
//   and an `ExtensionTimeout` recorded, so the next provider `add` retries
//
// Each entry is handled under its own lock; the table lock is only taken to
// list handles and to drop reaped slots.

use crate::config::MAX_HOUSEKEEPING_INTERVAL_SECS;
use crate::engine::table::EntryTable;
use crate::engine::{EngineEvent, EventSink};
use crate::error::TransitionError;
use crate::state::SnapshotStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Names touched by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed from the table
    pub reaped: Vec<String>,
    /// Entries whose outstanding dispatch was cancelled
    pub timed_out: Vec<String>,
}

impl SweepReport {
    /// True when the sweep changed nothing
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.timed_out.is_empty()
    }
}

/// Reaps closed entries and times out stalled dispatches
pub struct Housekeeper {
    table: Arc<EntryTable>,
    grace: chrono::Duration,
    timeout: chrono::Duration,
    interval: Duration,
    events: EventSink,
    snapshot: Option<Arc<SnapshotStore>>,
}

impl Housekeeper {
    /// Create a housekeeper
    ///
    /// # Parameters
    ///
    /// - `table`: shared entry table
    /// - `grace`: how long closed entries are retained
    /// - `timeout`: how long a dispatch may stay unanswered
    /// - `interval`: sweep period used by [`Housekeeper::run`]
    /// - `events`: engine event sink
    pub fn new(
        table: Arc<EntryTable>,
        grace: Duration,
        timeout: Duration,
        interval: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            table,
            grace: to_chrono(grace),
            timeout: to_chrono(timeout),
            interval,
            events,
            snapshot: None,
        }
    }

    /// Rewrite `snapshot` after every sweep
    pub fn with_snapshot(mut self, snapshot: Arc<SnapshotStore>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Run one sweep as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for (name, handle) in self.table.handles().await {
            let mut entry = handle.lock().await;
            if entry.removed {
                continue;
            }

            if entry.reapable(now, self.grace) {
                entry.removed = true;
                drop(entry);
                self.table.remove_if_same(&name, &handle).await;
                debug!(entry = %name, "Reaped closed entry");
                self.events.emit(EngineEvent::Reaped { name: name.clone() });
                report.reaped.push(name);
                continue;
            }

            if entry.stalled(now, self.timeout) {
                let err = TransitionError::ExtensionTimeout {
                    step: entry.step.clone(),
                    timeout_secs: self.timeout.num_seconds().max(0) as u64,
                };
                warn!(entry = %name, step = %entry.step, "Dispatch timed out: {}", err);
                entry.clear_in_flight();
                entry.record_error(err.to_string());
                entry.updated_at = now;
                self.events.emit(EngineEvent::TimedOut {
                    name: name.clone(),
                    step: entry.step.clone(),
                });
                report.timed_out.push(name);
            }
        }

        if !report.is_empty() {
            info!(
                reaped = report.reaped.len(),
                timed_out = report.timed_out.len(),
                "Housekeeping sweep complete"
            );
        }
        report
    }

    /// Sweep every interval until `stop` flips to true
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let period = self.interval.clamp(
            Duration::from_millis(1),
            Duration::from_secs(MAX_HOUSEKEEPING_INTERVAL_SECS),
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                    self.persist().await;
                }
            }
        }
        debug!("Housekeeper stopped");
    }

    async fn persist(&self) {
        if let Some(snapshot) = &self.snapshot {
            let entries = self.table.snapshot().await;
            if let Err(e) = snapshot.save(&entries).await {
                error!("Failed to write snapshot: {}", e);
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
