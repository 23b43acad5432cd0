// # Entry
//
// One state-machine instance per service name. Fields are only mutated by the
// transition engine (through the dispatcher) and by the housekeeper, both
// while holding the entry's own lock.

use crate::engine::transition::Behavior;
use crate::model::Service;
use crate::workflow::{Direction, UNDEPLOYED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment progress of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Service name (table key)
    pub name: String,

    /// Current step; always a member of the workflow
    pub step: String,

    /// Terminal boundary the entry is heading to
    pub expected: Direction,

    /// A dispatch to the current step's extension is outstanding
    pub in_flight: bool,

    /// When the outstanding dispatch was sent
    pub in_flight_since: Option<DateTime<Utc>>,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// When a provider first announced the service
    pub detected_at: Option<DateTime<Utc>>,

    /// Last committed transition
    pub updated_at: DateTime<Utc>,

    /// Set once the expected boundary is reached; eligible for reaping after
    pub closed_at: Option<DateTime<Utc>>,

    /// Last persisted failure; only a successful step or a new add clears it
    pub last_error: Option<String>,

    /// Live descriptor, enriched by extension replies
    pub service: Service,

    /// Descriptor as the provider last announced it; re-announcements are
    /// compared against this, never against the enriched descriptor
    #[serde(default)]
    pub announced: Service,

    /// Behavior that handles the next non-provider message
    pub behavior: Behavior,

    /// Set by the housekeeper right before the entry leaves the table
    #[serde(skip)]
    pub(crate) removed: bool,
}

impl Entry {
    /// Create an entry at the `undeployed` boundary for a newly announced service
    pub fn new(service: Service, now: DateTime<Utc>) -> Self {
        Self {
            name: service.name.clone(),
            step: UNDEPLOYED.to_string(),
            expected: Direction::Deployed,
            in_flight: false,
            in_flight_since: None,
            created_at: now,
            detected_at: None,
            updated_at: now,
            closed_at: None,
            last_error: None,
            announced: service.clone(),
            service,
            behavior: Behavior::ProviderEntry,
            removed: false,
        }
    }

    /// Start over with a new descriptor, keeping the entry's identity
    pub fn reset(&mut self, service: Service, now: DateTime<Utc>) {
        *self = Entry::new(service, now);
    }

    /// True once the expected boundary has been reached
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub(crate) fn set_in_flight(&mut self, now: DateTime<Utc>) {
        self.in_flight = true;
        self.in_flight_since = Some(now);
    }

    pub(crate) fn clear_in_flight(&mut self) {
        self.in_flight = false;
        self.in_flight_since = None;
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.service.last_error = error.clone();
        self.last_error = Some(error);
    }

    pub(crate) fn clear_error(&mut self) {
        self.service.last_error.clear();
        self.last_error = None;
    }

    /// Closed longer ago than `grace`
    pub fn reapable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.closed_at
            .is_some_and(|closed| now.signed_duration_since(closed) > grace)
    }

    /// In flight longer ago than `timeout`
    pub fn stalled(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.in_flight
            && self
                .in_flight_since
                .is_none_or(|since| now.signed_duration_since(since) > timeout)
    }
}
