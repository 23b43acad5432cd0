//! Dispatcher
//!
//! The single point where messages from every provider and every extension
//! reply queue meet the entry table.
//!
//! ## Routing
//!
//! 1. Validate the envelope (service name, sender prefix).
//! 2. Provider `add` (and provider `update`, treated as a re-announcement)
//!    locks the entry for the name, creating it on first sight. A descriptor
//!    that differs from the one the provider last announced (see
//!    [`Service::diff`]) restarts the entry in place, unless a dispatch is
//!    outstanding, in which case the add is deferred until the provider
//!    announces again. Fields filled in by extension replies never count.
//! 3. Anything else locks an existing entry or is dropped.
//! 4. Provider messages enter through [`Behavior::ProviderEntry`]; replies go
//!    to the entry's current behavior.
//! 5. The resulting dispatch, if any, is sent while the entry lock is still
//!    held, so the in-flight flag is set before the extension can reply.
//!
//! [`Service::diff`]: crate::model::Service::diff

use crate::engine::entry::Entry;
use crate::engine::table::EntryTable;
use crate::engine::transition::{Behavior, Outcome, TransitionEngine};
use crate::engine::{EngineEvent, EventSink};
use crate::error::TransitionError;
use crate::model::{Action, Message, Origin};
use crate::workflow::Workflow;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What happened to a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The transition engine settled on an outcome
    Applied(Outcome),
    /// A changed descriptor arrived while a step was in flight; nothing changed
    Deferred,
    /// No entry exists for the name and the message cannot create one
    UnknownEntry,
}

/// Routes messages to entries and entries' dispatches to extensions
pub struct Dispatcher {
    transitions: TransitionEngine,
    table: Arc<EntryTable>,
    routes: HashMap<String, mpsc::UnboundedSender<Message>>,
    events: EventSink,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// # Parameters
    ///
    /// - `workflow`: pipeline entries walk through
    /// - `table`: shared entry table
    /// - `routes`: inbound queue of every extension, keyed by identity
    /// - `events`: engine event sink
    pub fn new(
        workflow: Arc<Workflow>,
        table: Arc<EntryTable>,
        routes: HashMap<String, mpsc::UnboundedSender<Message>>,
        events: EventSink,
    ) -> Self {
        Self {
            transitions: TransitionEngine::new(workflow),
            table,
            routes,
            events,
        }
    }

    /// Workflow entries walk through
    pub fn workflow(&self) -> &Workflow {
        self.transitions.workflow()
    }

    /// Route one message
    ///
    /// Rejections are logged and emitted as [`EngineEvent::Rejected`]; the
    /// entry concerned is left unchanged.
    pub async fn dispatch(&self, message: Message) -> Result<Delivery, TransitionError> {
        let name = message.service_name().to_string();
        let sender = message.sender.clone();

        let result = self.route(message).await;

        if let Err(err) = &result {
            if err.is_workflow_fault() {
                error!(entry = %name, %sender, kind = err.kind(), "Workflow lookup failed, check configuration: {}", err);
            } else {
                warn!(entry = %name, %sender, kind = err.kind(), "Message rejected: {}", err);
            }
            self.events.emit(EngineEvent::Rejected {
                name,
                kind: err.kind(),
                error: err.to_string(),
            });
        }

        result
    }

    async fn route(&self, mut message: Message) -> Result<Delivery, TransitionError> {
        if message.service_name().is_empty() {
            return Err(TransitionError::InvalidMessage(
                "service name is empty".to_string(),
            ));
        }

        let origin = message.origin().ok_or_else(|| {
            TransitionError::InvalidMessage(format!(
                "sender '{}' is neither a provider nor a provisioner",
                message.sender
            ))
        })?;

        if origin == Origin::Provider && message.action == Action::Update {
            message.action = Action::Add;
        }

        let name = message.service.name.clone();
        let now = Utc::now();

        let mut entry = if origin == Origin::Provider && message.action == Action::Add {
            let (mut entry, created) = self
                .table
                .lock_or_insert(&name, || Entry::new(message.service.clone(), now))
                .await;

            if created {
                info!(entry = %name, provider = %message.sender, "New service detected");
                self.events.emit(EngineEvent::EntryCreated { name: name.clone() });
            } else if !entry.announced.equivalent(&message.service) {
                let changed = entry.announced.diff(&message.service);
                if entry.in_flight {
                    warn!(entry = %name, ?changed, step = %entry.step, "Descriptor changed while a step is in flight, deferring");
                    self.events.emit(EngineEvent::Deferred { name });
                    return Ok(Delivery::Deferred);
                }
                info!(entry = %name, ?changed, "Descriptor changed, restarting entry");
                entry.reset(message.service.clone(), now);
            }
            entry
        } else {
            match self.table.lock(&name).await {
                Some(entry) => entry,
                None => {
                    if origin == Origin::Provisioner {
                        warn!(entry = %name, sender = %message.sender, "Reply for unknown entry dropped");
                    } else {
                        debug!(entry = %name, action = %message.action, "No entry for provider message, dropped");
                    }
                    return Ok(Delivery::UnknownEntry);
                }
            }
        };

        let start = match origin {
            Origin::Provider => Behavior::ProviderEntry,
            Origin::Provisioner => entry.behavior,
        };

        let decision = self.transitions.apply(&mut entry, start, message, now)?;

        let outcome = match decision.dispatch {
            Some(outbound) => self.send(&mut entry, outbound, decision.outcome),
            None => decision.outcome,
        };

        self.report(&name, &outcome);
        Ok(Delivery::Applied(outcome))
    }

    /// Hand a derived message to its extension
    ///
    /// The entry is already marked in flight. If the extension cannot take the
    /// message the flag is cleared again and the failure recorded.
    fn send(&self, entry: &mut Entry, outbound: Message, outcome: Outcome) -> Outcome {
        let step = outbound.destination.clone().unwrap_or_default();
        let action = outbound.action;

        let delivered = match self.routes.get(&step) {
            Some(inbound) => inbound.send(outbound).is_ok(),
            None => false,
        };

        if delivered {
            debug!(entry = %entry.name, %step, %action, "Dispatched");
            self.events.emit(EngineEvent::Dispatched {
                name: entry.name.clone(),
                step,
                action,
            });
            return outcome;
        }

        let err = TransitionError::ExtensionError {
            extension: step.clone(),
            message: format!("extension {} is not accepting messages", step),
        };
        error!(entry = %entry.name, %step, "Dispatch failed: {}", err);
        entry.clear_in_flight();
        entry.record_error(err.to_string());

        Outcome::ExtensionFailed {
            step,
            error: err.to_string(),
        }
    }

    fn report(&self, name: &str, outcome: &Outcome) {
        let name = name.to_string();
        match outcome {
            Outcome::Dispatched { .. } => {}
            Outcome::Closed { step } => {
                info!(entry = %name, %step, "Entry closed");
                self.events.emit(EngineEvent::Closed {
                    name,
                    step: step.clone(),
                });
            }
            Outcome::ExtensionFailed { step, error } => {
                warn!(entry = %name, %step, "Step failed: {}", error);
                self.events.emit(EngineEvent::ExtensionFailed {
                    name,
                    step: step.clone(),
                    error: error.clone(),
                });
            }
            Outcome::Duplicate => {
                debug!(entry = %name, "Duplicate announcement discarded");
                self.events.emit(EngineEvent::Duplicate { name });
            }
        }
    }
}
