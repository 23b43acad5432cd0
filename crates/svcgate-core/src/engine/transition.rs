//! Transition engine
//!
//! A closed set of [`Behavior`]s decides what a message does to an entry.
//! Behaviors hand control to each other until one of them settles on an
//! [`Outcome`]:
//!
//! ```text
//!                 add                       advance
//! ProviderEntry ───────▶ ProviderAdd ───────────────────┐
//!      │                                                ▼
//!      │ delete                              ┌──── Provisioner ◀──┐
//!      └───────▶ ProviderDelete ──advance───▶│  (dispatch / reply) │ advance
//!                                            └─────────┬──────────┘
//!                                                      │ terminal
//!                                                      ▼
//!                                                    Close
//! ```
//!
//! Every run works on a draft copy of the entry. The draft is committed only
//! when the outcome changes state; a rejected message (an `Err`) or a
//! duplicate leaves the entry untouched.

use crate::engine::entry::Entry;
use crate::error::TransitionError;
use crate::model::{Action, CORE_SENDER, Message, Origin};
use crate::workflow::{DEPLOYED, Direction, StepKind, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Transition logic attached to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// First contact for provider messages; owns boundaries and provider steps
    ProviderEntry,
    /// Forward traversal on a provider `add`
    ProviderAdd,
    /// Switch to reverse traversal on a provider `delete`
    ProviderDelete,
    /// Dispatch to and collect replies from a provisioner step
    Provisioner,
    /// Terminal: the expected boundary was reached
    Close,
}

/// Settled result of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A message was sent to the extension owning `step`
    Dispatched {
        /// Step now in flight
        step: String,
    },
    /// The entry reached its expected boundary
    Closed {
        /// Boundary reached
        step: String,
    },
    /// The extension owning `step` reported failure
    ExtensionFailed {
        /// Step that failed
        step: String,
        /// Reported error
        error: String,
    },
    /// Re-announcement of work already under way; nothing changed
    Duplicate,
}

impl Outcome {
    /// Whether the draft entry must be committed
    pub fn mutates(&self) -> bool {
        !matches!(self, Outcome::Duplicate)
    }
}

/// What the dispatcher must do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Settled result
    pub outcome: Outcome,
    /// At most one message for one extension
    pub dispatch: Option<Message>,
}

enum Flow {
    Invoke(Behavior),
    Done(Outcome),
}

/// Applies messages to entries according to a workflow
#[derive(Debug, Clone)]
pub struct TransitionEngine {
    workflow: Arc<Workflow>,
}

impl TransitionEngine {
    /// Create an engine over a workflow
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self { workflow }
    }

    /// Workflow the engine walks
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Run `message` through the behaviors starting at `start`
    ///
    /// On `Ok`, `entry` holds the committed state (unchanged for
    /// [`Outcome::Duplicate`]). On `Err`, `entry` is unchanged.
    pub fn apply(
        &self,
        entry: &mut Entry,
        start: Behavior,
        message: Message,
        now: DateTime<Utc>,
    ) -> Result<Decision, TransitionError> {
        let mut run = Run {
            workflow: &self.workflow,
            entry: entry.clone(),
            message,
            dispatch: None,
            entered: false,
            now,
        };

        let mut behavior = start;
        loop {
            trace!(entry = %run.entry.name, step = %run.entry.step, ?behavior, "invoke");
            run.entry.behavior = behavior;
            match run.invoke(behavior)? {
                Flow::Invoke(next) => behavior = next,
                Flow::Done(outcome) => {
                    if outcome.mutates() {
                        run.entry.updated_at = now;
                        *entry = run.entry;
                    }
                    return Ok(Decision {
                        outcome,
                        dispatch: run.dispatch,
                    });
                }
            }
        }
    }
}

/// Working state of one `apply` call
struct Run<'a> {
    workflow: &'a Workflow,
    entry: Entry,
    message: Message,
    dispatch: Option<Message>,
    /// The current step was entered during this run
    entered: bool,
    now: DateTime<Utc>,
}

impl Run<'_> {
    fn invoke(&mut self, behavior: Behavior) -> Result<Flow, TransitionError> {
        match behavior {
            Behavior::ProviderEntry => self.provider_entry(),
            Behavior::ProviderAdd => self.provider_add(),
            Behavior::ProviderDelete => self.provider_delete(),
            Behavior::Provisioner => self.provisioner(),
            Behavior::Close => self.close(),
        }
    }

    fn provider_entry(&mut self) -> Result<Flow, TransitionError> {
        match self.message.action {
            Action::Add => {
                if self.entry.expected != Direction::Deployed {
                    self.entry.expected = Direction::Deployed;
                    self.entry.closed_at = None;
                }
                if self.entry.detected_at.is_none() {
                    self.entry.detected_at = Some(self.now);
                }
                Ok(Flow::Invoke(Behavior::ProviderAdd))
            }
            Action::Delete => Ok(Flow::Invoke(Behavior::ProviderDelete)),
            action => Err(TransitionError::UnhandledAction {
                action,
                sender: self.message.sender.clone(),
            }),
        }
    }

    fn provider_add(&mut self) -> Result<Flow, TransitionError> {
        self.require_provider(Action::Add)?;

        if self.entry.step == DEPLOYED {
            debug!(entry = %self.entry.name, "already deployed, discarding add");
            return Ok(Flow::Done(Outcome::Duplicate));
        }

        let step_kind = self.current_kind()?;
        let provider_owned = step_kind != StepKind::Provisioner;

        if !self.entry.is_closed() && self.entry.last_error.is_none() && !provider_owned {
            debug!(entry = %self.entry.name, step = %self.entry.step, "deployment under way, discarding add");
            return Ok(Flow::Done(Outcome::Duplicate));
        }

        if self.entry.last_error.is_some() && !self.entry.in_flight && !provider_owned {
            debug!(entry = %self.entry.name, step = %self.entry.step, "retrying failed step");
            self.entry.clear_error();
            self.entered = true;
            return Ok(Flow::Invoke(Behavior::Provisioner));
        }

        self.advance()
    }

    fn provider_delete(&mut self) -> Result<Flow, TransitionError> {
        self.require_provider(Action::Delete)?;

        if self.entry.expected == Direction::Undeployed {
            debug!(entry = %self.entry.name, "already undeploying, discarding delete");
            return Ok(Flow::Done(Outcome::Duplicate));
        }

        if self.entry.in_flight {
            // step past the pending step so the reverse walk rolls it back too
            let workflow = self.workflow;
            let next = workflow.next_step(&self.entry.step, false)?;
            self.entry.step = next.name.clone();
            self.entry.clear_in_flight();
        }

        self.entry.expected = Direction::Undeployed;
        self.entry.closed_at = None;
        self.message.service = self.entry.service.clone();

        self.advance()
    }

    fn provisioner(&mut self) -> Result<Flow, TransitionError> {
        if self.entry.in_flight {
            return self.on_reply();
        }

        if !self.entered {
            return Err(TransitionError::ActionNotAllowed {
                action: self.message.action,
                sender: self.message.sender.clone(),
                step: self.entry.step.clone(),
            });
        }

        let action = match self.entry.expected {
            Direction::Deployed => Action::Add,
            Direction::Undeployed => Action::Delete,
        };
        let dispatch =
            Message::new(action, CORE_SENDER, self.entry.service.clone()).to(self.entry.step.clone());

        self.entry.set_in_flight(self.now);
        self.dispatch = Some(dispatch);

        Ok(Flow::Done(Outcome::Dispatched {
            step: self.entry.step.clone(),
        }))
    }

    fn on_reply(&mut self) -> Result<Flow, TransitionError> {
        if self.message.sender != self.entry.step {
            return Err(TransitionError::SenderMismatch {
                expected: self.entry.step.clone(),
                sender: self.message.sender.clone(),
            });
        }

        self.entry.clear_in_flight();

        if let Some(error) = self.message.failure() {
            let error = error.to_string();
            self.entry.record_error(error.clone());
            return Ok(Flow::Done(Outcome::ExtensionFailed {
                step: self.entry.step.clone(),
                error,
            }));
        }

        self.entry.service.merge_reply(&self.message.service);
        self.entry.clear_error();

        self.advance()
    }

    fn close(&mut self) -> Result<Flow, TransitionError> {
        if !self.entered {
            return Err(TransitionError::ActionNotAllowed {
                action: self.message.action,
                sender: self.message.sender.clone(),
                step: self.entry.step.clone(),
            });
        }

        self.entry.closed_at = Some(self.now);
        self.entry.clear_in_flight();
        if let Some(error) = self.message.failure() {
            self.entry.record_error(error.to_string());
        }

        Ok(Flow::Done(Outcome::Closed {
            step: self.entry.step.clone(),
        }))
    }

    /// Move one step in the expected direction and pick the behavior owning it
    ///
    /// Provider steps are traversed without dispatch, except that a provider
    /// `add` walking forward re-enters through [`Behavior::ProviderEntry`].
    fn advance(&mut self) -> Result<Flow, TransitionError> {
        let workflow = self.workflow;
        let reverse = self.entry.expected.is_reverse();

        loop {
            let next = workflow.next_step(&self.entry.step, reverse)?;
            self.entry.step = next.name.clone();
            self.entered = true;

            if workflow.is_terminal(&next.name, reverse) {
                return Ok(Flow::Invoke(Behavior::Close));
            }

            match next.kind {
                StepKind::Provisioner => return Ok(Flow::Invoke(Behavior::Provisioner)),
                _ if self.forward_provider_add(reverse) => {
                    return Ok(Flow::Invoke(Behavior::ProviderEntry));
                }
                _ => trace!(entry = %self.entry.name, step = %next.name, "pass through"),
            }
        }
    }

    fn forward_provider_add(&self, reverse: bool) -> bool {
        !reverse && self.message.action == Action::Add && self.message.from_provider()
    }

    fn require_provider(&self, action: Action) -> Result<(), TransitionError> {
        if self.message.action == action && self.message.origin() == Some(Origin::Provider) {
            Ok(())
        } else {
            Err(TransitionError::ActionNotAllowed {
                action: self.message.action,
                sender: self.message.sender.clone(),
                step: self.entry.step.clone(),
            })
        }
    }

    fn current_kind(&self) -> Result<StepKind, TransitionError> {
        self.workflow
            .step(&self.entry.step)
            .map(|s| s.kind)
            .ok_or_else(|| TransitionError::StepNotFound(self.entry.step.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Service, Target};
    use crate::workflow::UNDEPLOYED;

    const DOCKER: &str = "provider.docker";
    const IPAM: &str = "provisioner.ipam";
    const DNS: &str = "provisioner.dns";

    fn engine() -> TransitionEngine {
        let wf = Workflow::from_steps([DOCKER, IPAM, DNS]).unwrap();
        TransitionEngine::new(Arc::new(wf))
    }

    fn svc() -> Service {
        Service::new("svc1")
            .with_provider(DOCKER)
            .with_target(Target::new("10.0.0.1", 8080))
    }

    fn add() -> Message {
        Message::new(Action::Add, DOCKER, svc())
    }

    fn delete() -> Message {
        Message::new(Action::Delete, DOCKER, Service::new("svc1"))
    }

    fn reply(from: &str, service: Service) -> Message {
        Message::new(Action::Update, from, service)
    }

    fn start(behavior_for: &Message, entry: &Entry) -> Behavior {
        if behavior_for.from_provider() {
            Behavior::ProviderEntry
        } else {
            entry.behavior
        }
    }

    fn feed(engine: &TransitionEngine, entry: &mut Entry, msg: Message) -> Result<Decision, TransitionError> {
        let behavior = start(&msg, entry);
        engine.apply(entry, behavior, msg, Utc::now())
    }

    fn deployed_entry(engine: &TransitionEngine) -> Entry {
        let mut entry = Entry::new(svc(), Utc::now());
        feed(engine, &mut entry, add()).unwrap();
        feed(engine, &mut entry, reply(IPAM, svc())).unwrap();
        feed(engine, &mut entry, reply(DNS, svc())).unwrap();
        assert_eq!(entry.step, DEPLOYED);
        entry
    }

    #[test]
    fn add_dispatches_first_provisioner() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());

        let decision = feed(&engine, &mut entry, add()).unwrap();

        assert_eq!(decision.outcome, Outcome::Dispatched { step: IPAM.to_string() });
        let sent = decision.dispatch.expect("one dispatch");
        assert_eq!(sent.destination.as_deref(), Some(IPAM));
        assert_eq!(sent.action, Action::Add);
        assert_eq!(sent.sender, CORE_SENDER);
        assert_eq!(entry.step, IPAM);
        assert!(entry.in_flight);
        assert!(entry.detected_at.is_some());
        assert_eq!(entry.behavior, Behavior::Provisioner);
    }

    #[test]
    fn clean_reply_merges_and_moves_on() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();

        let allocated = svc().with_public_ip("10.9.9.9".parse().unwrap());
        let decision = feed(&engine, &mut entry, reply(IPAM, allocated)).unwrap();

        assert_eq!(decision.outcome, Outcome::Dispatched { step: DNS.to_string() });
        let sent = decision.dispatch.unwrap();
        assert_eq!(sent.service.public_ip, Some("10.9.9.9".parse().unwrap()));
        assert_eq!(entry.step, DNS);
        assert!(entry.in_flight);
    }

    #[test]
    fn last_reply_closes_at_deployed() {
        let engine = engine();
        let entry = deployed_entry(&engine);
        assert!(entry.is_closed());
        assert!(!entry.in_flight);
        assert_eq!(entry.behavior, Behavior::Close);
    }

    #[test]
    fn empty_workflow_closes_immediately() {
        let engine = TransitionEngine::new(Arc::new(Workflow::build("").unwrap()));
        let mut entry = Entry::new(svc(), Utc::now());

        let decision = feed(&engine, &mut entry, add()).unwrap();
        assert_eq!(decision.outcome, Outcome::Closed { step: DEPLOYED.to_string() });
        assert!(decision.dispatch.is_none());

        let decision = feed(&engine, &mut entry, delete()).unwrap();
        assert_eq!(decision.outcome, Outcome::Closed { step: UNDEPLOYED.to_string() });
    }

    #[test]
    fn error_reply_stops_and_records() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();

        let failed = reply(IPAM, svc()).with_error("disk full");
        let decision = feed(&engine, &mut entry, failed).unwrap();

        assert_eq!(
            decision.outcome,
            Outcome::ExtensionFailed { step: IPAM.to_string(), error: "disk full".to_string() }
        );
        assert!(decision.dispatch.is_none());
        assert_eq!(entry.step, IPAM);
        assert!(!entry.in_flight);
        assert_eq!(entry.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn new_add_retries_failed_step() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();
        feed(&engine, &mut entry, reply(IPAM, svc()).with_error("disk full")).unwrap();

        let decision = feed(&engine, &mut entry, add()).unwrap();

        assert_eq!(decision.outcome, Outcome::Dispatched { step: IPAM.to_string() });
        assert_eq!(entry.last_error, None);
        assert!(entry.in_flight);
    }

    #[test]
    fn stale_reply_after_failure_is_rejected() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();
        feed(&engine, &mut entry, reply(IPAM, svc()).with_error("disk full")).unwrap();
        let before = entry.clone();

        let err = feed(&engine, &mut entry, reply(IPAM, svc())).unwrap_err();
        assert_eq!(err.kind(), "ActionNotAllowed");
        assert_eq!(entry, before);
    }

    #[test]
    fn reply_from_wrong_extension_is_a_mismatch() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();
        let before = entry.clone();

        let err = feed(&engine, &mut entry, reply(DNS, svc())).unwrap_err();

        assert_eq!(
            err,
            TransitionError::SenderMismatch { expected: IPAM.to_string(), sender: DNS.to_string() }
        );
        assert_eq!(entry, before);
    }

    #[test]
    fn duplicate_add_in_flight_changes_nothing() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();
        let before = entry.clone();

        let decision = feed(&engine, &mut entry, add()).unwrap();

        assert_eq!(decision.outcome, Outcome::Duplicate);
        assert!(decision.dispatch.is_none());
        assert_eq!(entry, before);
    }

    #[test]
    fn add_after_deployed_is_duplicate() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);
        let before = entry.clone();

        let decision = feed(&engine, &mut entry, add()).unwrap();
        assert_eq!(decision.outcome, Outcome::Duplicate);
        assert_eq!(entry, before);
    }

    #[test]
    fn provider_refresh_is_unhandled() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        let msg = Message::new(Action::Refresh, DOCKER, svc());

        let err = feed(&engine, &mut entry, msg).unwrap_err();
        assert_eq!(err.kind(), "UnhandledAction");
        assert_eq!(entry.step, UNDEPLOYED);
    }

    #[test]
    fn provider_add_rejects_non_provider_sender() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        let msg = Message::new(Action::Add, IPAM, svc());

        let err = engine
            .apply(&mut entry, Behavior::ProviderAdd, msg, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "ActionNotAllowed");
    }

    #[test]
    fn provider_delete_rejects_add() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);
        let before = entry.clone();

        let err = engine
            .apply(&mut entry, Behavior::ProviderDelete, add(), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "ActionNotAllowed");
        assert_eq!(entry, before);
    }

    #[test]
    fn delete_of_deployed_entry_walks_back() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);

        let decision = feed(&engine, &mut entry, delete()).unwrap();
        assert_eq!(decision.outcome, Outcome::Dispatched { step: DNS.to_string() });
        let sent = decision.dispatch.unwrap();
        assert_eq!(sent.action, Action::Delete);
        assert_eq!(sent.service.targets.len(), 1, "delete carries the entry's descriptor");
        assert!(!entry.is_closed());

        feed(&engine, &mut entry, reply(DNS, svc())).unwrap();
        assert_eq!(entry.step, IPAM);

        let decision = feed(&engine, &mut entry, reply(IPAM, svc())).unwrap();
        assert_eq!(decision.outcome, Outcome::Closed { step: UNDEPLOYED.to_string() });
        assert!(entry.is_closed());
        assert_eq!(entry.expected, Direction::Undeployed);
    }

    #[test]
    fn delete_in_flight_rolls_back_pending_step() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        feed(&engine, &mut entry, add()).unwrap();
        feed(&engine, &mut entry, reply(IPAM, svc())).unwrap();
        assert_eq!(entry.step, DNS);
        assert!(entry.in_flight);

        let decision = feed(&engine, &mut entry, delete()).unwrap();

        assert_eq!(decision.outcome, Outcome::Dispatched { step: DNS.to_string() });
        assert_eq!(decision.dispatch.unwrap().action, Action::Delete);
        assert_eq!(entry.expected, Direction::Undeployed);
    }

    #[test]
    fn second_delete_is_duplicate() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);
        feed(&engine, &mut entry, delete()).unwrap();
        let before = entry.clone();

        let decision = feed(&engine, &mut entry, delete()).unwrap();
        assert_eq!(decision.outcome, Outcome::Duplicate);
        assert_eq!(entry, before);
    }

    #[test]
    fn add_after_undeploy_redeploys() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);
        feed(&engine, &mut entry, delete()).unwrap();
        feed(&engine, &mut entry, reply(DNS, svc())).unwrap();
        feed(&engine, &mut entry, reply(IPAM, svc())).unwrap();
        assert_eq!(entry.step, UNDEPLOYED);

        let decision = feed(&engine, &mut entry, add()).unwrap();
        assert_eq!(decision.outcome, Outcome::Dispatched { step: IPAM.to_string() });
        assert_eq!(entry.expected, Direction::Deployed);
        assert!(!entry.is_closed());
    }

    #[test]
    fn reply_to_closed_entry_is_rejected() {
        let engine = engine();
        let mut entry = deployed_entry(&engine);
        let before = entry.clone();

        let err = feed(&engine, &mut entry, reply(DNS, svc())).unwrap_err();
        assert_eq!(err.kind(), "ActionNotAllowed");
        assert_eq!(entry, before);
    }

    #[test]
    fn unknown_step_is_reported_not_corrupted() {
        let engine = engine();
        let mut entry = Entry::new(svc(), Utc::now());
        entry.step = "provisioner.gone".to_string();
        entry.closed_at = Some(Utc::now());
        let before = entry.clone();

        let err = feed(&engine, &mut entry, add()).unwrap_err();
        assert!(err.is_workflow_fault());
        assert_eq!(entry, before);
    }
}
