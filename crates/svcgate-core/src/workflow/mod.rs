//! Workflow definition
//!
//! A workflow is the ordered pipeline every entry walks through. It is built
//! once from configuration and never changes afterwards.
//!
//! ```text
//!  0             1                 2                  3                4
//! undeployed ── provider.docker ── provisioner.ipam ── provisioner.dns ── deployed
//!     ▲                                                                     ▲
//!  reverse terminal                                               forward terminal
//! ```
//!
//! Position 0 and N+1 are the virtual boundaries; positions 1..N are the
//! configured steps in declaration order. Each configured step is tagged by
//! its identity prefix: `provider.*` steps belong to the provider behaviors,
//! `provisioner.*` steps are dispatched to the extension of the same name.

use crate::engine::transition::Behavior;
use crate::error::{Error, Result, TransitionError};
use crate::model::Origin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Start boundary: nothing is exposed
pub const UNDEPLOYED: &str = "undeployed";

/// End boundary: every step has been applied
pub const DEPLOYED: &str = "deployed";

/// Terminal direction an entry is heading to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Walking forward to `deployed`
    Deployed,
    /// Walking backward to `undeployed`
    Undeployed,
}

impl Direction {
    /// True when walking the pipeline backwards
    pub fn is_reverse(self) -> bool {
        self == Direction::Undeployed
    }

    /// Boundary step that terminates this direction
    pub fn boundary(self) -> &'static str {
        match self {
            Direction::Deployed => DEPLOYED,
            Direction::Undeployed => UNDEPLOYED,
        }
    }
}

/// Who owns a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// One of the two virtual boundaries
    Boundary,
    /// Provider-origin step, traversed without dispatch
    Provider,
    /// Provisioner-origin step, dispatched to its extension
    Provisioner,
}

/// One position in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step name; for configured steps this is the owning extension identity
    pub name: String,
    /// Ownership tag
    pub kind: StepKind,
}

impl Step {
    fn boundary(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::Boundary,
        }
    }

    /// Transition behavior owning this step
    pub fn behavior(&self) -> Behavior {
        match self.kind {
            StepKind::Boundary | StepKind::Provider => Behavior::ProviderEntry,
            StepKind::Provisioner => Behavior::Provisioner,
        }
    }
}

/// Ordered, immutable pipeline of steps bounded by `undeployed` and `deployed`
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    steps: Vec<Step>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Workflow {
    /// Build a workflow from a comma-separated step list
    ///
    /// Blank items are ignored, so an empty or absent list yields the direct
    /// `undeployed → deployed` pipeline.
    ///
    /// # Errors
    ///
    /// Fails when a step has no `provider.` / `provisioner.` prefix, reuses a
    /// boundary name, or appears twice.
    pub fn build(step_list: &str) -> Result<Self> {
        Self::from_steps(
            step_list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        )
    }

    /// Like [`Workflow::build`], but an empty list is an error
    pub fn build_non_empty(step_list: &str) -> Result<Self> {
        let workflow = Self::build(step_list)?;
        if workflow.configured_len() == 0 {
            return Err(Error::workflow("Workflow has no configured steps"));
        }
        Ok(workflow)
    }

    /// Build a workflow from individual step names
    pub fn from_steps<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut steps = vec![Step::boundary(UNDEPLOYED)];

        for name in names {
            let name = name.as_ref().trim();
            if name == UNDEPLOYED || name == DEPLOYED {
                return Err(Error::workflow(format!(
                    "Step name '{}' is reserved for a boundary",
                    name
                )));
            }
            let kind = match Origin::of(name) {
                Some(Origin::Provider) => StepKind::Provider,
                Some(Origin::Provisioner) => StepKind::Provisioner,
                None => {
                    return Err(Error::workflow(format!(
                        "Step '{}' must start with 'provider.' or 'provisioner.'",
                        name
                    )));
                }
            };
            steps.push(Step {
                name: name.to_string(),
                kind,
            });
        }

        steps.push(Step::boundary(DEPLOYED));

        let mut index = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), position).is_some() {
                return Err(Error::workflow(format!(
                    "Step '{}' appears more than once",
                    step.name
                )));
            }
        }

        Ok(Self { steps, index })
    }

    /// Step after (or before, when `reverse`) `current`
    ///
    /// # Errors
    ///
    /// - [`TransitionError::StepNotFound`] when `current` is not in the pipeline
    /// - [`TransitionError::BoundaryReached`] when there is no step in that direction
    pub fn next_step(&self, current: &str, reverse: bool) -> std::result::Result<&Step, TransitionError> {
        let position = *self
            .index
            .get(current)
            .ok_or_else(|| TransitionError::StepNotFound(current.to_string()))?;

        let next = if reverse {
            position.checked_sub(1)
        } else {
            Some(position + 1)
        };

        next.and_then(|p| self.steps.get(p))
            .ok_or_else(|| TransitionError::BoundaryReached(current.to_string()))
    }

    /// True when `step` is the boundary that ends the given direction
    pub fn is_terminal(&self, step: &str, reverse: bool) -> bool {
        if reverse {
            step == UNDEPLOYED
        } else {
            step == DEPLOYED
        }
    }

    /// Behavior owning `step`, or `None` for unknown steps
    pub fn behavior_of(&self, step: &str) -> Option<Behavior> {
        self.step(step).map(Step::behavior)
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&p| &self.steps[p])
    }

    /// True when `name` is a position of the pipeline, boundaries included
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All steps in order, boundaries included
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Configured steps owned by provisioners, in order
    pub fn provisioner_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.kind == StepKind::Provisioner)
    }

    /// Number of configured steps (boundaries excluded)
    pub fn configured_len(&self) -> usize {
        self.steps.len() - 2
    }
}
