//! Configuration types for svcgate
//!
//! This module defines all configuration structures used throughout the crate.
//! Every section has serde defaults, so an empty document is a valid
//! configuration for a direct `undeployed → deployed` pipeline.

use crate::model::Origin;
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted housekeeping interval (in seconds)
pub const MAX_HOUSEKEEPING_INTERVAL_SECS: u64 = 86_400;

/// Main svcgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Comma-separated step list, in pipeline order
    #[serde(default)]
    pub workflow: String,

    /// Reject an empty workflow
    #[serde(default)]
    pub require_steps: bool,

    /// Extensions to instantiate
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,

    /// Housekeeper settings
    #[serde(default)]
    pub housekeeper: HousekeeperConfig,

    /// Snapshot settings
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CoreConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the step list
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    /// Add an extension
    pub fn with_extension(mut self, extension: ExtensionConfig) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Set the snapshot file
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot.path = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.housekeeper.validate()?;
        self.engine.validate()?;

        let mut seen = HashSet::new();
        for extension in &self.extensions {
            extension.validate()?;
            if !seen.insert(extension.identity.as_str()) {
                return Err(crate::Error::config(format!(
                    "Extension '{}' is configured more than once",
                    extension.identity
                )));
            }
        }

        self.build_workflow()?;
        Ok(())
    }

    /// Build the workflow described by `workflow`
    pub fn build_workflow(&self) -> Result<Workflow, crate::Error> {
        if self.require_steps {
            Workflow::build_non_empty(&self.workflow)
        } else {
            Workflow::build(&self.workflow)
        }
    }
}

/// One extension instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Identity, `provider.<name>` or `provisioner.<name>`
    pub identity: String,

    /// Registered factory name (e.g. "dryrun", "static")
    pub kind: String,

    /// Kind-specific settings
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ExtensionConfig {
    /// Create an extension configuration without settings
    pub fn new(identity: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            kind: kind.into(),
            config: serde_json::Value::Null,
        }
    }

    /// Attach kind-specific settings
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Validate the extension configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if Origin::of(&self.identity).is_none() {
            return Err(crate::Error::config(format!(
                "Extension identity '{}' must start with 'provider.' or 'provisioner.'",
                self.identity
            )));
        }
        if self.kind.is_empty() {
            return Err(crate::Error::config(format!(
                "Extension '{}' has no kind",
                self.identity
            )));
        }
        Ok(())
    }
}

/// Housekeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeeperConfig {
    /// Sweep period (in seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How long a closed entry stays in the table (in seconds)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// How long a dispatch may stay unanswered (in seconds)
    #[serde(default = "default_inflight_timeout_secs")]
    pub inflight_timeout_secs: u64,
}

impl HousekeeperConfig {
    /// Validate the housekeeper configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Housekeeping interval must be > 0"));
        }
        if self.interval_secs > MAX_HOUSEKEEPING_INTERVAL_SECS {
            return Err(crate::Error::config(format!(
                "Housekeeping interval must be <= {} seconds",
                MAX_HOUSEKEEPING_INTERVAL_SECS
            )));
        }
        if self.grace_period_secs == 0 {
            return Err(crate::Error::config("Grace period must be > 0"));
        }
        if self.inflight_timeout_secs == 0 {
            return Err(crate::Error::config("In-flight timeout must be > 0"));
        }
        Ok(())
    }

    /// Sweep period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            inflight_timeout_secs: default_inflight_timeout_secs(),
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot file; no persistence when absent
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Rewrite the snapshot after every sweep
    #[serde(default = "default_persist_on_sweep")]
    pub persist_on_sweep: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: None,
            persist_on_sweep: default_persist_on_sweep(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the engine event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Capacity of each extension's reply queue
    #[serde(default = "default_reply_channel_capacity")]
    pub reply_channel_capacity: usize,

    /// Maximum time to wait for tasks at shutdown (in seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        if self.reply_channel_capacity == 0 {
            return Err(crate::Error::config("Reply channel capacity must be > 0"));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(crate::Error::config("Shutdown timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            reply_channel_capacity: default_reply_channel_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    300
}

fn default_inflight_timeout_secs() -> u64 {
    300
}

fn default_persist_on_sweep() -> bool {
    true
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_reply_channel_capacity() -> usize {
    256
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}
