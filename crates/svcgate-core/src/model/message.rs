// # Message Envelope
//
// Every exchange between the core and an extension is a `Message`: an action,
// the sender's identity, an optional destination, an optional error, and the
// service descriptor it concerns.
//
// Extension identities follow a prefix convention that the core relies on
// for routing and validation:
//
// - `provider.<name>`: discovery sources announcing services
// - `provisioner.<name>`: extensions that apply one pipeline step

use crate::model::Service;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity prefix of discovery sources
pub const PROVIDER_PREFIX: &str = "provider.";

/// Identity prefix of pipeline extensions
pub const PROVISIONER_PREFIX: &str = "provisioner.";

/// Sender identity the core uses for messages it derives
pub const CORE_SENDER: &str = "core";

/// What a message asks for or reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Expose (or keep exposing) a service
    Add,
    /// A changed descriptor; extensions reply with this action
    Update,
    /// Withdraw a service
    Delete,
    /// Re-announce current state
    Refresh,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Refresh => "refresh",
        };
        f.write_str(s)
    }
}

/// Which side of the core an identity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// `provider.*`
    Provider,
    /// `provisioner.*`
    Provisioner,
}

impl Origin {
    /// Classify an identity by its prefix
    ///
    /// Returns `None` for identities without a recognized prefix or with
    /// nothing after the prefix.
    pub fn of(identity: &str) -> Option<Origin> {
        if identity
            .strip_prefix(PROVIDER_PREFIX)
            .is_some_and(|rest| !rest.is_empty())
        {
            Some(Origin::Provider)
        } else if identity
            .strip_prefix(PROVISIONER_PREFIX)
            .is_some_and(|rest| !rest.is_empty())
        {
            Some(Origin::Provisioner)
        } else {
            None
        }
    }
}

/// Envelope exchanged between the core and every extension
///
/// Messages are values: once queued for delivery they are not mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Requested or reported action
    pub action: Action,

    /// Identity of the sender
    pub sender: String,

    /// Intended receiver, when the sender targets a specific extension
    #[serde(default)]
    pub destination: Option<String>,

    /// Failure reported by the sender
    #[serde(default)]
    pub error: Option<String>,

    /// Descriptor the message concerns
    pub service: Service,
}

impl Message {
    /// Create a message without destination or error
    pub fn new(action: Action, sender: impl Into<String>, service: Service) -> Self {
        Self {
            action,
            sender: sender.into(),
            destination: None,
            error: None,
            service,
        }
    }

    /// Set the destination
    pub fn to(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Attach an error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Build the reply an extension sends back for this message
    ///
    /// The reply carries the extension's identity as sender, action `update`,
    /// and the (possibly enriched) descriptor, and is addressed to whoever
    /// sent this message. A descriptor without a name keeps this message's.
    pub fn reply(&self, sender: impl Into<String>, mut service: Service) -> Message {
        if service.name.is_empty() {
            service.name = self.service.name.clone();
        }
        Message::new(Action::Update, sender, service).to(self.sender.clone())
    }

    /// Error reported by the sender, treating an empty string as no error
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Classify the sender by its identity prefix
    pub fn origin(&self) -> Option<Origin> {
        Origin::of(&self.sender)
    }

    /// True when the sender is a provider
    pub fn from_provider(&self) -> bool {
        self.origin() == Some(Origin::Provider)
    }

    /// Name of the service the message concerns
    pub fn service_name(&self) -> &str {
        &self.service.name
    }
}
