// # Service Descriptor
//
// The payload every provider announces and every provisioner enriches.
//
// A descriptor is identified by its name (plus namespace where a provider
// needs to disambiguate). Two descriptors are *equivalent* when the fields
// that drive external exposure match: DNS aliases, the TLS flag, and the
// backend target set. Target order is not significant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Field name reported by [`Service::diff`] for DNS alias changes
pub const DIFF_DNS_ALIASES: &str = "DNSAliases";
/// Field name reported by [`Service::diff`] for TLS flag changes
pub const DIFF_TLS: &str = "TLS";
/// Field name reported by [`Service::diff`] for target set changes
pub const DIFF_TARGETS: &str = "Targets";

/// A backend endpoint behind a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// Host name or address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Relative load-balancing weight
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Target {
    /// Create a target with the default weight
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (w={})", self.host, self.port, self.weight)
    }
}

fn default_weight() -> u32 {
    1
}

/// Service descriptor exchanged between the core and extensions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Tag of the provider that discovered the service
    #[serde(default)]
    pub provider: String,

    /// Unique service name (entry key)
    pub name: String,

    /// Provider-scoped disambiguator
    #[serde(default)]
    pub namespace: String,

    /// Backend targets, kept in announcement order
    #[serde(default)]
    pub targets: Vec<Target>,

    /// Whether the service is exposed over TLS
    #[serde(default)]
    pub tls: bool,

    /// Public IP assigned by an allocator step
    #[serde(default)]
    pub public_ip: Option<IpAddr>,

    /// DNS aliases registered for the service
    #[serde(default)]
    pub dns_aliases: BTreeSet<String>,

    /// Free-text information
    #[serde(default)]
    pub info: String,

    /// Last error reported against this descriptor
    #[serde(default)]
    pub last_error: String,
}

impl Service {
    /// Create a descriptor with only a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the provider tag
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Append a backend target, ignoring exact duplicates
    pub fn with_target(mut self, target: Target) -> Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    /// Set the TLS flag
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Add a DNS alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.dns_aliases.insert(alias.into());
        self
    }

    /// Set the public IP
    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    /// Identity of the descriptor: `namespace/name`, or `name` without a namespace
    pub fn identity(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// List the exposure-relevant fields that differ between two descriptors
    ///
    /// Compares DNS aliases, the TLS flag, and the target set. Targets are
    /// compared as a set: the same targets announced in a different order are
    /// not a difference. Returns an empty list for equivalent descriptors.
    pub fn diff(&self, other: &Service) -> Vec<&'static str> {
        let mut changed = Vec::new();

        if self.dns_aliases != other.dns_aliases {
            changed.push(DIFF_DNS_ALIASES);
        }
        if self.tls != other.tls {
            changed.push(DIFF_TLS);
        }
        if self.target_set() != other.target_set() {
            changed.push(DIFF_TARGETS);
        }

        changed
    }

    /// True when [`Service::diff`] reports no difference
    pub fn equivalent(&self, other: &Service) -> bool {
        self.diff(other).is_empty()
    }

    /// Fold an extension's reply into this descriptor
    ///
    /// Name, namespace and provider tag stay with the entry. Targets, aliases,
    /// public IP and info are taken from the reply when it carries them; the
    /// TLS flag from the reply is authoritative.
    pub fn merge_reply(&mut self, reply: &Service) {
        if !reply.targets.is_empty() {
            self.targets = reply.targets.clone();
        }
        if !reply.dns_aliases.is_empty() {
            self.dns_aliases = reply.dns_aliases.clone();
        }
        if reply.public_ip.is_some() {
            self.public_ip = reply.public_ip;
        }
        if !reply.info.is_empty() {
            self.info = reply.info.clone();
        }
        self.tls = reply.tls;
    }

    fn target_set(&self) -> BTreeSet<&Target> {
        self.targets.iter().collect()
    }
}
