//! Data exchanged between the core and extensions
//!
//! - [`Service`]: the descriptor of one exposed backend service
//! - [`Message`]: the envelope carrying a descriptor between components

pub mod message;
pub mod service;

pub use message::{Action, CORE_SENDER, Message, Origin, PROVIDER_PREFIX, PROVISIONER_PREFIX};
pub use service::{DIFF_DNS_ALIASES, DIFF_TARGETS, DIFF_TLS, Service, Target};
