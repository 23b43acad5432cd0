//! Core traits for svcgate
//!
//! - [`Extension`]: a provider or provisioner driven by the core
//! - [`ExtensionFactory`]: builds extensions from configuration

pub mod extension;

pub use extension::{Extension, ExtensionFactory};
