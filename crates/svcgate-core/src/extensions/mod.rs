//! Built-in reference extensions
//!
//! Neither of these talks to a real backend. They exist so a workflow can be
//! exercised end to end from configuration alone.

pub mod dryrun;
pub mod static_provider;

pub use dryrun::{DryRunFactory, DryRunProvisioner};
pub use static_provider::{StaticProvider, StaticProviderFactory};

/// Kind name of [`DryRunProvisioner`]
pub const DRYRUN_KIND: &str = "dryrun";

/// Kind name of [`StaticProvider`]
pub const STATIC_KIND: &str = "static";
