//! Plugin-based extension registry
//!
//! The registry maps extension kinds to factories so a binary can turn
//! [`ExtensionConfig`] entries into running extensions without hardcoded
//! if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use svcgate_core::registry::ExtensionRegistry;
//! use svcgate_core::config::ExtensionConfig;
//!
//! let registry = ExtensionRegistry::with_builtins();
//! registry.register("consul", Box::new(ConsulFactory));
//!
//! let config = ExtensionConfig::new("provider.consul", "consul");
//! let extension = registry.create(&config)?;
//! ```

use crate::config::ExtensionConfig;
use crate::error::{Error, Result};
use crate::extensions::{DryRunFactory, StaticProviderFactory};
use crate::traits::{Extension, ExtensionFactory};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry of extension factories, keyed by kind
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: RwLock<HashMap<String, Box<dyn ExtensionFactory>>>,
}

impl ExtensionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in `dryrun` and `static` kinds
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(crate::extensions::DRYRUN_KIND, Box::new(DryRunFactory));
        registry.register(crate::extensions::STATIC_KIND, Box::new(StaticProviderFactory));
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Box<dyn ExtensionFactory>>> {
        self.factories.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Box<dyn ExtensionFactory>>> {
        self.factories.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a factory
    ///
    /// # Parameters
    ///
    /// - `kind`: Kind name used in [`ExtensionConfig::kind`]
    /// - `factory`: Factory object for creating extension instances
    pub fn register(&self, kind: impl Into<String>, factory: Box<dyn ExtensionFactory>) {
        self.write().insert(kind.into(), factory);
    }

    /// Create an extension from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Extension>)`: Created extension instance
    /// - `Err(Error)`: If the kind is not registered or creation fails
    pub fn create(&self, config: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        config.validate()?;

        let factories = self.read();
        let factory = factories
            .get(&config.kind)
            .ok_or_else(|| Error::config(format!("Unknown extension kind: {}", config.kind)))?;

        let extension = factory.create(config)?;
        if extension.identity() != config.identity {
            return Err(Error::extension(
                &config.identity,
                format!("factory '{}' produced identity '{}'", config.kind, extension.identity()),
            ));
        }
        Ok(extension)
    }

    /// Create every configured extension, in order
    ///
    /// Every kind is checked before any factory runs, so a typo in the last
    /// entry never leaves earlier extensions half-built.
    pub fn create_all(&self, configs: &[ExtensionConfig]) -> Result<Vec<Box<dyn Extension>>> {
        if let Some(unknown) = configs.iter().find(|c| !self.has_kind(&c.kind)) {
            return Err(Error::config(format!(
                "Unknown extension kind '{}' for '{}' (known: {})",
                unknown.kind,
                unknown.identity,
                self.kinds().join(", ")
            )));
        }
        configs.iter().map(|config| self.create(config)).collect()
    }

    /// List all registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Check if a kind is registered
    pub fn has_kind(&self, kind: &str) -> bool {
        self.read().contains_key(kind)
    }
}
