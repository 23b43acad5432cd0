// # Extension Trait
//
// Defines the interface every provider and provisioner implements.
//
// ## Implementations
//
// - `dryrun` provisioner: `crate::extensions::dryrun`
// - `static` provider: `crate::extensions::static_provider`
// - Embedding applications bring their own (see `demos/`)
//
// ## Usage
//
// ```rust,ignore
// use svcgate_core::{Extension, Message};
//
// let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
// let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel(16);
//
// tokio::spawn(async move { extension.start(inbound_rx, outbound_tx).await });
// ```

use crate::config::ExtensionConfig;
use crate::model::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A provider or provisioner plugged into the core
///
/// The engine owns both queues. `inbound` carries work addressed to this
/// extension (providers never receive any); `outbound` is where the extension
/// publishes announcements (providers) or replies (provisioners).
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - Perform whatever I/O the backend needs (APIs, files, sockets)
/// - Spawn helper tasks, as long as they end when `start` returns
/// - Reply at any time, in any order across entries
///
/// ## Forbidden Capabilities
/// - Touch entries or the workflow (owned by the core)
/// - Retry on its own behalf (a failed reply is retried by the next `add`)
/// - Reply more than once to one inbound message
///
/// ## Reply Contract
///
/// A provisioner answers each inbound message with exactly one message whose
/// `sender` is its own identity, whose service name matches, and whose
/// `error` is set on failure. The core merges the returned descriptor into
/// the entry.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Identity, `provider.<name>` or `provisioner.<name>`
    fn identity(&self) -> &str;

    /// Run until stopped or until `inbound` closes
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean exit
    /// - `Err(Error)`: The extension failed and will not process further messages
    async fn start(
        &self,
        inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> crate::Result<()>;

    /// Ask `start` to return; safe to call more than once
    fn stop(&self);
}

/// Helper trait for constructing extensions from configuration
pub trait ExtensionFactory: Send + Sync {
    /// Create an extension instance
    ///
    /// # Parameters
    ///
    /// - `config`: Identity plus kind-specific settings
    ///
    /// # Returns
    ///
    /// A boxed Extension trait object
    fn create(&self, config: &ExtensionConfig) -> crate::Result<Box<dyn Extension>>;
}
