// # Dry-run Provisioner
//
// Acknowledges every inbound message by echoing the descriptor back. Useful
// for exercising a workflow end to end without touching any backend.

use crate::config::ExtensionConfig;
use crate::error::{Error, Result};
use crate::model::Message;
use crate::traits::{Extension, ExtensionFactory};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Provisioner that succeeds at everything
pub struct DryRunProvisioner {
    identity: String,
    stop_tx: watch::Sender<bool>,
}

impl DryRunProvisioner {
    /// Create a dry-run provisioner with the given identity
    pub fn new(identity: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity: identity.into(),
            stop_tx,
        }
    }
}

#[async_trait]
impl Extension for DryRunProvisioner {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(
        &self,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        let mut stop = self.stop_tx.subscribe();
        info!(extension = %self.identity, "Dry-run provisioner started");

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => {}
                next = inbound.recv() => {
                    let Some(message) = next else { break };
                    debug!(extension = %self.identity, entry = %message.service.name, action = %message.action, "Acknowledging");
                    let reply = message.reply(&self.identity, message.service.clone());
                    outbound
                        .send(reply)
                        .await
                        .map_err(|_| Error::channel_closed(format!("{} reply queue", self.identity)))?;
                }
            }
        }

        info!(extension = %self.identity, "Dry-run provisioner stopped");
        Ok(())
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Factory for [`DryRunProvisioner`]
pub struct DryRunFactory;

impl ExtensionFactory for DryRunFactory {
    fn create(&self, config: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        if !config.identity.starts_with(crate::model::PROVISIONER_PREFIX) {
            return Err(Error::config(format!(
                "dryrun can only act as a provisioner, not '{}'",
                config.identity
            )));
        }
        Ok(Box::new(DryRunProvisioner::new(&config.identity)))
    }
}
