// # Static Provider
//
// Announces a fixed list of services once at start, then idles until stopped.
//
// ## Configuration
//
// ```json
// { "services": [ { "name": "web", "targets": [ { "host": "10.0.0.5", "port": 8080 } ] } ] }
// ```

use crate::config::ExtensionConfig;
use crate::error::{Error, Result};
use crate::model::{Action, Message, Service};
use crate::traits::{Extension, ExtensionFactory};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct StaticProviderSettings {
    #[serde(default)]
    services: Vec<Service>,
}

/// Provider announcing a fixed set of services
pub struct StaticProvider {
    identity: String,
    services: Vec<Service>,
    stop_tx: watch::Sender<bool>,
}

impl StaticProvider {
    /// Create a provider that will announce `services`
    pub fn new(identity: impl Into<String>, services: Vec<Service>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity: identity.into(),
            services,
            stop_tx,
        }
    }

    /// Services announced at start
    pub fn services(&self) -> &[Service] {
        &self.services
    }
}

#[async_trait]
impl Extension for StaticProvider {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(
        &self,
        _inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        let mut stop = self.stop_tx.subscribe();

        for service in &self.services {
            let service = service.clone().with_provider(&self.identity);
            outbound
                .send(Message::new(Action::Add, &self.identity, service))
                .await
                .map_err(|_| Error::channel_closed(format!("{} announcement queue", self.identity)))?;
        }
        info!(extension = %self.identity, count = self.services.len(), "Static services announced");

        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Factory for [`StaticProvider`]
pub struct StaticProviderFactory;

impl ExtensionFactory for StaticProviderFactory {
    fn create(&self, config: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        if !config.identity.starts_with(crate::model::PROVIDER_PREFIX) {
            return Err(Error::config(format!(
                "static can only act as a provider, not '{}'",
                config.identity
            )));
        }

        let settings: StaticProviderSettings = if config.config.is_null() {
            StaticProviderSettings::default()
        } else {
            serde_json::from_value(config.config.clone())?
        };

        if let Some(nameless) = settings.services.iter().position(|s| s.name.is_empty()) {
            return Err(Error::config(format!(
                "static provider '{}': service #{} has no name",
                config.identity, nameless
            )));
        }

        Ok(Box::new(StaticProvider::new(&config.identity, settings.services)))
    }
}
