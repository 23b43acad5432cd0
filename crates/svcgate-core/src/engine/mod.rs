//! Core svcgate engine
//!
//! The Engine is responsible for:
//! - Running every provider and provisioner extension
//! - Routing their messages to per-service entries
//! - Dispatching each entry's next step to the owning extension
//! - Sweeping closed and stalled entries
//! - Persisting the entry table across restarts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  announcements   ┌──────────────┐   dispatch    ┌──────────────┐
//! │  providers  │─────────────────▶│  Dispatcher  │──────────────▶│ provisioners │
//! └─────────────┘                  └──────────────┘               └──────────────┘
//!                                    ▲    │    ▲                         │
//!                                    │    ▼    │         replies         │
//!                          ┌──────────────┐    └─────────────────────────┘
//!                          │  EntryTable  │◀─── Housekeeper (reap / timeout)
//!                          └──────────────┘
//!                                  │
//!                                  ▼
//!                          ┌──────────────┐
//!                          │SnapshotStore │
//!                          └──────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. A provider announces a service (`add`) or its removal (`delete`)
//! 2. The dispatcher locks the service's entry and runs the transition engine
//! 3. At most one message is dispatched to the extension owning the next step
//! 4. The extension's reply re-enters the dispatcher and advances the entry
//! 5. The entry closes at `deployed` or `undeployed`; the housekeeper reaps it later

pub mod dispatcher;
pub mod entry;
pub mod housekeeper;
pub mod table;
pub mod transition;

pub use dispatcher::{Delivery, Dispatcher};
pub use entry::Entry;
pub use housekeeper::{Housekeeper, SweepReport};
pub use table::EntryTable;
pub use transition::{Behavior, Decision, Outcome, TransitionEngine};

use crate::config::CoreConfig;
use crate::error::{Error, Result, TransitionError};
use crate::model::{Action, Message};
use crate::state::SnapshotStore;
use crate::traits::Extension;
use crate::workflow::Workflow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Events emitted by the Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started
    Started {
        extensions: usize,
        entries: usize,
    },

    /// A provider announced a service for the first time
    EntryCreated { name: String },

    /// A step was handed to its extension
    Dispatched {
        name: String,
        step: String,
        action: Action,
    },

    /// An entry reached its expected boundary
    Closed { name: String, step: String },

    /// A re-announcement was discarded
    Duplicate { name: String },

    /// A changed descriptor arrived while a step was in flight
    Deferred { name: String },

    /// An extension reported failure, or could not be reached
    ExtensionFailed {
        name: String,
        step: String,
        error: String,
    },

    /// A message was rejected without changing any entry
    Rejected {
        name: String,
        kind: &'static str,
        error: String,
    },

    /// The housekeeper cancelled an unanswered dispatch
    TimedOut { name: String, step: String },

    /// The housekeeper removed a closed entry
    Reaped { name: String },

    /// Engine stopped
    Stopped { reason: String },
}

/// Bounded, non-blocking publisher of [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Create a sink and the receiver observers read from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Publish an event, dropping it if observers are behind
    pub fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Queues of one extension, consumed when the engine runs
struct Wiring {
    extension: Arc<dyn Extension>,
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::Sender<Message>,
    replies: mpsc::Receiver<Message>,
}

/// Core svcgate engine
///
/// ## Lifecycle
///
/// 1. Create with [`Engine::new()`]
/// 2. Start with [`Engine::run()`]
/// 3. Engine runs until a shutdown signal is received
/// 4. On shutdown every extension is stopped and the snapshot written
///
/// ## Threading
///
/// `run` takes `&self`, so the engine can sit in an `Arc` while other tasks
/// use the query surface ([`Engine::entries`], [`Engine::entry`]) or inject
/// messages with [`Engine::submit`].
pub struct Engine {
    workflow: Arc<Workflow>,
    table: Arc<EntryTable>,
    dispatcher: Arc<Dispatcher>,
    housekeeper: Arc<Housekeeper>,
    extensions: Vec<Arc<dyn Extension>>,
    wiring: Mutex<Option<Vec<Wiring>>>,
    snapshot: Option<Arc<SnapshotStore>>,
    shutdown_timeout: Duration,
    events: EventSink,
}

impl Engine {
    /// Create a new engine
    ///
    /// # Parameters
    ///
    /// - `config`: core configuration
    /// - `extensions`: every provider and provisioner, already constructed
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, two extensions share an
    /// identity, or a provisioner step of the workflow has no extension.
    pub async fn new(
        config: CoreConfig,
        extensions: Vec<Box<dyn Extension>>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;
        let workflow = Arc::new(config.build_workflow()?);

        let extensions: Vec<Arc<dyn Extension>> = extensions.into_iter().map(Arc::from).collect();
        let mut identities = HashSet::new();
        for extension in &extensions {
            let identity = extension.identity();
            if crate::model::Origin::of(identity).is_none() {
                return Err(Error::config(format!(
                    "Extension identity '{}' must start with 'provider.' or 'provisioner.'",
                    identity
                )));
            }
            if !identities.insert(identity.to_string()) {
                return Err(Error::config(format!(
                    "Two extensions share the identity '{}'",
                    identity
                )));
            }
        }
        for step in workflow.provisioner_steps() {
            if !identities.contains(&step.name) {
                return Err(Error::config(format!(
                    "Workflow step '{}' has no extension",
                    step.name
                )));
            }
        }

        let (events, events_rx) = EventSink::channel(config.engine.event_channel_capacity);

        let snapshot = config.snapshot.path.as_ref().map(|p| Arc::new(SnapshotStore::new(p)));
        let restored = match &snapshot {
            Some(store) => store.load().await,
            None => Vec::new(),
        };
        let restored: Vec<Entry> = restored
            .into_iter()
            .filter(|entry| {
                let known = workflow.contains(&entry.step);
                if !known {
                    warn!(entry = %entry.name, step = %entry.step, "Dropping restored entry: step is not in the workflow");
                }
                known
            })
            .collect();
        if !restored.is_empty() {
            info!("Restored {} entries from snapshot", restored.len());
        }
        let table = Arc::new(EntryTable::from_entries(restored));

        let mut routes = HashMap::new();
        let mut wiring = Vec::with_capacity(extensions.len());
        for extension in &extensions {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::channel(config.engine.reply_channel_capacity);
            routes.insert(extension.identity().to_string(), inbound_tx);
            wiring.push(Wiring {
                extension: Arc::clone(extension),
                inbound: inbound_rx,
                outbound: outbound_tx,
                replies: outbound_rx,
            });
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&workflow),
            Arc::clone(&table),
            routes,
            events.clone(),
        ));

        let mut housekeeper = Housekeeper::new(
            Arc::clone(&table),
            Duration::from_secs(config.housekeeper.grace_period_secs),
            Duration::from_secs(config.housekeeper.inflight_timeout_secs),
            config.housekeeper.interval(),
            events.clone(),
        );
        if config.snapshot.persist_on_sweep {
            if let Some(store) = &snapshot {
                housekeeper = housekeeper.with_snapshot(Arc::clone(store));
            }
        }

        let engine = Self {
            workflow,
            table,
            dispatcher,
            housekeeper: Arc::new(housekeeper),
            extensions,
            wiring: Mutex::new(Some(wiring)),
            snapshot,
            shutdown_timeout: Duration::from_secs(config.engine.shutdown_timeout_secs),
            events,
        };

        Ok((engine, events_rx))
    }

    /// Run the engine until SIGINT/SIGTERM
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine until `shutdown_rx` fires (or its sender is dropped)
    ///
    /// Embedding applications and tests use this instead of OS signals.
    pub async fn run_with_shutdown(&self, shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        self.run_internal(Some(shutdown_rx)).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let wiring = self
            .wiring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::Other("Engine has already been run".to_string()))?;

        self.events.emit(EngineEvent::Started {
            extensions: self.extensions.len(),
            entries: self.table.len().await,
        });
        info!(
            steps = self.workflow.configured_len(),
            extensions = self.extensions.len(),
            "Engine started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for w in wiring {
            let identity = w.extension.identity().to_string();

            let extension = Arc::clone(&w.extension);
            let ext_identity = identity.clone();
            tasks.spawn(async move {
                match extension.start(w.inbound, w.outbound).await {
                    Ok(()) => debug!(extension = %ext_identity, "Extension exited"),
                    Err(e) => error!(extension = %ext_identity, "Extension failed: {}", e),
                }
            });

            tasks.spawn(reply_worker(
                identity,
                w.replies,
                Arc::clone(&self.dispatcher),
                stop_rx.clone(),
            ));
        }

        let housekeeper = Arc::clone(&self.housekeeper);
        let housekeeper_stop = stop_rx.clone();
        tasks.spawn(async move { housekeeper.run(housekeeper_stop).await });

        let reason = match shutdown_rx {
            Some(rx) => {
                let _ = rx.await;
                "Shutdown signal".to_string()
            }
            None => wait_for_signal().await,
        };
        info!("Shutdown signal received");

        stop_tx.send_replace(true);
        for extension in &self.extensions {
            extension.stop();
        }

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Engine task panicked: {}", e);
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Tasks still running after {}s, aborting",
                self.shutdown_timeout.as_secs()
            );
            tasks.abort_all();
        }

        let result = self.persist().await;

        self.events.emit(EngineEvent::Stopped { reason });
        info!("Engine stopped");
        result
    }

    async fn persist(&self) -> Result<()> {
        if let Some(snapshot) = &self.snapshot {
            let entries = self.table.snapshot().await;
            snapshot.save(&entries).await?;
            info!("Snapshot written: {} entries", entries.len());
        }
        Ok(())
    }

    /// Route a message as if it came from an extension's queue
    pub async fn submit(&self, message: Message) -> std::result::Result<Delivery, TransitionError> {
        self.dispatcher.dispatch(message).await
    }

    /// Copies of every entry
    pub async fn entries(&self) -> Vec<Entry> {
        let mut entries = self.table.snapshot().await;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Copy of the entry for `name`
    pub async fn entry(&self, name: &str) -> Option<Entry> {
        self.table.entry(name).await
    }

    /// Workflow entries walk through
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Identities of every extension, in configuration order
    pub fn extension_identities(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|e| e.identity().to_string())
            .collect()
    }

    /// Run one housekeeping sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.housekeeper.sweep(chrono::Utc::now()).await
    }
}

/// Feed one extension's outbound queue into the dispatcher
///
/// On stop the queue is closed and whatever is already buffered is still
/// dispatched, so no accepted reply is lost.
async fn reply_worker(
    identity: String,
    replies: mpsc::Receiver<Message>,
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
) {
    let mut stream = ReceiverStream::new(replies);

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            next = stream.next() => {
                match next {
                    Some(message) => forward(&identity, &dispatcher, message).await,
                    None => {
                        debug!(extension = %identity, "Reply queue closed");
                        return;
                    }
                }
            }
        }
    }

    let mut replies = stream.into_inner();
    replies.close();
    while let Some(message) = replies.recv().await {
        forward(&identity, &dispatcher, message).await;
    }
    debug!(extension = %identity, "Reply worker drained");
}

async fn forward(identity: &str, dispatcher: &Dispatcher, message: Message) {
    if message.sender != identity {
        warn!(
            extension = %identity,
            sender = %message.sender,
            "Message sender does not match its queue, dropped"
        );
        return;
    }
    // Rejections are logged and emitted by the dispatcher.
    let _ = dispatcher.dispatch(message).await;
}

#[cfg(unix)]
async fn wait_for_signal() -> String {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT".to_string();
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT".to_string(),
        _ = term.recv() => "SIGTERM".to_string(),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> String {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Service;

    #[tokio::test]
    async fn event_sink_drops_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(EngineEvent::EntryCreated { name: "a".to_string() });
        sink.emit(EngineEvent::EntryCreated { name: "b".to_string() });

        assert_eq!(rx.recv().await, Some(EngineEvent::EntryCreated { name: "a".to_string() }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_requires_extension_for_every_provisioner_step() {
        let config = CoreConfig::new().with_workflow("provisioner.ipam");
        assert!(Engine::new(config, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn empty_workflow_closes_on_first_add() {
        let (engine, _events) = Engine::new(CoreConfig::new(), Vec::new()).await.unwrap();

        let delivery = engine
            .submit(Message::new(Action::Add, "provider.docker", Service::new("svc1")))
            .await
            .unwrap();

        assert_eq!(
            delivery,
            Delivery::Applied(Outcome::Closed { step: crate::workflow::DEPLOYED.to_string() })
        );
        assert!(engine.entry("svc1").await.unwrap().is_closed());
    }
}
