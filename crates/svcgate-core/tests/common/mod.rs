//! Test doubles and common utilities for contract tests
//!
//! Two levels are offered:
//!
//! - [`Harness`]: a dispatcher wired to plain channels. Tests feed messages
//!   and read dispatches synchronously, with no extension tasks running.
//! - [`ScriptedProvisioner`] / [`ControlledProvider`]: extensions for tests
//!   that run a full [`Engine`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svcgate_core::engine::{Delivery, Dispatcher, EntryTable, EventSink};
use svcgate_core::error::Result;
use svcgate_core::{
    Action, Engine, EngineEvent, Entry, Extension, Message, Service, Target, TransitionError,
    Workflow,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const DOCKER: &str = "provider.docker";
pub const IPAM: &str = "provisioner.ipam";
pub const DNS: &str = "provisioner.dns";

/// The three-step pipeline used throughout: docker → ipam → dns
pub fn three_steps() -> [&'static str; 3] {
    [DOCKER, IPAM, DNS]
}

/// Descriptor announced by the docker provider
pub fn service(name: &str) -> Service {
    Service::new(name)
        .with_provider(DOCKER)
        .with_target(Target::new("10.0.0.1", 8080))
}

pub fn add(name: &str) -> Message {
    Message::new(Action::Add, DOCKER, service(name))
}

pub fn delete(name: &str) -> Message {
    Message::new(Action::Delete, DOCKER, Service::new(name))
}

/// Successful reply from `from`
pub fn ok_reply(from: &str, service: Service) -> Message {
    Message::new(Action::Update, from, service)
}

/// Failed reply from `from`
pub fn failed_reply(from: &str, name: &str, error: &str) -> Message {
    Message::new(Action::Update, from, Service::new(name)).with_error(error)
}

/// Dispatcher wired to channels the test reads directly
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub table: Arc<EntryTable>,
    inboxes: HashMap<String, mpsc::UnboundedReceiver<Message>>,
    events: mpsc::Receiver<EngineEvent>,
}

impl Harness {
    pub fn new(steps: &[&str]) -> Self {
        let workflow = Arc::new(Workflow::from_steps(steps).expect("valid workflow"));
        let table = Arc::new(EntryTable::new());
        Self::with_table(workflow, table)
    }

    pub fn with_table(workflow: Arc<Workflow>, table: Arc<EntryTable>) -> Self {
        let mut routes = HashMap::new();
        let mut inboxes = HashMap::new();
        for step in workflow.provisioner_steps() {
            let (tx, rx) = mpsc::unbounded_channel();
            routes.insert(step.name.clone(), tx);
            inboxes.insert(step.name.clone(), rx);
        }
        let (sink, events) = EventSink::channel(1000);
        let dispatcher = Arc::new(Dispatcher::new(workflow, Arc::clone(&table), routes, sink));
        Self {
            dispatcher,
            table,
            inboxes,
            events,
        }
    }

    pub async fn send(&self, message: Message) -> std::result::Result<Delivery, TransitionError> {
        self.dispatcher.dispatch(message).await
    }

    /// Send a message that must be accepted
    pub async fn accept(&self, message: Message) -> Delivery {
        self.send(message).await.expect("message accepted")
    }

    /// Every message dispatched to `step` since the last call
    pub fn dispatched(&mut self, step: &str) -> Vec<Message> {
        let inbox = self.inboxes.get_mut(step).expect("known provisioner step");
        let mut out = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            out.push(message);
        }
        out
    }

    /// Total number of pending dispatches across all steps
    pub fn pending_dispatches(&mut self) -> usize {
        let steps: Vec<String> = self.inboxes.keys().cloned().collect();
        steps.iter().map(|s| self.dispatched(s).len()).sum()
    }

    pub async fn entry(&self, name: &str) -> Entry {
        self.table.entry(name).await.expect("entry exists")
    }

    /// Every event emitted since the last call
    pub fn events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Observation handle for a [`ScriptedProvisioner`] owned by an engine
#[derive(Clone, Default)]
pub struct ProvisionerProbe {
    received: Arc<Mutex<Vec<Message>>>,
    stop_calls: Arc<AtomicUsize>,
}

impl ProvisionerProbe {
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_for(&self, name: &str) -> Vec<Message> {
        self.received()
            .into_iter()
            .filter(|m| m.service.name == name)
            .collect()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

/// Provisioner that records every inbound message and answers from a script
pub struct ScriptedProvisioner {
    identity: String,
    probe: ProvisionerProbe,
    failures: Mutex<HashMap<String, VecDeque<String>>>,
    public_ip: Option<IpAddr>,
    silent: bool,
    stop_tx: watch::Sender<bool>,
}

impl ScriptedProvisioner {
    pub fn new(identity: &str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity: identity.to_string(),
            probe: ProvisionerProbe::default(),
            failures: Mutex::new(HashMap::new()),
            public_ip: None,
            silent: false,
            stop_tx,
        }
    }

    /// Fail the next message for `name` with `error`
    pub fn failing_once(self, name: &str, error: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(error.to_string());
        self
    }

    /// Assign `ip` on every successful `add`
    pub fn assigning(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    /// Record messages but never reply
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn probe(&self) -> ProvisionerProbe {
        self.probe.clone()
    }

    fn answer(&self, message: &Message) -> Message {
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&message.service.name)
            .and_then(VecDeque::pop_front);

        match failure {
            Some(error) => message
                .reply(&self.identity, message.service.clone())
                .with_error(error),
            None => {
                let mut service = message.service.clone();
                if message.action == Action::Add {
                    if let Some(ip) = self.public_ip {
                        service.public_ip = Some(ip);
                    }
                }
                message.reply(&self.identity, service)
            }
        }
    }
}

#[async_trait::async_trait]
impl Extension for ScriptedProvisioner {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(
        &self,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        let mut stop = self.stop_tx.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => {}
                next = inbound.recv() => {
                    let Some(message) = next else { break };
                    self.probe.received.lock().unwrap().push(message.clone());
                    if self.silent {
                        continue;
                    }
                    if outbound.send(self.answer(&message)).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.probe.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }
}

/// Test-side handle of a [`ControlledProvider`]
#[derive(Clone)]
pub struct ProviderHandle {
    identity: String,
    tx: mpsc::UnboundedSender<Message>,
    stop_calls: Arc<AtomicUsize>,
}

impl ProviderHandle {
    pub fn add(&self, service: Service) {
        let _ = self.tx.send(Message::new(Action::Add, &self.identity, service));
    }

    pub fn delete(&self, name: &str) {
        let _ = self
            .tx
            .send(Message::new(Action::Delete, &self.identity, Service::new(name)));
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

/// Provider that forwards whatever the test pushes through its handle
pub struct ControlledProvider {
    identity: String,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    stop_calls: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
}

impl ControlledProvider {
    pub fn new(identity: &str) -> (Self, ProviderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let stop_calls = Arc::new(AtomicUsize::new(0));
        let provider = Self {
            identity: identity.to_string(),
            rx: tokio::sync::Mutex::new(Some(rx)),
            stop_calls: Arc::clone(&stop_calls),
            stop_tx,
        };
        let handle = ProviderHandle {
            identity: identity.to_string(),
            tx,
            stop_calls,
        };
        (provider, handle)
    }
}

#[async_trait::async_trait]
impl Extension for ControlledProvider {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(
        &self,
        _inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return Ok(());
        };
        let mut stop = self.stop_tx.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => {}
                next = rx.recv() => {
                    let Some(message) = next else { break };
                    if outbound.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }
}

/// Poll `engine` until the entry for `name` satisfies `check`
pub async fn wait_for_entry<F>(engine: &Engine, name: &str, check: F) -> Entry
where
    F: Fn(&Entry) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(entry) = engine.entry(name).await {
            if check(&entry) {
                return entry;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "entry '{}' never reached the expected state; last seen: {:?}",
                name,
                engine.entry(name).await
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Engine running in the background until the returned sender fires
pub struct RunningEngine {
    pub engine: Arc<Engine>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningEngine {
    pub fn spawn(engine: Engine) -> Self {
        let engine = Arc::new(engine);
        let (shutdown, rx) = oneshot::channel();
        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.run_with_shutdown(rx).await });
        Self {
            engine,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Signal shutdown and wait for `run` to return
    pub async fn stop(mut self) -> (Arc<Engine>, Result<()>) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let result = tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .expect("engine stops in time")
            .expect("engine task does not panic");
        (self.engine, result)
    }
}
