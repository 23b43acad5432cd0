//! Minimal embedding example for svcgate-core
//!
//! This example demonstrates using svcgate-core as a library in a custom
//! application. The application brings its own provider (fed from a channel)
//! and two provisioners (an address allocator and a DNS registrar). The
//! engine lifecycle is fully managed by the application.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use svcgate_core::{
    Action, CoreConfig, Engine, Extension, Message, Result, Service, Target,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

/// Provider fed by the application through a channel
struct EmbeddedProvider {
    announcements: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    stop_tx: watch::Sender<bool>,
}

impl EmbeddedProvider {
    const IDENTITY: &'static str = "provider.embedded";

    fn new() -> (Self, mpsc::UnboundedSender<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        (
            Self {
                announcements: Mutex::new(Some(rx)),
                stop_tx,
            },
            tx,
        )
    }
}

#[async_trait::async_trait]
impl Extension for EmbeddedProvider {
    fn identity(&self) -> &str {
        Self::IDENTITY
    }

    async fn start(
        &self,
        _inbound: mpsc::UnboundedReceiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        let Some(mut announcements) = self.announcements.lock().await.take() else {
            return Ok(());
        };
        let mut stop = self.stop_tx.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => {}
                next = announcements.recv() => match next {
                    Some(message) => {
                        if outbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// What a provisioner does to a descriptor
type Apply = fn(&Message, &AtomicU8) -> std::result::Result<Service, String>;

/// Provisioner answering every message with `apply`
struct EmbeddedProvisioner {
    identity: &'static str,
    apply: Apply,
    counter: AtomicU8,
    stop_tx: watch::Sender<bool>,
}

impl EmbeddedProvisioner {
    fn new(identity: &'static str, apply: Apply) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity,
            apply,
            counter: AtomicU8::new(10),
            stop_tx,
        }
    }
}

#[async_trait::async_trait]
impl Extension for EmbeddedProvisioner {
    fn identity(&self) -> &str {
        self.identity
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
                    println!("[{}] {} {}", self.identity, message.action, message.service.name);
                    let reply = match (self.apply)(&message, &self.counter) {
                        Ok(service) => message.reply(self.identity, service),
                        Err(e) => message.reply(self.identity, message.service.clone()).with_error(e),
                    };
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

fn allocate_ip(message: &Message, counter: &AtomicU8) -> std::result::Result<Service, String> {
    let mut service = message.service.clone();
    match message.action {
        Action::Delete => service.public_ip = None,
        _ => {
            let host = counter.fetch_add(1, Ordering::SeqCst);
            service.public_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, host)));
        }
    }
    Ok(service)
}

fn register_dns(message: &Message, _counter: &AtomicU8) -> std::result::Result<Service, String> {
    if message.action == Action::Add && message.service.public_ip.is_none() {
        return Err("no public IP to point the record at".to_string());
    }
    let service = message
        .service
        .clone()
        .with_alias(format!("{}.example.net", message.service.name));
    Ok(service)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Embedded svcgate-core Example ===\n");

    let (provider, announce) = EmbeddedProvider::new();
    let extensions: Vec<Box<dyn Extension>> = vec![
        Box::new(provider),
        Box::new(EmbeddedProvisioner::new("provisioner.ipam", allocate_ip)),
        Box::new(EmbeddedProvisioner::new("provisioner.dns", register_dns)),
    ];

    let mut config = CoreConfig::new().with_workflow("provisioner.ipam, provisioner.dns");
    config.engine.event_channel_capacity = 100;

    println!("1. Creating engine...");
    let (engine, mut event_rx) = Engine::new(config, extensions).await?;
    let engine = Arc::new(engine);

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    println!("2. Starting engine in background...");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let runner = Arc::clone(&engine);
    let engine_handle = tokio::spawn(async move { runner.run_with_shutdown(shutdown_rx).await });

    println!("3. Announcing a service...");
    let web = Service::new("web").with_target(Target::new("10.0.0.5", 8080));
    let _ = announce.send(Message::new(Action::Add, EmbeddedProvider::IDENTITY, web.clone()));
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    if let Some(entry) = engine.entry("web").await {
        println!(
            "   web is at '{}' (ip {:?}, aliases {:?})",
            entry.step, entry.service.public_ip, entry.service.dns_aliases
        );
    }

    println!("4. Withdrawing the service...");
    let _ = announce.send(Message::new(Action::Delete, EmbeddedProvider::IDENTITY, web));
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    if let Some(entry) = engine.entry("web").await {
        println!("   web is at '{}'", entry.step);
    }

    println!("5. Stopping engine...");
    let _ = shutdown_tx.send(());
    match engine_handle.await {
        Ok(result) => result?,
        Err(e) => eprintln!("Engine task failed: {}", e),
    }

    drop(engine);
    let _ = tokio::time::timeout(tokio::time::Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Engine lifecycle is fully controlled by application");
    println!("- No global state");
    println!("- All extensions are custom (not svcgated defaults)");

    Ok(())
}
