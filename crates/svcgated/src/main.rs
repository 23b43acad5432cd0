// # svcgated - svcgate daemon
//
// This is a thin integration layer only: all reconciliation logic lives in
// svcgate-core. Configuration is via environment variables only.
//
// The svcgated daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Building extensions from the registry
// 4. Running the engine until SIGINT/SIGTERM
//
// ## Configuration
//
// ### Workflow
// - `SVCGATE_WORKFLOW`: Comma-separated step list (e.g. `provider.files,provisioner.ipam`)
// - `SVCGATE_REQUIRE_STEPS`: Reject an empty workflow (`true`/`false`)
//
// ### Extensions
// - `SVCGATE_EXTENSIONS`: Comma-separated `identity=kind` pairs. Workflow steps
//   without a pair use `static` (providers) or `dryrun` (provisioners).
// - `SVCGATE_STATIC_SERVICES_FILE`: JSON array of services for `static` providers
//
// ### Persistence
// - `SVCGATE_SNAPSHOT_PATH`: Snapshot file (no persistence when unset)
//
// ### Housekeeping
// - `SVCGATE_HOUSEKEEPING_INTERVAL_SECS`: Sweep period
// - `SVCGATE_GRACE_PERIOD_SECS`: Closed-entry retention
// - `SVCGATE_INFLIGHT_TIMEOUT_SECS`: Stuck dispatch deadline
//
// ### Logging
// - `SVCGATE_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export SVCGATE_WORKFLOW=provisioner.ipam,provisioner.dns
// export SVCGATE_EXTENSIONS=provider.files=static
// export SVCGATE_STATIC_SERVICES_FILE=/etc/svcgate/services.json
// export SVCGATE_SNAPSHOT_PATH=/var/lib/svcgate/entries.json
//
// svcgated
// ```

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use svcgate_core::extensions::{DRYRUN_KIND, STATIC_KIND};
use svcgate_core::model::{Origin, PROVIDER_PREFIX};
use svcgate_core::{CoreConfig, Engine, EngineEvent, ExtensionConfig, ExtensionRegistry, Service};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum SvcgateExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<SvcgateExitCode> for ExitCode {
    fn from(code: SvcgateExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    workflow: String,
    require_steps: bool,
    extensions: Vec<(String, String)>,
    static_services_file: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    housekeeping_interval_secs: Option<u64>,
    grace_period_secs: Option<u64>,
    inflight_timeout_secs: Option<u64>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            workflow: env::var("SVCGATE_WORKFLOW").unwrap_or_default(),
            require_steps: parse_bool("SVCGATE_REQUIRE_STEPS")?.unwrap_or(false),
            extensions: parse_extensions(&env::var("SVCGATE_EXTENSIONS").unwrap_or_default())?,
            static_services_file: env::var("SVCGATE_STATIC_SERVICES_FILE").ok().map(PathBuf::from),
            snapshot_path: env::var("SVCGATE_SNAPSHOT_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            housekeeping_interval_secs: parse_secs("SVCGATE_HOUSEKEEPING_INTERVAL_SECS")?,
            grace_period_secs: parse_secs("SVCGATE_GRACE_PERIOD_SECS")?,
            inflight_timeout_secs: parse_secs("SVCGATE_INFLIGHT_TIMEOUT_SECS")?,
            log_level: env::var("SVCGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "SVCGATE_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        if let Some(path) = &self.static_services_file
            && !path.exists()
        {
            anyhow::bail!(
                "SVCGATE_STATIC_SERVICES_FILE does not exist: {}",
                path.display()
            );
        }

        if let Some(path) = &self.snapshot_path
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            anyhow::bail!(
                "SVCGATE_SNAPSHOT_PATH parent directory does not exist: {}. \
                Create it first: sudo mkdir -p {}",
                parent.display(),
                parent.display()
            );
        }

        Ok(())
    }

    /// Translate into the core configuration
    fn to_core(&self) -> Result<CoreConfig> {
        let mut core = CoreConfig::new().with_workflow(&self.workflow);
        core.require_steps = self.require_steps;
        core.snapshot.path = self.snapshot_path.clone();
        if let Some(secs) = self.housekeeping_interval_secs {
            core.housekeeper.interval_secs = secs;
        }
        if let Some(secs) = self.grace_period_secs {
            core.housekeeper.grace_period_secs = secs;
        }
        if let Some(secs) = self.inflight_timeout_secs {
            core.housekeeper.inflight_timeout_secs = secs;
        }

        let workflow = core.build_workflow()?;

        let mut identities: Vec<(String, String)> = self.extensions.clone();
        for step in workflow.steps() {
            let default_kind = match Origin::of(&step.name) {
                Some(Origin::Provider) => STATIC_KIND,
                Some(Origin::Provisioner) => DRYRUN_KIND,
                None => continue,
            };
            if !identities.iter().any(|(identity, _)| identity == &step.name) {
                identities.push((step.name.clone(), default_kind.to_string()));
            }
        }

        let static_settings = self.static_settings()?;
        for (identity, kind) in identities {
            let mut extension = ExtensionConfig::new(identity, kind);
            if extension.kind == STATIC_KIND {
                extension = extension.with_config(static_settings.clone());
            }
            core.extensions.push(extension);
        }

        if !core
            .extensions
            .iter()
            .any(|e| e.identity.starts_with(PROVIDER_PREFIX))
        {
            warn!("No provider configured; no service will ever be announced");
        }

        Ok(core)
    }

    fn static_settings(&self) -> Result<serde_json::Value> {
        let Some(path) = &self.static_services_file else {
            return Ok(serde_json::Value::Null);
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let services: Vec<Service> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(serde_json::json!({ "services": services }))
    }
}

fn parse_bool(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" | "" => Ok(Some(false)),
            other => anyhow::bail!("{} must be true or false. Got: {}", var, other),
        },
        Err(_) => Ok(None),
    }
}

fn parse_secs(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) => {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds. Got: {}", var, value))?;
            if secs == 0 {
                anyhow::bail!("{} must be > 0", var);
            }
            Ok(Some(secs))
        }
        Err(_) => Ok(None),
    }
}

fn parse_extensions(list: &str) -> Result<Vec<(String, String)>> {
    list.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (identity, kind) = pair.split_once('=').with_context(|| {
                format!("SVCGATE_EXTENSIONS entry '{}' must look like identity=kind", pair)
            })?;
            Ok((identity.trim().to_string(), kind.trim().to_string()))
        })
        .collect()
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return SvcgateExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return SvcgateExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return SvcgateExitCode::ConfigError.into();
    }

    info!("Starting svcgated daemon");

    let core = match config.to_core() {
        Ok(core) => core,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return SvcgateExitCode::ConfigError.into();
        }
    };

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return SvcgateExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        let registry = ExtensionRegistry::with_builtins();
        let extensions = match registry.create_all(&core.extensions) {
            Ok(extensions) => extensions,
            Err(e) => {
                error!("Failed to create extensions: {}", e);
                return SvcgateExitCode::ConfigError;
            }
        };

        let (engine, events) = match Engine::new(core, extensions).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to create engine: {}", e);
                return SvcgateExitCode::ConfigError;
            }
        };

        info!(
            "Workflow: {}",
            engine
                .workflow()
                .steps()
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        info!("Extensions: {}", engine.extension_identities().join(", "));

        tokio::spawn(log_events(events));

        match engine.run().await {
            Ok(()) => SvcgateExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {}", e);
                SvcgateExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Drain engine events so the channel never fills up
async fn log_events(mut events: tokio::sync::mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        debug!(?event, "Engine event");
    }
}
