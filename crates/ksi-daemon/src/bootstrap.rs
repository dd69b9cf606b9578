//! Daemon assembly and lifecycle.
//!
//! # Startup order
//!
//! Store → registries → event log → router → services → handler
//! registration → transformer load → recovery (agents, orchestrations,
//! completions — in that order, so capability and routing indexes exist
//! before requests resurrect) → transport. Shutdown reverses: stop
//! accepting, drain the router, exit.
//!
//! # Fatal failures
//!
//! The router cancels its fatal token when the event log becomes
//! unwritable or internal errors repeat. [`run`] then writes a durable
//! marker under the log root and exits non-zero; the next start logs the
//! marker and runs recovery as usual.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ksi_agent::AgentService;
use ksi_completion::{CompletionService, SessionTracker};
use ksi_composition::ComponentLoader;
use ksi_config::DaemonConfig;
use ksi_orchestration::OrchestrationService;
use ksi_provider::{CliDriver, MockDriver, ProviderDriver};
use ksi_router::{
    CapabilityIndex, EventLog, HandlerRegistry, OrchestrationIndex, Router, RouterHandle,
    SubscriptionRegistry, TransformerRegistry,
};
use ksi_store::Store;
use ksi_transport::{ClientRegistry, TransportServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Marker file written on fatal shutdown so restart can tell a crash
/// from a clean exit.
const SHUTDOWN_MARKER: &str = "shutdown.marker";

/// Live handles into an assembled daemon.
pub struct DaemonHandles {
    /// The configuration everything was derived from.
    pub config: DaemonConfig,
    /// The shared store.
    pub store: Arc<Store>,
    /// Router submission handle.
    pub handle: RouterHandle,
    /// Agent capability index.
    pub capabilities: Arc<CapabilityIndex>,
    /// Composition loader.
    pub loader: Arc<ComponentLoader>,
    /// Fires on fatal router failure.
    pub fatal: CancellationToken,
}

/// Build and start the full stack: store, router, services, recovery,
/// transport. Returns once the socket is accepting.
///
/// `extra_drivers` lets embedders (tests) inject provider drivers; they
/// take precedence over the configured CLI commands.
///
/// # Errors
///
/// Returns any wiring failure (store, log, socket, compositions).
pub async fn assemble(
    config: DaemonConfig,
    extra_drivers: HashMap<String, Arc<dyn ProviderDriver>>,
) -> anyhow::Result<DaemonHandles> {
    // Store and shared registries.
    let store = Arc::new(Store::open(&config.store.path).context("opening store")?);
    let registry = Arc::new(HandlerRegistry::new());
    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let orchestration_index = Arc::new(OrchestrationIndex::new());
    let capability_index = Arc::new(CapabilityIndex::new());
    let transformers = Arc::new(TransformerRegistry::new());

    // Event log and router.
    let log =
        Arc::new(EventLog::open(&config.log.root, Arc::clone(&store)).context("opening event log")?);
    let router = Router::new(
        Arc::clone(&registry),
        log,
        Arc::clone(&transformers),
        Arc::clone(&subscriptions),
        Arc::clone(&orchestration_index),
        Arc::clone(&capability_index),
    );
    let fatal = router.fatal_token();
    let (handle, _router_join) = router.start();

    // Composition content.
    let loader = Arc::new(
        ComponentLoader::load(&config.composition.content_root).context("loading compositions")?,
    );

    // Providers: configured CLI commands, then injected drivers, then the
    // mock as a last-resort default.
    let mut drivers: HashMap<String, Arc<dyn ProviderDriver>> = HashMap::new();
    for (name, argv) in &config.provider.commands {
        drivers.insert(name.clone(), Arc::new(CliDriver::new(name.clone(), argv.clone())));
    }
    for (name, driver) in extra_drivers {
        drivers.insert(name, driver);
    }
    drivers
        .entry("mock".to_owned())
        .or_insert_with(|| Arc::new(MockDriver::new()));

    // Services.
    let tracker = Arc::new(SessionTracker::new(
        Arc::clone(&store),
        Duration::from_secs(config.session.lock_timeout_secs),
    ));
    let completion = CompletionService::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        drivers,
        config.completion.clone(),
        config.provider.clone(),
        Arc::clone(&capability_index),
        handle.clone(),
    );
    let agents = AgentService::new(
        Arc::clone(&store),
        Arc::clone(&loader),
        Arc::clone(&capability_index),
        Arc::clone(&orchestration_index),
        handle.clone(),
        config.agents.clone(),
    );
    let orchestrations = OrchestrationService::new(
        Arc::clone(&store),
        Arc::clone(&loader),
        Arc::clone(&orchestration_index),
        handle.clone(),
        config.transport.outbound_watermark,
    );

    // Event surface.
    let clients = Arc::new(ClientRegistry::new());
    completion.register_handlers(&registry);
    agents.register_handlers(&registry);
    orchestrations.register_handlers(&registry);
    ksi_router::register_discovery_handlers(&registry);
    ksi_transport::register_monitor_handlers(&registry, &clients, &subscriptions);
    crate::handlers::register_state_handlers(&registry, &store);
    crate::handlers::register_composition_handlers(&registry, &store, &loader);
    crate::handlers::register_system_handlers(&registry, &store);
    crate::handlers::register_transformer_reload(&registry, &loader, &transformers);

    // Declarative transformer rules shipped as compositions.
    match crate::handlers::load_transformer_sets(&loader) {
        Ok(set) => {
            info!(rules = set.len(), "transformer rules loaded");
            transformers.swap(set);
        },
        Err(e) => warn!(error = %e, "transformer load failed; starting with none"),
    }

    // Restart recovery: indexes first, then requests.
    let revived_agents = agents.recover().context("agent recovery")?;
    let revived_orchs = orchestrations.recover().context("orchestration recovery")?;
    let report = completion
        .recover(Duration::from_secs(config.session.restart_grace_secs))
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("completion recovery")?;
    info!(
        agents = revived_agents,
        orchestrations = revived_orchs,
        resurrected = report.resurrected.len(),
        abandoned = report.abandoned.len(),
        "recovery complete"
    );

    let _workers = completion.start_workers();

    // Transport last: nothing answers before recovery is done.
    let server = TransportServer::new(
        config.transport.clone(),
        handle.clone(),
        Arc::clone(&clients),
        Arc::clone(&subscriptions),
    );
    let _accept = server.spawn().context("binding transport socket")?;

    info!(socket = %config.transport.socket_path.display(), "ksid ready");
    Ok(DaemonHandles {
        config,
        store,
        handle,
        capabilities: capability_index,
        loader,
        fatal,
    })
}

/// Assemble, then serve until a signal (or fatal failure) stops us.
///
/// # Errors
///
/// Returns wiring failures, or an error after a fatal router failure
/// (with the shutdown marker written).
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "ksid starting");

    // Previous fatal shutdown?
    let marker_path = config.log.root.join(SHUTDOWN_MARKER);
    if marker_path.exists() {
        warn!(marker = %marker_path.display(), "previous run ended fatally; recovering");
        let _ = std::fs::remove_file(&marker_path);
    }

    let handles = assemble(config, HashMap::new()).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    let fatal_fired = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received");
            false
        },
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            false
        },
        () = handles.fatal.cancelled() => {
            error!("router hit a fatal condition");
            true
        },
    };

    if fatal_fired {
        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(e) = std::fs::write(&marker_path, format!("fatal router failure at {stamp}\n")) {
            error!(error = %e, "could not write shutdown marker");
        }
    }

    handles.handle.shutdown();
    let _ = std::fs::remove_file(&handles.config.transport.socket_path);
    info!("ksid stopped");
    if fatal_fired {
        anyhow::bail!("fatal router failure; shutdown marker written");
    }
    Ok(())
}
