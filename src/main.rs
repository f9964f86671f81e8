mod args;
mod connector;
mod discovery;
mod fakeip;
mod ip_pool;
mod message;
mod node_id;
mod platform;
mod route_table;
mod router;
mod rule;
mod shutdown;
mod wire;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use args::{Args, Config};
use connector::Connector;
use discovery::{PeerDiscovery, StaticDiscovery};
use fakeip::FakeIpEngine;
use node_id::NodeIdentity;
use platform::Platform;
use router::port::PortKind;
use router::{Router, RouterConfig};
use wire::p2p::P2pManager;
use wire::tunnel::TunnelManager;
use wire::wireguard::{WireGuardConfig, WireGuardListener, WireGuardManager};
use wire::WireRegistry;

/// Ties every collaborator together for the lifetime of one run. Nothing
/// outside `main` holds a `System`; it exists so the wiring below reads as
/// one sequence of constructions rather than a pile of loose `let`s (§10.7).
struct System {
    router: Arc<Router>,
    connector: Arc<Connector>,
    platform: Platform,
    config: Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log_level.clone();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = args.resolve().await.context("invalid configuration")?;
    let system = build(config).await?;

    dial_startup_endpoints(&system).await;

    if !system.config.forward.is_empty() {
        if let Ok((gateway, iface)) = system.platform.gateway.default_gateway().await {
            tracing::info!(target: "main", %gateway, %iface, "resolved default uplink for forwarded traffic");
        }
        system
            .platform
            .nat
            .setup_nat(&system.config.tun_name)
            .await
            .context("failed to set up NAT for forwarded networks")?;
        // iptables/NAT reconfiguration can race a route manager replacing the
        // tunnel's own subnet route; put it back the way the teacher's
        // `setup_nat` does right after installing the NAT rules.
        system
            .platform
            .routes
            .set_route(system.config.local_network, &system.config.tun_name)
            .await
            .context("failed to (re)install the overlay subnet route")?;
    }

    wait_for_shutdown(&system).await;
    Ok(())
}

/// Constructs every long-lived collaborator and wires them together, in
/// dependency order: identity, then the wire managers it seeds, then the
/// router the managers' wires get registered against, then the connector
/// that drives dialing (§10.7).
async fn build(config: Config) -> Result<System> {
    let identity = NodeIdentity::load_or_generate(&config.namespace)
        .context("failed to load or generate node identity")?;
    tracing::info!(target: "main", node_id = %identity.id(), namespace = %config.namespace, "node identity loaded");

    let platform = Platform::reference();

    let local_addr = config.local_network.addr();

    let mut registry = WireRegistry::new();
    registry.register(Arc::new(TunnelManager));
    registry.register(Arc::new(
        P2pManager::new(identity.libp2p_keypair()).context("failed to start libp2p swarm")?,
    ));
    registry.register(Arc::new(WireGuardManager::new(local_addr)));

    let inbound = registry.take_inbound();
    let outbound = registry.take_outbound();
    let wg_listener_inbound = registry.inbound_sender();
    let registry = Arc::new(registry);

    spawn_fixed_wireguard_listener(&config, local_addr, wg_listener_inbound).await?;

    let router = Router::new(RouterConfig {
        node_id: identity.id().to_string(),
        max_metric: router::DEFAULT_MAX_METRIC,
        local_networks: vec![config.local_network],
    });
    router.spawn_sweeper();

    let tunnel_wire = TunnelManager::open(&config.tun_name, config.local_network)
        .context("failed to open local tun device")?;
    router.register_port(tunnel_wire, PortKind::Tunnel).await;

    if let Some(pool) = config.fakeip_pool {
        let engine = FakeIpEngine::new(pool, config.rules.clone());
        router.attach_fakeip(Arc::clone(&engine)).await;
        spawn_fakeip_sweeper(&router, engine);
        tracing::info!(target: "main", pool = %pool, "fake-ip engine attached");
    }

    // Listener failures are already logged by the registry itself; nothing
    // here needs the join handles.
    let _ = registry.spawn_listeners();

    let connector = Connector::new(Arc::clone(&router), Arc::clone(&registry));
    connector.spawn(inbound, outbound);

    Ok(System {
        router,
        connector,
        platform,
        config,
    })
}

/// Drives the fake-IP engine's own eviction sweep (§4.5: "a background task
/// every 120 s evicts entries older than 900 s and returns their fake IPs
/// to the pool"), mirroring the shape of [`Router::spawn_sweeper`] — the
/// router's sweeper only ever touches the route table, so the fake-IP
/// engine needs this independent loop to actually age out its mappings.
fn spawn_fakeip_sweeper(router: &Arc<Router>, engine: Arc<FakeIpEngine>) {
    let mut done = router.done();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(fakeip::SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = done.wait() => break,
                _ = tick.tick() => engine.sweep().await,
            }
        }
    });
}

/// `-wg <path>` opens a second, fixed-config WireGuard endpoint that only
/// listens: the registry already holds a dial-only [`WireGuardManager`] for
/// outbound `-e wireguard/<path>` endpoints, and a protocol name can only be
/// registered once, so the listener side runs as its own task and feeds the
/// registry's inbound channel directly instead (§6, §9).
async fn spawn_fixed_wireguard_listener(
    config: &Config,
    local_addr: Ipv4Addr,
    inbound: mpsc::Sender<wire::BoxWire>,
) -> Result<()> {
    let Some(path) = &config.wireguard_config else {
        return Ok(());
    };
    let wg_config = WireGuardConfig::load(path.to_string_lossy().as_ref())
        .await
        .with_context(|| format!("failed to load wireguard config {path:?}"))?;
    let listener = WireGuardListener::new(local_addr, wg_config);
    tokio::spawn(async move {
        use wire::WireManager;
        if let Err(err) = listener.listen(inbound).await {
            tracing::warn!(target: "main", %err, "wireguard listener exited");
        }
    });
    Ok(())
}

/// Resolves the namespace's bootstrap peers plus every `-e` endpoint and
/// queues them all for dialing (§4.4, §6).
async fn dial_startup_endpoints(system: &System) {
    let discovery = StaticDiscovery::new(
        system.config.namespace.clone(),
        system.config.bootstrap.clone(),
        system.config.private,
    );
    for endpoint in discovery.bootstrap_endpoints() {
        system.connector.dial(endpoint);
    }
    for endpoint in &system.config.endpoints {
        system.connector.dial(endpoint.clone());
    }
}

/// Installs a double-interrupt handler (first press drains the router and
/// tears down NAT, second press exits immediately) and blocks until the
/// graceful path completes (§6, §9).
async fn wait_for_shutdown(system: &System) {
    let interrupted = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

    {
        let interrupted = Arc::clone(&interrupted);
        let result = ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                tracing::warn!(target: "main", "second interrupt, exiting immediately");
                std::process::exit(130);
            }
            tracing::info!(target: "main", "interrupt received, shutting down (press again to force)");
            let _ = shutdown_tx.send(());
        });
        if let Err(err) = result {
            tracing::warn!(target: "main", %err, "failed to install signal handler");
        }
    }

    shutdown_rx.recv().await;
    system.router.close().await;

    if !system.config.forward.is_empty() {
        if let Err(err) = system.platform.nat.cleanup_nat(&system.config.tun_name).await {
            tracing::warn!(target: "main", %err, "failed to clean up NAT rules");
        }
        if let Err(err) = system
            .platform
            .routes
            .remove_route(system.config.local_network, &system.config.tun_name)
            .await
        {
            tracing::warn!(target: "main", %err, "failed to remove overlay subnet route");
        }
    }

    tracing::info!(target: "main", "shutdown complete");
}
