//! markroute daemon entry point.
//!
//! Startup order matters: the kernel facts (interface table, default route)
//! are captured before rule compilation, the fwmark rule goes in before any
//! route does, and the workers only start once the permanent routes are
//! queued. Shutdown reverses it: listener and workers wind down first, then
//! the policy rule and table are removed.

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::process;
use std::sync::{Arc, Mutex};

use markroute_lib::config::{self, Settings};
use markroute_lib::interval::IntervalTree;
use markroute_lib::prefix::{self, FilePrefixSource, StaticPrefixes};
use markroute_lib::rules::{IfaceTable, RuleSet};
use markroute_lib::{logging, rules};

mod cli;
mod routing;
mod server;

use routing::batcher::Batcher;
use routing::conntrack_ops::NetfilterConntrack;
use routing::engine::RouteEngine;
use routing::expirer::Expirer;
use routing::netlink_ops::{KernelOps, RealNetlinkOps};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Rules(#[from] rules::Error),
    #[error(transparent)]
    Prefix(#[from] prefix::Error),
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    logging::init();
    let args = cli::parse();

    if let Err(error) = run(args).await {
        tracing::error!(%error, "fatal startup error");
        process::exit(1);
    }
}

async fn run(args: cli::Cli) -> Result<(), StartupError> {
    let settings = config::load(&args.config)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        table = settings.table,
        interfaces = ?settings.interfaces,
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    // Fail fast on missing signal streams, before touching the kernel.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::task::spawn(conn);
    let kernel = RealNetlinkOps::new(handle, settings.table);

    let ifaces = capture_iface_table(&kernel, &settings).await?;
    let rules = compile_rules(&settings, &ifaces)?;
    tracing::info!(
        countries = rules.countries.len(),
        nets = rules.nets.len(),
        domains = rules.domains.len(),
        "rule set compiled"
    );

    let shutdown = CancellationToken::new();
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let index = Arc::new(Mutex::new(IntervalTree::new()));
    let engine = RouteEngine::new(
        index.clone(),
        Arc::new(rules),
        kernel.clone(),
        queue_tx.clone(),
        settings.domain_route_ttl,
    );

    routing::fwmark::cleanup_stale(&kernel, settings.pbr_mark, settings.table).await;
    let infra = routing::fwmark::setup(kernel.clone(), settings.pbr_mark, settings.table).await?;

    engine.load_permanent().await;

    let batcher = Batcher::new(
        kernel.clone(),
        NetfilterConntrack::open()?,
        queue_rx,
        settings.clean_conntrack,
        shutdown.clone(),
    );
    let batcher_handle = tokio::spawn(batcher.run());

    let expirer = Expirer::new(
        index,
        NetfilterConntrack::open()?,
        queue_tx.clone(),
        shutdown.clone(),
    );
    let expirer_handle = tokio::spawn(expirer.run());

    let listener = TcpListener::bind(("0.0.0.0", settings.ws_port)).await?;
    tracing::info!(port = settings.ws_port, "listening for resolver records");
    let listener_handle = tokio::spawn(server::listen(listener, engine, shutdown.clone()));

    tokio::select! {
        _ = sigint.recv() => tracing::debug!("received SIGINT"),
        _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    // The engine inside the listener task holds the last queue sender; once
    // the listener returns, the batcher sees the queue close after draining.
    drop(queue_tx);
    let _ = listener_handle.await;
    let _ = expirer_handle.await;
    let _ = batcher_handle.await;

    infra.teardown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Captures the interface table and default route once. Every interface the
/// rule set references must resolve now; failures are fatal.
async fn capture_iface_table<K: KernelOps>(
    kernel: &K,
    settings: &Settings,
) -> Result<IfaceTable, routing::Error> {
    let default_route = kernel.default_route().await?;
    tracing::debug!(?default_route, "captured host default route");

    let mut links = HashMap::new();
    for name in settings.interface_names() {
        let index = kernel.resolve_interface(&name).await?;
        tracing::debug!(%name, index, "resolved egress interface");
        links.insert(name, index);
    }
    Ok(IfaceTable::new(links, default_route))
}

fn compile_rules(settings: &Settings, ifaces: &IfaceTable) -> Result<RuleSet, StartupError> {
    if settings.has_country_rules() {
        let source = FilePrefixSource::load(&settings.country_prefixes)?;
        Ok(RuleSet::compile(settings, &source, ifaces)?)
    } else {
        Ok(RuleSet::compile(settings, &StaticPrefixes::default(), ifaces)?)
    }
}
