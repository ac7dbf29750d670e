//! Binary entry point: loads configuration, wires `logagent-core`
//! components together, serves the admin HTTP surface, and drains
//! monitors, dispatcher, sinks, and positions in order on shutdown.

mod admin;
mod build;
mod errors;
mod state;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use clap::Parser;
use logagent_config::{validate, Cli};
use logagent_core::dispatcher::{DeadLetterQueue, Dispatcher, PriorityClassifier};
use logagent_core::monitor::{ContainerMonitor, ContainerRuntimeClient, DockerEngineClient, FileMonitor};
use logagent_core::position::PositionStore;
use logagent_core::shutdown::{with_deadline, ShutdownCoordinator};
use logagent_core::sink::DiskBuffer;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const QUEUE_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "logagent_server=info,logagent_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, config_source) = match logagent_config::source::load(&cli.config, &Cli::default_config_path()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to load config: {e:#}");
            return 1;
        }
    };

    let report = validate::validate(&config);
    for warning in &report.warnings {
        warn!("config warning: {warning}");
    }
    if !report.errors.is_empty() {
        for e in &report.errors {
            error!("config error: {e}");
        }
        return 1;
    }

    if cli.validate_config {
        info!("configuration is valid");
        return 0;
    }

    info!(source = ?config_source, "configuration loaded");

    match start(cli, config, config_source).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal startup error: {e:#}");
            2
        }
    }
}

async fn start(cli: Cli, config: logagent_config::Config, config_source: logagent_config::ConfigSource) -> anyhow::Result<i32> {
    let metrics = Arc::new(logagent_core::metrics::Registry::new());
    let positions = Arc::new(PositionStore::load(
        config.positions.path.clone(),
        config.positions.max_resident,
        config.positions.eviction_ttl,
    )?);
    let dlq = Arc::new(DeadLetterQueue::open(config.dlq.dir.clone())?);
    let buffer = Arc::new(DiskBuffer::open(config.buffer.dir.clone())?);

    let pipeline = build::build_pipeline(&config)?;
    let sinks = build::build_sinks(&config).await?;
    let classifier = PriorityClassifier::new(config.dispatcher.priority.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher.queue.clone(),
        pipeline,
        classifier,
        sinks,
        config.dispatcher.retry.clone(),
        dlq,
        buffer,
        positions.clone(),
        metrics.clone(),
    ));

    let shutdown = ShutdownCoordinator::new();
    let mut monitor_handles = Vec::new();

    if let Some(file_config) = &config.sources.file_monitor {
        let monitor = Arc::new(FileMonitor::new(file_config.clone(), dispatcher.clone(), positions.clone())?);
        monitor_handles.push(tokio::spawn(monitor.run(shutdown.monitors_token())));
    }
    if let Some(container_config) = &config.sources.container_monitor {
        let docker_host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| "http://localhost:2375".to_string());
        let client: Arc<dyn ContainerRuntimeClient> = Arc::new(DockerEngineClient::new(docker_host));
        let monitor = Arc::new(ContainerMonitor::new(container_config.clone(), client, dispatcher.clone(), positions.clone()));
        monitor_handles.push(tokio::spawn(monitor.run(shutdown.monitors_token())));
    }
    if monitor_handles.is_empty() {
        warn!("no source monitors configured; the agent is only reachable via POST /api/v1/logs");
    }

    let dispatcher_handles = dispatcher.spawn(shutdown.dispatcher_token());

    let state = state::AppState {
        config: Arc::new(ArcSwap::new(Arc::new(config.clone()))),
        config_path: cli.config.clone(),
        default_config_path: Cli::default_config_path(),
        config_source: Arc::new(ArcSwap::new(Arc::new(config_source))),
        dispatcher: dispatcher.clone(),
        positions: positions.clone(),
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
        admin_auth_token: config.security.admin_auth_token.clone(),
        started_at: Instant::now(),
        http_sequence: Arc::new(AtomicU64::new(0)),
    };

    let app = admin::router(state);
    let listener = tokio::net::TcpListener::bind(config.server.admin_bind_addr).await?;
    info!(addr = %config.server.admin_bind_addr, "admin HTTP surface listening");

    let sample_metrics = tokio::spawn(sample_metrics_loop(dispatcher.clone(), metrics.clone(), shutdown.leaf_token()));

    let serve_shutdown = shutdown.leaf_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(async move { serve_shutdown.cancelled().await }).await
    });

    wait_for_termination().await;
    info!("shutdown signal received, draining");

    shutdown.cancel_monitors();
    for handle in monitor_handles {
        let _ = with_deadline(Duration::from_secs(5), handle).await;
    }

    let drained = with_deadline(QUEUE_DRAIN_DEADLINE, async {
        while dispatcher.queue_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    shutdown.cancel_dispatcher();
    let mut dispatcher_drained = true;
    for handle in dispatcher_handles {
        if with_deadline(Duration::from_secs(10), handle).await.is_none() {
            dispatcher_drained = false;
        }
    }

    positions.flush()?;
    shutdown.cancel_leaf();
    let _ = server.await;
    let _ = sample_metrics.await;

    if drained.is_none() || !dispatcher_drained {
        warn!("forced shutdown: drain deadline exceeded");
        return Ok(3);
    }
    Ok(0)
}

async fn wait_for_termination() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

/// Periodically refreshes the gauges that have no natural call site
/// (queue depth/capacity, circuit breaker state, DLQ/retry queue size),
/// the same "ticker samples, handlers push" split the dispatcher's own
/// retry scheduler uses.
async fn sample_metrics_loop(dispatcher: Arc<Dispatcher>, metrics: Arc<logagent_core::metrics::Registry>, shutdown: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                metrics.set_queue_depth(dispatcher.queue_depth() as u64, dispatcher.queue_capacity() as u64);
                metrics.set_dlq_size(dispatcher.dlq().len());
            }
        }
    }
}
