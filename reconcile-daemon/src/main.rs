//! `reconciled`: the deployment agent daemon.
//!
//! One worker thread owns the manager and runs reconciliation passes; a
//! ticker thread and `POST /api/fetch` trigger it through a coalescing slot.
//! The HTTP server only reads published snapshots.

mod routes;
mod state;

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use reconcile::executor::Backend;
use reconcile::io::config::{DEFAULT_CONFIG_PATH, load_config};
use reconcile::io::host::Host;
use reconcile::logging;
use reconcile::manager::{Manager, Tick};
use reconcile::scheduler::{self, run_worker, spawn_ticker};
use reconcile::status::State as Snapshot;
use tokio::sync::{oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "reconciled")]
#[command(about = "Deploy the commit selected from tracked git remotes onto this host")]
struct Args {
    /// Path to the agent configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("reconcile=info,reconciled=info,tower_http=info");

    let args = Args::parse();
    let cfg = load_config(&args.config)?;
    let backend = Backend::from_config(&cfg)?;
    info!(
        hostname = %cfg.hostname,
        executor = ?backend.kind(),
        remotes = cfg.repository.remotes.len(),
        "starting reconciled"
    );

    let (status_tx, status_rx) = watch::channel(Snapshot::default());
    let mut manager = Manager::new(&cfg, backend, Host::default())?.with_publisher(move |state| {
        status_tx.send_replace(state.clone());
    });
    manager.publish();

    let (trigger, inbox) = scheduler::channel::<Tick>();
    spawn_ticker(
        trigger.clone(),
        Duration::from_secs(cfg.poller.period_secs),
        || Tick::Periodic,
    )?;

    let (stopped_tx, stopped_rx) = oneshot::channel::<()>();
    thread::Builder::new()
        .name("worker".to_string())
        .spawn(move || {
            run_worker(inbox, |tick| {
                let outcome = manager.tick(&tick)?;
                if outcome.restart_required {
                    warn!("agent service definition changed, restarting");
                    return Ok(ControlFlow::Break(()));
                }
                Ok(ControlFlow::Continue(()))
            });
            // The receiver is gone only once the server has already stopped.
            let _ = stopped_tx.send(());
        })
        .context("spawn worker thread")?;

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(status_rx, trigger));

    let addr = cfg.http.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stopped_rx))
        .await?;

    info!("reconciled stopped");
    Ok(())
}

/// Resolve on Ctrl-C or when the worker stops.
async fn shutdown_signal(worker_stopped: oneshot::Receiver<()>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("interrupted, shutting down"),
            Err(err) => warn!(err = %err, "cannot listen for ctrl-c, shutting down"),
        },
        _ = worker_stopped => info!("worker stopped, shutting down"),
    }
}
