//! Recodex server: durable job store, scheduler, event processor, and the
//! HTTP surface workers and UIs talk to.

mod errors;
mod events;
mod scheduler;
mod store;
mod streams;
mod web;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use recodex_broker::Broker;
use recodex_config::{
    BrokerConfig, DatabaseConfig, SchedulerConfig, WebConfig, telemetry,
};

use crate::events::{EventPublisher, run_event_processor};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::web::AppState;

#[derive(Debug, Parser)]
#[command(name = "recodex-server")]
#[command(about = "Distributed transcoding server: job store, scheduler, and worker coordination")]
struct Args {
    #[command(flatten)]
    database: DatabaseConfig,

    #[command(flatten)]
    broker: BrokerConfig,

    #[command(flatten)]
    scheduler: SchedulerConfig,

    #[command(flatten)]
    web: WebConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    let store = Store::connect(&args.database)
        .await
        .context("connecting to database")?;
    store.initialize().await.context("initializing schema")?;
    info!("database ready");

    let broker = Arc::new(Broker::connect(&args.broker).await.context("connecting to broker")?);
    let cancel = CancellationToken::new();

    let publisher = EventPublisher::new(broker.clone(), args.broker.clone());
    let scheduler = Arc::new(Scheduler::new(
        args.scheduler,
        store.clone(),
        publisher,
        cancel.clone(),
    ));

    let processor = tokio::spawn(run_event_processor(
        broker,
        args.broker,
        store,
        scheduler.clone(),
        cancel.clone(),
    ));
    let schedule_loop = tokio::spawn(scheduler.clone().run());

    let state = AppState {
        scheduler,
        token: args.web.token.clone(),
    };
    let app = web::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.web.port))
        .await
        .with_context(|| format!("binding port {}", args.web.port))?;
    info!(port = args.web.port, "webserver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("http server failed")?;

    cancel.cancel();
    if let Err(err) = schedule_loop.await {
        error!(error = %err, "scheduling loop panicked");
    }
    match processor.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "event processor exited with error"),
        Err(err) => error!(error = %err, "event processor panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal detected");
    cancel.cancel();
}
