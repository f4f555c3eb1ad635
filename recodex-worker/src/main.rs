//! Recodex worker: consumes encode and PGS tasks, runs the crash-resumable
//! download/encode/upload pipeline, and reports progress back to the
//! server.

mod client;
mod consumers;
mod errors;
mod pgs;
mod pipeline;
mod retry;
mod status;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use recodex_broker::Broker;
use recodex_config::{BrokerConfig, JobType, WorkerConfig, telemetry};

use crate::client::{ActiveJobs, Manager, WorkerClient, public_ip};
use crate::pgs::PgsConverter;
use crate::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(name = "recodex-worker")]
#[command(about = "Transcoding worker: encode pipeline and PGS subtitle conversion")]
struct Args {
    #[command(flatten)]
    broker: BrokerConfig,

    #[command(flatten)]
    worker: WorkerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    let temp_root = args
        .worker
        .temporal_path
        .join(format!("worker-{}", args.worker.name));
    tokio::fs::create_dir_all(&temp_root)
        .await
        .with_context(|| format!("creating {}", temp_root.display()))?;

    let broker = Arc::new(
        Broker::connect(&args.broker)
            .await
            .context("connecting to broker")?,
    );
    let shutdown = CancellationToken::new();
    let active: ActiveJobs = Arc::new(DashMap::new());

    let ip = public_ip().await;
    info!(name = %args.worker.name, ip = %ip, "worker starting");

    let client = Arc::new(WorkerClient::new(
        broker.clone(),
        args.broker.clone(),
        args.worker.clone(),
        active.clone(),
        ip,
        shutdown.clone(),
    ));
    let manager: Arc<dyn Manager> = client.clone();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let client = client.clone();
        async move { client.run_control_consumer().await }
    }));
    tasks.push(tokio::spawn({
        let client = client.clone();
        async move { client.run_ping_loop().await }
    }));

    if args.worker.accepts(JobType::Encode) {
        let pipeline = Pipeline::start(
            args.worker.clone(),
            temp_root.clone(),
            manager.clone(),
            active.clone(),
            shutdown.clone(),
        );
        pipeline.resume().await;
        tasks.push(tokio::spawn(consumers::run_encode_consumer(
            broker.clone(),
            args.broker.clone(),
            args.worker.clone(),
            pipeline,
            shutdown.clone(),
        )));
    }

    if args.worker.accepts(JobType::PgsToSrt) {
        let converter = Arc::new(PgsConverter::new(
            args.worker.clone(),
            temp_root.join("pgs"),
            manager.clone(),
        ));
        tasks.push(tokio::spawn(consumers::run_pgs_consumer(
            broker.clone(),
            args.broker.clone(),
            args.worker.clone(),
            converter,
            active.clone(),
            shutdown.clone(),
        )));
    }

    shutdown_signal().await;
    info!("termination signal detected");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
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
}
