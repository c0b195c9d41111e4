use anyhow::{Context, Result};
use facematch_core::ScrfdDetector;
use facematch_transport::SpoolQueue;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod worker;

use config::Config;
use worker::{EdgeWorker, WorkerError};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematch-edge starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(?config, "configuration loaded");

    let inbox = SpoolQueue::open(&config.inbox_dir).context("opening inbox")?;
    let requests = SpoolQueue::open(&config.request_queue_dir).context("opening request queue")?;
    let responses =
        SpoolQueue::open(&config.response_queue_dir).context("opening response queue")?;

    let detector = ScrfdDetector::load(&config.detector_model, config.crop_settings())
        .context("loading face detector")?;
    let engine = engine::spawn_engine(detector)?;

    let worker = EdgeWorker::new(inbox, requests, responses, engine, config.batch_size);

    tracing::info!(inbox = %config.inbox_dir.display(), "facematch-edge ready");

    let mut ticker = tokio::time::interval(config.poll_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match worker.poll_once().await {
                    Ok(_) => {}
                    Err(WorkerError::EngineStopped) => {
                        anyhow::bail!("detection engine stopped, exiting");
                    }
                    Err(e) => tracing::error!(error = %e, "inbox poll failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("facematch-edge shutting down");
    Ok(())
}
