use anyhow::{Context, Result};
use facematch_core::{Gallery, GalleryStore, OnnxEmbedder};
use facematch_transport::SpoolQueue;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod worker;

use config::Config;
use worker::{CloudWorker, WorkerError};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematch-cloud starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(?config, "configuration loaded");

    // A gallery that does not load is fatal at startup.
    let gallery = Gallery::load(&config.gallery_path)
        .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?;
    if let (Some(expected), Some(actual)) = (config.model_version.as_deref(), gallery.model_version())
    {
        if expected != actual {
            anyhow::bail!("gallery built with model {actual}, embedder is {expected}");
        }
    }
    let store = Arc::new(GalleryStore::new(gallery));

    let requests = SpoolQueue::open(&config.request_queue_dir).context("opening request queue")?;
    let responses =
        SpoolQueue::open(&config.response_queue_dir).context("opening response queue")?;

    let embedder = OnnxEmbedder::load(&config.embedder_model, config.embedder_settings())
        .context("loading embedding model")?;
    let engine = engine::spawn_engine(embedder)?;

    let worker = CloudWorker::new(
        requests,
        responses,
        engine,
        Arc::clone(&store),
        config.matcher()?,
        config.batch_size,
    );

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tracing::info!(
        queue = %config.request_queue_dir.display(),
        max_distance = config.max_distance,
        "facematch-cloud ready"
    );

    let mut ticker = tokio::time::interval(config.poll_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match worker.poll_once().await {
                    Ok(_) => {}
                    Err(WorkerError::EngineStopped) => {
                        anyhow::bail!("recognition engine stopped, exiting");
                    }
                    Err(e) => tracing::error!(error = %e, "request poll failed"),
                }
            }
            _ = hangup.recv() => {
                match store.reload(&config.gallery_path) {
                    Ok(gallery) => tracing::info!(entries = gallery.len(), "gallery reloaded"),
                    Err(e) => tracing::error!(error = %e, "gallery reload failed, keeping current"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("facematch-cloud shutting down");
    Ok(())
}
