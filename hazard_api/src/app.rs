use crate::{
    artifact::ArtifactStore, cleanup::RetryPolicy, config::Config, sampler::OpenCvOpener,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};
use yolo_detector::{ClassLabels, Detector, OrtDetector};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = config.stream.validate() {
        tracing::error!("Invalid stream configuration: {}", e);
        return Err(e.into());
    }

    let labels = match ClassLabels::load(&config.labels) {
        Ok(labels) => labels,
        Err(e) => {
            tracing::error!("Failed to load class labels: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Loaded {} class labels", labels.len());

    let detector: Arc<dyn Detector> = match OrtDetector::new(&config.model, labels) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let artifact_store = ArtifactStore::new(
        &config.cleanup.temp_root,
        RetryPolicy::from(&config.cleanup),
        config.stream.upload_chunk_bytes,
    );
    tracing::info!("Storing uploads under {:?}", artifact_store.root());

    let state = SharedState {
        detector,
        artifact_store,
        opener: Arc::new(OpenCvOpener),
        stream_config: config.stream.clone(),
        metrics,
    };

    let server = HttpServer::new(
        state,
        &config.server.get_address(),
        config.server.max_upload_bytes(),
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server exited with error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
