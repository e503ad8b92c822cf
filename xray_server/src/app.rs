use crate::config::Config;
use crate::server::{build_router, HttpServer, SharedState};
use crate::telemetry::Metrics;

use std::sync::Arc;
use tokio::{signal, sync::broadcast};
use xray_prediction::{load_model, InferenceService, Transform};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let transform = Transform::new(config.transform.clone())?;

    let (model_service, classes) = match load_model(&config.model, &config.classes, &transform) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!("Failed to load model: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        "Loaded model {} with classes {:?}",
        config.model.version,
        classes.get_labels()
    );

    let inference_service =
        InferenceService::new(model_service, classes, transform, &config.inference)?;
    let metrics = Arc::new(Metrics::new()?);

    let state = SharedState::new(inference_service, metrics, &config);
    let router = build_router(state, &config);
    let server = HttpServer::new(router, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

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
