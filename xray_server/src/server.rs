use crate::{
    config::Config,
    preview::PreviewStore,
    routes::{api_routes, root_routes},
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, http::HeaderValue, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
};
use xray_prediction::{InferenceService, ModelService};

pub const PREVIEW_URL_PREFIX: &str = "/static/uploads";

pub struct SharedState<M: ModelService> {
    pub inference_service: InferenceService<M>,
    pub previews: PreviewStore,
    pub metrics: Arc<Metrics>,
    pub staging_dir: PathBuf,
    pub project_name: String,
    pub api_prefix: String,
    pub model_version: String,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            inference_service: self.inference_service.clone(),
            previews: self.previews.clone(),
            metrics: self.metrics.clone(),
            staging_dir: self.staging_dir.clone(),
            project_name: self.project_name.clone(),
            api_prefix: self.api_prefix.clone(),
            model_version: self.model_version.clone(),
        }
    }
}

impl<M: ModelService> SharedState<M> {
    pub fn new(
        inference_service: InferenceService<M>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Self {
            inference_service,
            previews: PreviewStore::new(
                config.server.get_uploads_dir(),
                PREVIEW_URL_PREFIX,
                &config.previews,
            ),
            metrics,
            staging_dir: config.server.get_staging_dir(),
            project_name: config.project_name.clone(),
            api_prefix: config.get_api_prefix(),
            model_version: config.model.version.clone(),
        }
    }
}

pub fn build_router<M: ModelService>(state: SharedState<M>, config: &Config) -> Router {
    let api_prefix = state.api_prefix.clone();
    let router = if api_prefix.is_empty() {
        Router::new().merge(api_routes::<M>())
    } else {
        Router::new().nest(&api_prefix, api_routes::<M>())
    };

    let router = router
        .merge(root_routes::<M>())
        .nest_service("/static", ServeDir::new(&config.server.static_dir))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .with_state(state)
        .layer(HttpMetricsLayerBuilder::new().build());

    match cors_layer(&config.server.cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(router: Router, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_only_when_origins_configured() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["http://localhost:3000".to_string()]).is_some());
        assert!(cors_layer(&["*".to_string()]).is_some());
    }
}
