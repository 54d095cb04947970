use std::sync::Arc;

use actix_web::{
    dev::ServerHandle,
    get,
    web::Data,
    App, HttpResponse, HttpServer, Responder,
};
use anyhow::Context;
use guardian_common::tokio::{spawn_task, sync::Mutex};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::status::StatusTracker;

struct AppState {
    status: Arc<StatusTracker>,
    prometheus: PrometheusHandle,
}

/// Liveness/readiness probe for the supervisor
#[get("/healthz")]
async fn healthz(data: Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.status.snapshot())
}

/// Prometheus exposition
#[get("/metrics")]
async fn metrics_endpoint(data: Data<AppState>) -> impl Responder {
    data.prometheus.render()
}

pub type SharedApiServer = Arc<ApiServer>;

/// Small HTTP sidecar: health probe + metrics, nothing else is exposed
pub struct ApiServer {
    handle: Mutex<Option<ServerHandle>>,
}

impl ApiServer {
    pub async fn start(
        bind_address: &str,
        status: Arc<StatusTracker>,
    ) -> anyhow::Result<SharedApiServer> {
        let (recorder, _) = PrometheusBuilder::new()
            .build()
            .context("Failed to create Prometheus handler")?;
        let prometheus = recorder.handle();
        metrics::set_global_recorder(Box::new(recorder))
            .context("Failed to set global recorder for Prometheus")?;

        let state = Data::new(AppState { status, prometheus });
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .service(healthz)
                .service(metrics_endpoint)
        })
        .bind(bind_address)
        .with_context(|| format!("Failed to bind http server on {}", bind_address))?
        .disable_signals()
        .run();

        info!("http server listening on {}", bind_address);
        let handle = server.handle();
        spawn_task("http-server", async move {
            if let Err(e) = server.await {
                error!("http server error: {}", e);
            }
        });

        Ok(Arc::new(Self {
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(true).await;
        }
    }
}
