//! Application startup and lifecycle management.

use crate::config::{ConsoleConfig, RegistryBackend, RegistryConfig};
use crate::handlers;
use crate::reconcile::MutationOrchestrator;
use crate::services::azure::{ConnectionString, SasTokenProvider};
use crate::services::{
    DpsClient, InMemoryProvisioning, InMemoryRegistry, IotHubClient, ProvisioningClient,
    RegistryClient,
};
use axum::{middleware::from_fn, routing::get, Router};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ConsoleConfig,
    pub registry: Arc<dyn RegistryClient>,
    pub provisioning: Arc<dyn ProvisioningClient>,
    pub orchestrator: MutationOrchestrator,
    /// Parent of every request's cancellation token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ConsoleConfig,
        registry: Arc<dyn RegistryClient>,
        provisioning: Arc<dyn ProvisioningClient>,
    ) -> Self {
        let orchestrator =
            MutationOrchestrator::new(registry.clone(), provisioning.clone(), config.poll.policy());
        Self {
            config,
            registry,
            provisioning,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }
}

fn parse_credentials(
    name: &str,
    secret: Option<&Secret<String>>,
) -> Result<ConnectionString, AppError> {
    let raw = secret.ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!("{} connection string is not set", name))
    })?;
    ConnectionString::parse(raw.expose_secret()).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("invalid {} connection string: {}", name, e))
    })
}

/// Registry and provisioning clients for the configured backend.
pub fn build_clients(
    config: &RegistryConfig,
) -> Result<(Arc<dyn RegistryClient>, Arc<dyn ProvisioningClient>), AppError> {
    match config.backend {
        RegistryBackend::Memory => {
            tracing::info!(
                host_name = %config.memory_host_name,
                index_lag = config.memory_index_lag,
                "Using in-memory registry"
            );
            let page_size = config.page_size as usize;
            let registry: Arc<dyn RegistryClient> = Arc::new(
                InMemoryRegistry::new(&config.memory_host_name, config.memory_index_lag)
                    .with_page_size(page_size),
            );
            let provisioning: Arc<dyn ProvisioningClient> = Arc::new(
                InMemoryProvisioning::new(config.memory_index_lag).with_page_size(page_size),
            );
            Ok((registry, provisioning))
        }
        RegistryBackend::Azure => {
            let ttl = chrono::Duration::seconds(config.sas_ttl_secs);
            let hub = parse_credentials("IoT Hub", config.iothub_connection_string.as_ref())?;
            let dps = parse_credentials("DPS", config.dps_connection_string.as_ref())?;
            tracing::info!(
                hub = %hub.host_name,
                dps = %dps.host_name,
                "Using Azure IoT Hub and DPS"
            );

            let registry: Arc<dyn RegistryClient> = Arc::new(
                IotHubClient::new(
                    SasTokenProvider::new(hub, ttl),
                    config.request_timeout(),
                    config.page_size,
                )
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
            );
            let provisioning: Arc<dyn ProvisioningClient> = Arc::new(
                DpsClient::new(
                    SasTokenProvider::new(dps, ttl),
                    config.request_timeout(),
                    config.page_size,
                )
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
            );
            Ok((registry, provisioning))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/api/hub", get(handlers::hub_info))
        .route(
            "/api/devices",
            get(handlers::list_devices).post(handlers::create_device),
        )
        .route(
            "/api/devices/:device_id",
            get(handlers::get_device).delete(handlers::delete_device),
        )
        .route("/api/devices/:device_id/modules", get(handlers::list_modules))
        .route(
            "/api/enrollments",
            get(handlers::list_enrollments).post(handlers::create_enrollment),
        )
        .route(
            "/api/enrollments/:registration_id",
            get(handlers::get_enrollment).delete(handlers::delete_enrollment),
        )
        .route(
            "/api/enrollments/:registration_id/attestation",
            get(handlers::get_attestation),
        )
        // Route layer so the matched path template is available for labels.
        .route_layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with clients chosen by the configuration.
    pub async fn build(config: ConsoleConfig) -> Result<Self, AppError> {
        let (registry, provisioning) = build_clients(&config.registry)?;
        Self::build_with_clients(config, registry, provisioning).await
    }

    /// Build the application around already constructed clients.
    pub async fn build_with_clients(
        config: ConsoleConfig,
        registry: Arc<dyn RegistryClient>,
        provisioning: Arc<dyn ProvisioningClient>,
    ) -> Result<Self, AppError> {
        // Port 0 picks a random port for testing.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!("iothub-console listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state: AppState::new(config, registry, provisioning),
        })
    }

    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Token that stops in-flight confirmation polls when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until `shutdown` resolves, then cancel outstanding polls and
    /// drain open requests.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.state.shutdown.clone();
        let router = build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                token.cancel();
            })
            .await
            .map_err(|e| {
                tracing::error!("HTTP server error: {}", e);
                e
            })
    }
}
