pub mod api;
pub mod config;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::api::{handlers, middleware};
use crate::config::IngestConfig;
use crate::services::bus::MessageBus;
use crate::services::deadline::DeadlineController;
use crate::services::ingestion::IngestionCoordinator;
use crate::services::lifecycle::UploadLifecycleMonitor;
use crate::services::rpc::RpcGateway;
use crate::services::scan_dispatcher::ScanRequestDispatcher;
use crate::services::scanner::VirusScanner;
use crate::services::storage::ObjectStorage;
use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IngestConfig>,
    pub deadlines: Arc<DeadlineController>,
    pub gateway: Arc<RpcGateway>,
    pub dispatcher: Arc<ScanRequestDispatcher>,
    pub coordinator: Arc<IngestionCoordinator>,
}

impl AppState {
    pub fn new(
        config: IngestConfig,
        storage: Arc<dyn ObjectStorage>,
        scanner: Arc<dyn VirusScanner>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let gateway = Arc::new(RpcGateway::new(
            bus,
            Duration::from_millis(config.rpc_default_timeout_ms),
        ));
        let dispatcher = Arc::new(ScanRequestDispatcher::new(&config, scanner, gateway.clone()));
        let monitor = Arc::new(UploadLifecycleMonitor::from_config(&config));
        let coordinator = Arc::new(IngestionCoordinator::new(
            &config,
            monitor,
            storage,
            dispatcher.clone(),
        ));

        Self {
            deadlines: Arc::new(DeadlineController::from_config(&config)),
            config: Arc::new(config),
            gateway,
            dispatcher,
            coordinator,
        }
    }

    pub fn monitor(&self) -> &Arc<UploadLifecycleMonitor> {
        self.coordinator.monitor()
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/upload/*path", post(handlers::upload::upload_file))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::deadline::deadline_middleware,
        ))
        .route("/health", get(handlers::health::health_check))
        .layer(from_fn(middleware::request_id::request_id_middleware))
        .with_state(state)
}
