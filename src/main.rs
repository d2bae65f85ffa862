use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_file_ingest::config::IngestConfig;
use rust_file_ingest::infrastructure::{bus, scanner, storage};
use rust_file_ingest::services::worker::SessionSweeper;
use rust_file_ingest::{AppState, create_app};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    /// Inline no-op scanning, short session TTL
    Development,
    /// Environment configuration with a mandatory token secret
    Production,
    /// Environment configuration as-is
    Env,
}

#[derive(Parser, Debug)]
#[command(name = "rust-file-ingest", version, about = "Upload ingestion service")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Configuration preset
    #[arg(long, value_enum, default_value_t = Profile::Env)]
    profile: Profile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_file_ingest=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Rust File Ingest...");

    let config = match cli.profile {
        Profile::Development => IngestConfig::development(),
        Profile::Production => IngestConfig::production(),
        Profile::Env => IngestConfig::from_env(),
    };
    config.validate()?;
    info!(
        "🛡️  Ingest Config: Max Size={}MB, Timeout={}ms, Scan Mode={:?}, Scanner={}",
        config.max_file_size / 1024 / 1024,
        config.upload_timeout_ms,
        config.scan_mode,
        config.virus_scanner_type
    );

    // Setup Infrastructure
    let storage_service = storage::setup_storage().await?;
    let scanner_service = scanner::setup_scanner(&config).await;
    let message_bus = bus::setup_bus(&config);

    let sweep_every = (config.session_ttl() / 4).max(std::time::Duration::from_secs(1));
    let state = AppState::new(config.clone(), storage_service, scanner_service, message_bus);

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Start Session Sweeper
    let sweeper = SessionSweeper::new(state.monitor().clone(), sweep_every, shutdown_rx);
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let app = create_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            ),
    );

    info!("✅ Server ready at http://{}", cli.bind);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
