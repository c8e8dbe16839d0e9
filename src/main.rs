use clap::Parser;
use dotenvy::dotenv;
use image_gateway::config::AppConfig;
use image_gateway::infrastructure::database;
use image_gateway::services::edge_cache::EdgeCache;
use image_gateway::services::executor::{GenerationExecutor, GenerationSettings};
use image_gateway::services::object_store::B2Store;
use image_gateway::services::task_store::TaskStore;
use image_gateway::services::vertex::VertexModel;
use image_gateway::services::worker::BackgroundWorker;
use image_gateway::{create_app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the gateway
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting image gateway...");

    let config = AppConfig::from_env();
    let db = database::setup_database().await?;

    let object_store = Arc::new(B2Store::new(
        config.b2_key_id.clone(),
        config.b2_app_key.clone(),
        config.b2_bucket_name.clone(),
    ));
    let model = Arc::new(VertexModel::from_config(&config));
    let tasks = Arc::new(TaskStore::new());
    let edge_cache = Arc::new(EdgeCache::new());

    let executor = Arc::new(GenerationExecutor::new(
        tasks.clone(),
        object_store.clone(),
        model.clone(),
        GenerationSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Sweeper for expired tasks and aged edge-cache entries
    let worker = BackgroundWorker::new(tasks.clone(), edge_cache.clone(), shutdown_rx);
    tokio::spawn(worker.run());

    let state = AppState {
        db,
        object_store,
        model,
        tasks,
        edge_cache,
        executor,
        config,
    };

    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
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
    });

    let app = create_app(state).layer(trace_layer);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("gateway listening on http://0.0.0.0:{}", args.port);
    info!(
        "swagger ui: http://localhost:{}/swagger-ui",
        args.port
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
        })
        .await
    {
        error!("server runtime error: {}", e);
    }

    let _ = shutdown_tx.send(true);
    info!("gateway exited cleanly");
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
            info!("ctrl-c received, shutting down");
        },
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        },
    }
}
