use apix_storage::{create_pool, run_migrations, PostgresStore, RedisStorage};
use gateway::{build_router, run_heartbeat_sweep, AppState, Config};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(64);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!("connecting to storage...");
    let storage = match RedisStorage::connect(&config.redis_url).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(error = %e, "failed to connect to storage");
            std::process::exit(69);
        }
    };

    info!("connecting to relational store...");
    let pool = match create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to relational store");
            std::process::exit(69);
        }
    };
    if let Err(e) = run_migrations(&pool).await {
        error!(error = %e, "failed to run migrations");
        std::process::exit(69);
    }
    let relational = Arc::new(PostgresStore::new(pool));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, storage.clone(), storage, relational);
    tokio::spawn(run_heartbeat_sweep(state.clone()));
    let router = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind");
            std::process::exit(69);
        }
    };

    info!(addr = %bind_addr, "gateway listening");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
