//! Firma-Sign server binary.
//!
//! Loads layered configuration, initializes logging, brings the store
//! and services up (schema migration failures abort startup), resumes
//! transfers left pending by a previous run, and serves HTTP + WebSocket
//! until interrupted. Shutdown cancels outstanding transport work and
//! allows up to five seconds of graceful drain before exiting.

use std::time::Duration;

use clap::Parser;

use firma_sign_server::app;
use firma_sign_server::config::{CliArgs, ServerConfig};

/// Grace period between the shutdown signal and forced exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_logging(config: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    if let Some(log_dir) = &config.log_dir {
        let appender = tracing_appender::rolling::daily(log_dir, "firma-sign.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = match ServerConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config);
    tracing::info!(port = config.port, storage = %config.storage_path.display(), "starting firma-sign server");

    let state = match app::bootstrap_default(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    // At-least-once: transfers left pending by a previous run go out
    // again from persistence.
    {
        let router = std::sync::Arc::clone(&state.transfer_router);
        tokio::spawn(async move {
            match router.resume_pending().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "resumed pending transfers"),
                Err(e) => tracing::warn!(error = %e, "resume of pending transfers failed"),
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let (bound_addr, server) = match firma_sign_server::http::start_server(&addr, std::sync::Arc::clone(&state)).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind server");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bound_addr, "server listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server task failed");
            }
            return;
        }
    }

    // Stop retry loops, close transports, then drain briefly.
    state.transfer_router.begin_shutdown();
    let registry = std::sync::Arc::clone(&state.registry);
    let drain = async move {
        registry.shutdown_all().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("graceful drain timed out, forcing exit");
    }
    tracing::info!("server stopped");
}
