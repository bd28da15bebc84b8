//! Serve command

use crate::api::{create_router, AppState};
use crate::cli::ServeArgs;
use crate::config::HestiaConfig;
use crate::executor::{HttpExecutor, RemoteExecutor};
use crate::persistence::MetadataStore;
use crate::registry::ServiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Load configuration, apply env and CLI overrides, and validate.
pub fn load_config_with_overrides(
    args: &ServeArgs,
) -> Result<HestiaConfig, Box<dyn std::error::Error>> {
    let path = std::env::var("HESTIA_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| args.config.clone());

    let mut config = HestiaConfig::load(Some(&path))?.with_env_overrides();

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Wait for SIGINT or SIGTERM and fire the shared cancellation token.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
}

/// Main serve handler.
pub async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_with_overrides(&args)?;
    crate::logging::init_tracing(&config.logging)?;

    tracing::info!(
        services = config.services.len(),
        port = config.server.port,
        "Starting Hestia gateway"
    );

    let store = match &config.server.database_path {
        Some(path) => match MetadataStore::open(path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Metadata store unavailable; continuing without persistence");
                None
            }
        },
        None => None,
    };

    let executor: Option<Arc<dyn RemoteExecutor>> = match &config.executor.base_url {
        Some(base_url) if config.executor.is_configured() => {
            tracing::info!(executor = %base_url, "Remote executor configured");
            Some(Arc::new(HttpExecutor::new(
                base_url.clone(),
                config.executor.project_id,
                Duration::from_secs(config.executor.timeout_seconds),
            )) as Arc<dyn RemoteExecutor>)
        }
        _ => None,
    };

    let registry = Arc::new(ServiceRegistry::from_config(&config));
    let cancel = CancellationToken::new();

    let state = Arc::new(AppState::new(
        Arc::new(config.clone()),
        Arc::clone(&registry),
        executor,
        store,
        cancel.clone(),
    ));

    let idle_handle = Arc::clone(&state.idle).start(cancel.clone());

    // Queues drain with a shutdown signal as soon as the token fires, so
    // parked requests fail fast instead of waiting out their deadlines
    {
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            registry.shutdown_all_queues();
        });
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Waiting for background tasks");
    idle_handle.await?;

    tracing::info!("Gateway stopped");
    Ok(())
}
