mod api;
mod config;
mod core;
mod engine;
mod error;
mod jobs;
mod packages;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::api::AppState;
use crate::config::AppConfig;
use crate::core::runtimes::RuntimeRegistry;
use crate::engine::sandbox::{IsolateBackend, SandboxConfig, SandboxPool};
use crate::packages::PackageRepository;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playground=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    info!("Starting Playground engine {}...", env!("CARGO_PKG_VERSION"));

    let registry = RuntimeRegistry::load(&config)?;
    info!(
        "Loaded {} runtimes from {} and {}",
        registry.list().len(),
        config.runtimes_config.display(),
        config.packages_dir().display()
    );

    let backend = IsolateBackend::new(SandboxConfig::from_app(&config));

    // Ensure we have cgroup support; fail fast otherwise
    backend
        .ensure_cgroups_available(config.box_id_offset)
        .await?;
    info!("Confirmed isolate cgroup support is available");

    let pool = SandboxPool::new(
        Arc::new(backend),
        config.box_id_offset,
        config.max_concurrent_jobs,
        config.max_queue_depth,
    );
    info!(
        "Sandbox pool: {} boxes starting at id {} (queue depth: {})",
        pool.capacity(),
        config.box_id_offset,
        config
            .max_queue_depth
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unbounded".into())
    );

    let packages = Arc::new(PackageRepository::new(&config));
    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState::new(Arc::new(config), registry, pool, packages));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Playground engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
