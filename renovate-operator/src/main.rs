//! Renovate Operator
//!
//! Standalone operator process. Renovate jobs and their secrets come from a
//! tenants manifest, runs are podman containers on the local host.
//!
//! Startup:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: Seed the in-memory stores, connect to podman
//! - Services: Job manager, discovery agent, workload templates
//! - Loops: Scheduler, executor and reconciler until Ctrl-C

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renovate_operator::config::Config;
use renovate_operator::health::HealthCheck;
use renovate_operator::manifest::TenantManifest;
use renovate_operator::reconciler::Reconciler;
use renovate_operator::repository::{
    InMemorySecretRepository, InMemoryTenantRepository, PodmanWorkloadRepository,
    SecretRepository, TenantRepository, WorkloadRepository, check_podman_available,
};
use renovate_operator::scheduler::{Executor, ExecutorSettings, Scheduler};
use renovate_operator::service::{
    DiscoveryAgent, DiscoverySettings, InMemoryMetrics, JobManager, MetricsSink,
    StandardDiscoveryAgent, StandardJobManager, StandardWorkloadTemplates, TemplateSettings,
    WorkloadTemplates,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renovate_operator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Renovate Operator");

    let config = load_config()?;
    info!(
        "Loaded configuration: executor_interval={:?}, resync_interval={:?}, tenants_file={}",
        config.executor_interval,
        config.resync_interval,
        config.tenants_file.display()
    );

    check_podman_available()
        .await
        .context("Podman is required to run workloads")?;

    // Initialize repositories
    let manifest = if config.tenants_file.exists() {
        TenantManifest::load(&config.tenants_file)?
    } else {
        warn!(
            "Tenants manifest {} not found, starting without renovate jobs",
            config.tenants_file.display()
        );
        TenantManifest::default()
    };

    let tenant_store = Arc::new(InMemoryTenantRepository::new());
    let secret_store = Arc::new(InMemorySecretRepository::new());
    let workloads: Arc<dyn WorkloadRepository> =
        Arc::new(PodmanWorkloadRepository::new(manifest.secret_data()));
    let seeded = manifest
        .seed(tenant_store.as_ref(), secret_store.as_ref())
        .await?;
    info!("Loaded {} renovate job(s)", seeded);

    let tenants: Arc<dyn TenantRepository> = tenant_store;
    let secrets: Arc<dyn SecretRepository> = secret_store;

    // Initialize services
    let shutdown = CancellationToken::new();
    let health = HealthCheck::new();
    let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
    let templates: Arc<dyn WorkloadTemplates> = Arc::new(StandardWorkloadTemplates::new(
        TemplateSettings::from(&config),
    ));
    let manager: Arc<dyn JobManager> = Arc::new(StandardJobManager::new(
        tenants.clone(),
        workloads.clone(),
        secrets,
        metrics.clone(),
    ));
    let discovery: Arc<dyn DiscoveryAgent> = Arc::new(StandardDiscoveryAgent::new(
        workloads.clone(),
        templates.clone(),
        DiscoverySettings::from(&config),
        shutdown.clone(),
    ));

    info!("Services initialized");

    // Start loops
    let scheduler = Arc::new(Scheduler::new(health.clone(), shutdown.clone()));
    scheduler.start();

    let executor = Arc::new(Executor::new(
        manager.clone(),
        workloads,
        templates,
        metrics,
        health.clone(),
        ExecutorSettings::from(&config),
    ));
    let executor_handle = executor.start(shutdown.clone());

    let reconciler = Arc::new(Reconciler::new(
        tenants,
        manager,
        discovery,
        scheduler.clone(),
        config.resync_interval,
    ));
    let reconciler_handle = reconciler.start(shutdown.clone());

    info!("Operator running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    shutdown.cancel();
    scheduler.stop();

    if let Err(e) = executor_handle.await {
        warn!("Executor task ended abnormally: {}", e);
    }
    if let Err(e) = reconciler_handle.await {
        warn!("Reconciler task ended abnormally: {}", e);
    }

    info!("Renovate Operator stopped");
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            warn!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
