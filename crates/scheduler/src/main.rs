//! MultiServe Scheduler - Main Entry Point
//!
//! Loads a scheduler configuration, builds one `ModelScheduler` and a
//! fixed-size instance pool per configured model, and runs each model's
//! dispatch loop to completion.

use multiserve_common::metrics::METRICS;
use multiserve_common::{Error, MultiServeConfig, Result};
use multiserve_scheduler::{
    BackendInstance, GpuMemoryPool, IdentityLoader, ModelLoader, ModelScheduler,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multiserve_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting multiserve scheduler");

    let config_path =
        std::env::var("MULTISERVE_CONFIG").unwrap_or_else(|_| "configs/scheduler-config.yaml".to_string());
    let config = MultiServeConfig::from_file(&config_path)?;
    config.validate()?;

    info!(bind = %config.bind_address, port = config.port, "scheduler configuration loaded");

    let scheduler_config = config
        .scheduler
        .as_ref()
        .ok_or_else(|| Error::config("scheduler config not found"))?;

    GpuMemoryPool::create(scheduler_config.gpu_pool.clone())?;

    let loader = IdentityLoader;
    let mut schedulers = Vec::new();
    let mut handles = Vec::new();
    let mut instance_id: u64 = 0;

    for model in &scheduler_config.models {
        let instance_count: usize = model
            .instance_group
            .iter()
            .map(|g| g.count.max(1))
            .sum::<usize>()
            .max(1);

        let mut instances = Vec::with_capacity(instance_count);
        for _ in 0..instance_count {
            let backend = loader.load(&model.name, model)?;
            instance_id += 1;
            instances.push(Arc::new(BackendInstance::new(instance_id, backend)));
        }

        info!(
            model = %model.name,
            instances = instances.len(),
            "model loaded"
        );

        let scheduler = Arc::new(ModelScheduler::new(
            model.clone(),
            instances,
            scheduler_config.queue_capacity(),
        ));
        let run_handle = tokio::spawn(scheduler.clone().run());
        schedulers.push(scheduler);
        handles.push(run_handle);
    }

    info!(models = schedulers.len(), "all models dispatched, serving");

    let _ = signal::ctrl_c().await;
    info!("received shutdown signal");

    for scheduler in &schedulers {
        scheduler.request_shutdown();
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "dispatch loop task panicked during shutdown");
        }
    }

    info!(
        metrics = METRICS.gather().len(),
        "multiserve scheduler shutdown complete"
    );
    Ok(())
}
