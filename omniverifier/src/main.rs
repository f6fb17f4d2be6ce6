use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use omniverifier::completion::{CompletionHooks, LogNotifier};
use omniverifier::config::{Args, Config, ObjectStoreConfig};
use omniverifier::enrichment::EnrichmentWorkers;
use omniverifier::governor::RateGovernor;
use omniverifier::lifecycle::LifecyclePoller;
use omniverifier::objstore::{LocalObjectStore, ObjectStore, S3ObjectStore};
use omniverifier::packer::Packer;
use omniverifier::provider::ReqwestProvider;
use omniverifier::store::PostgresStore;
use omniverifier::sweeper::StuckBatchSweeper;
use omniverifier::telemetry;
use omniverifier::types::CheckType;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

async fn run<O: ObjectStore + 'static>(
    config: Config,
    store: Arc<PostgresStore>,
    objects: Arc<O>,
) -> anyhow::Result<()> {
    let provider = Arc::new(ReqwestProvider::new(&config.provider));
    let governor = Arc::new(RateGovernor::new(store.clone(), &config.engine));
    let enrichment = EnrichmentWorkers::new(store.clone(), objects, config.engine.clone());
    let hooks = CompletionHooks::new()
        .with(Arc::new(LogNotifier))
        .with(Arc::new(enrichment));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for check_type in CheckType::ALL {
        let packer = Arc::new(Packer::new(
            store.clone(),
            provider.clone(),
            governor.clone(),
            config.engine.clone(),
            check_type,
        ));
        tasks.spawn(packer.run(shutdown.child_token()));

        let poller = Arc::new(LifecyclePoller::new(
            store.clone(),
            provider.clone(),
            governor.clone(),
            hooks.clone(),
            config.engine.clone(),
            check_type,
        ));
        tasks.spawn(poller.run(shutdown.child_token()));

        let sweeper = Arc::new(StuckBatchSweeper::new(
            store.clone(),
            hooks.clone(),
            config.engine.clone(),
            check_type,
        ));
        tasks.spawn(sweeper.run(shutdown.child_token()));
    }

    shutdown_signal().await;
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let store = Arc::new(PostgresStore::connect(&config.database).await?);
    tracing::info!("Connected to database and ran migrations");

    match config.object_store.clone() {
        ObjectStoreConfig::Local { root } => {
            let objects = Arc::new(LocalObjectStore::new(root));
            run(config, store, objects).await
        }
        s3_config @ ObjectStoreConfig::S3 { .. } => {
            let objects = Arc::new(S3ObjectStore::from_config(&s3_config).await?);
            run(config, store, objects).await
        }
    }
}
