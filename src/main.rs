use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use screenshot_worker::{
    health, ChromeRenderer, Config, Consumer, Coordinator, DynamoRecordStore, Render,
    S3ObjectStore, SqsQueue, WorkerMetrics,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    setup_logging(&config.log_level)?;

    info!("starting screenshot-worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        queue = %config.queue_url,
        bucket = %config.bucket_name,
        table = %config.table_name,
        batch_size = config.batch_size,
        "configuration loaded"
    );

    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()))
        .load()
        .await;

    let records = Arc::new(DynamoRecordStore::new(
        aws_sdk_dynamodb::Client::new(&aws_config),
        config.table_name.clone(),
    ));
    let objects = Arc::new(S3ObjectStore::new(
        aws_sdk_s3::Client::new(&aws_config),
        config.bucket_name.clone(),
        config.aws_region.clone(),
    ));
    let queue = SqsQueue::new(aws_sdk_sqs::Client::new(&aws_config), &config);

    // A broken Chrome install should kill the pod at startup, not surface as
    // per-message failures.
    let renderer = Arc::new(ChromeRenderer::new(config.clone()));
    renderer.warm().await?;
    info!("renderer warmed");

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port).await {
            error!("health endpoint exited: {e}");
        }
    });

    let metrics = Arc::new(WorkerMetrics::new());
    let coordinator = Arc::new(Coordinator::new(
        records,
        objects,
        renderer.clone(),
        config.viewport,
        metrics.clone(),
    ));
    let consumer = Consumer::new(queue, coordinator, metrics, config.batch_size);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    spawn_signal_handler(shutdown_tx);

    let drained = consumer.run(shutdown_rx).await;

    renderer.close().await;

    if !drained {
        error!("in-flight handlers did not finish before the shutdown deadline");
        std::process::exit(1);
    }

    info!("screenshot-worker stopped");
    Ok(())
}

fn setup_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Ok(())
}

fn spawn_signal_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(());
    });
}
