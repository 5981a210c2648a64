use projection_store::{MemoryProjectionStore, ProjectionStore};
use servicing_processor::config::Config;
use servicing_processor::handlers::HandlerRegistry;
use servicing_processor::EventProcessor;
use std::sync::Arc;
use stream_log::{MemoryStreamLog, StreamLog};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load configuration: {error}");
            std::process::exit(1);
        }
    };

    // Initialize tracing/logging; RUST_LOG wins over LOG_LEVEL
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase())),
        )
        .init();

    tracing::info!(
        redis_url = %config.redis_url,
        mongodb_url = %config.mongodb_url,
        db_name = %config.db_name,
        inbox_stream = %config.inbox_stream,
        internal_stream = %config.internal_stream,
        consumer_group = %config.consumer_group,
        "Starting servicing event processor"
    );

    // Broker and store products are pluggable behind the platform traits;
    // this binary wires the in-memory implementations used for local
    // development, deployments swap in their production backends here.
    let log: Arc<dyn StreamLog> = Arc::new(MemoryStreamLog::new());
    let store: Arc<dyn ProjectionStore> = Arc::new(MemoryProjectionStore::new());

    let registry = HandlerRegistry::with_defaults();
    tracing::info!(handlers = registry.len(), "Handlers registered");

    let processor = Arc::new(EventProcessor::new(log, store, config, registry));

    let runner = processor.clone();
    let mut processor_task = tokio::spawn(async move { runner.start().await });

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(error = %error, "Failed to install SIGTERM handler");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = &mut processor_task => {
            // The loop only returns on its own when startup or the broker
            // failed fatally
            match result {
                Ok(Err(error)) => tracing::error!(error = %error, "Fatal processor error"),
                Ok(Ok(())) => tracing::warn!("Processor loop exited unexpectedly"),
                Err(error) => tracing::error!(error = %error, "Processor task panicked"),
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(signal = "SIGINT", "Received shutdown signal");
        }
        _ = sigterm.recv() => {
            tracing::info!(signal = "SIGTERM", "Received shutdown signal");
        }
    }

    // Graceful shutdown: the stop flag interrupts the blocking read at the
    // next block-timeout boundary; in-flight handlers complete first
    processor.stop();
    match processor_task.await {
        Ok(Ok(())) => tracing::info!("Processor shutdown complete"),
        Ok(Err(error)) => {
            tracing::error!(error = %error, "Processor failed during shutdown");
            std::process::exit(1);
        }
        Err(error) => {
            tracing::error!(error = %error, "Processor task panicked");
            std::process::exit(1);
        }
    }
}
