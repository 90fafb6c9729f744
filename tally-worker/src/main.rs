//! Consume upload envelopes into categorized transaction records.
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;

use tally_common::health::HealthRegistry;
use tally_common::metrics::{serve, setup_metrics_router};
use tally_common::pgqueue::PgEnvelopeQueue;
use tally_common::pgstore::{build_pool, PgCategoryStore, PgTransactionStore};
use tally_common::retry::RetryPolicy;
use tally_worker::classifier::HttpClassifier;
use tally_worker::config::Config;
use tally_worker::error::WorkerError;
use tally_worker::reader::S3ObjectReader;
use tally_worker::worker::{BatchConsumer, ConsumerSettings};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    // The consumer reports liveness between cycles, and one cycle can wait
    // on permits held by envelopes spending their full processing budget.
    let liveness = HealthRegistry::new("liveness");
    let liveness_deadline = time::Duration::try_from(config.message_deadline.0 * 2)
        .expect("message deadline out of range");
    let worker_liveness = liveness
        .register("consumer".to_string(), liveness_deadline)
        .await;

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

    let pool = build_pool(
        &config.database_url,
        config.max_pg_connections,
        "tally_worker",
    )
    .map_err(|e| WorkerError::ConfigError(e.to_string()))?;

    let queue = PgEnvelopeQueue::new_from_pool(
        config.queue_name.as_str(),
        pool.clone(),
        config.visibility_timeout.0,
        config.max_receives,
    );
    let transactions = PgTransactionStore::new_from_pool(pool.clone());
    let categories = PgCategoryStore::new_from_pool(pool);
    let reader = S3ObjectReader::from_env().await;
    let classifier = HttpClassifier::new(&config.classifier_url, config.classifier_timeout.0);

    let consumer = BatchConsumer::new(
        &config.worker_name,
        Arc::new(queue),
        Arc::new(reader),
        Arc::new(classifier),
        Arc::new(transactions),
        Arc::new(categories),
        ConsumerSettings {
            poll_interval: config.poll_interval.0,
            batch_size: config.batch_size,
            max_concurrent_envelopes: config.max_concurrent_envelopes,
            confidence_threshold: config.confidence_threshold,
            message_deadline: config.message_deadline.0,
        },
        retry_policy,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router().route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    consumer.run().await?;

    Ok(())
}
