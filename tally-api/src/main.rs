use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use tally_common::metrics::setup_metrics_router;
use tally_common::pgqueue::PgEnvelopeQueue;
use tally_common::pgstore::{build_pool, PgTransactionStore};

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = build_pool(&config.database_url, config.max_pg_connections, "tally_api")
        .expect("failed to create a database pool");

    let queue = PgEnvelopeQueue::new_from_pool(
        &config.queue_name,
        pool.clone(),
        Duration::from_secs(config.visibility_timeout_seconds),
        config.max_receives,
    );
    let transactions = PgTransactionStore::new_from_pool(pool);

    let state = handlers::AppState {
        queue: Arc::new(queue),
        transactions: Arc::new(transactions),
    };

    let app = handlers::add_routes(Router::new(), state, config.concurrency_limit);
    let app = app.merge(setup_metrics_router());

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start tally-api http server, {}", e),
    }
}
