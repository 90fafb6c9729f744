use std::convert::Infallible;
use std::sync::Arc;

use axum::{routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use tally_common::metrics::track_metrics;
use tally_common::queue::EnvelopeQueue;
use tally_common::store::TransactionStore;

use super::{notification, transaction};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn EnvelopeQueue>,
    pub transactions: Arc<dyn TransactionStore>,
}

pub fn add_routes(router: Router, state: AppState, concurrency_limit: usize) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop in the api, just check axum health
        .route(
            "/notification",
            routing::post(notification::post_notification)
                .with_state(state.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit)),
        )
        .route(
            "/dead_letters",
            routing::get(notification::get_dead_letters).with_state(state.clone()),
        )
        .route(
            "/transactions/in_progress",
            routing::get(transaction::list_in_progress).with_state(state.clone()),
        )
        .route(
            "/transactions/pending_validation",
            routing::get(transaction::list_pending_validation).with_state(state),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "tally api"
}
