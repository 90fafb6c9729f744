use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use tally_common::envelope::{Envelope, ObjectNotification};
use tally_common::queue::DeadLetter;

use super::app::AppState;

#[derive(Serialize, Deserialize)]
pub struct NotificationPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// False when the notification was accepted but carried no work, e.g.
    /// an object-removed event.
    enqueued: bool,
}

/// Accept one object store notification and enqueue an envelope for it.
///
/// Notifications for anything other than a created object are accepted and
/// dropped; the store notifies on every event type it is configured for and
/// only new uploads mean work.
pub async fn post_notification(
    State(state): State<AppState>,
    Json(payload): Json<ObjectNotification>,
) -> Result<Json<NotificationPostResponse>, (StatusCode, Json<NotificationPostResponse>)> {
    debug!("received notification: {:?}", payload);

    if !payload.event_type.is_object_created() {
        return Ok(Json(NotificationPostResponse {
            error: None,
            enqueued: false,
        }));
    }

    let envelope = Envelope::from(payload);
    if envelope.user_id().is_none() {
        return Err(bad_request(&format!(
            "object key {} has no user segment",
            envelope.object_key
        )));
    }

    let start_time = Instant::now();

    state.queue.enqueue(envelope).await.map_err(internal_error)?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("notification_api_enqueue").record(elapsed_time);

    Ok(Json(NotificationPostResponse {
        error: None,
        enqueued: true,
    }))
}

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<u32>,
}

/// List envelopes that exhausted their receive budget, oldest first.
pub async fn get_dead_letters(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<DeadLetter>>, (StatusCode, Json<NotificationPostResponse>)> {
    let dead_letters = state
        .queue
        .dead_letters(page.limit.unwrap_or(100))
        .await
        .map_err(internal_error)?;

    Ok(Json(dead_letters))
}

fn bad_request(msg: &str) -> (StatusCode, Json<NotificationPostResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(NotificationPostResponse {
            error: Some(msg.to_owned()),
            enqueued: false,
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<NotificationPostResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(NotificationPostResponse {
            error: Some(err.to_string()),
            enqueued: false,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::Value;
    use tally_common::queue::{EnvelopeQueue, MemoryQueue};
    use tally_common::store::MemoryTransactionStore;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::app::{add_routes, AppState};

    fn test_app(max_receives: i32) -> (Router, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(300), max_receives));
        let state = AppState {
            queue: queue.clone(),
            transactions: Arc::new(MemoryTransactionStore::new()),
        };
        (add_routes(Router::new(), state, 10), queue)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn notification_enqueues_an_envelope() {
        let (app, queue) = test_app(1);

        let response = app
            .oneshot(post_json(
                "/notification",
                r#"{"bucket": "uploads", "objectKey": "user-1/march.csv", "eventType": "OBJECT_CREATED_PUT"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["enqueued"], Value::Bool(true));

        let batch = queue.receive_batch("test", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope.object_key, "user-1/march.csv");
    }

    #[tokio::test]
    async fn removed_event_is_accepted_and_dropped() {
        let (app, queue) = test_app(1);

        let response = app
            .oneshot(post_json(
                "/notification",
                r#"{"bucket": "uploads", "objectKey": "user-1/march.csv", "eventType": "OBJECT_REMOVED"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["enqueued"], Value::Bool(false));

        assert!(queue.receive_batch("test", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unattributable_key_is_rejected() {
        let (app, queue) = test_app(1);

        let response = app
            .oneshot(post_json(
                "/notification",
                r#"{"bucket": "uploads", "objectKey": "march.csv", "eventType": "OBJECT_CREATED"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.receive_batch("test", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
        let (app, _queue) = test_app(1);

        let response = app
            .oneshot(post_json(
                "/notification",
                r#"{"bucket": "uploads", "objectKey": "user-1/march.csv", "eventType": "OBJECT_TAGGED"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn notification_not_json_is_rejected() {
        let (app, _queue) = test_app(1);

        let response = app.oneshot(post_json("/notification", "x")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dead_letters_are_listed() {
        let (app, queue) = test_app(1);

        queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .unwrap();
        let batch = queue.receive_batch("test", 10).await.unwrap();
        queue
            .record_failure(&batch[0].receipt, "classification was unavailable")
            .await
            .unwrap();
        queue.expire_visibility().await;
        // The sweep runs on the next receive cycle.
        assert!(queue.receive_batch("test", 10).await.unwrap().is_empty());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/dead_letters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["envelope"]["object_key"], "user-1/march.csv");
        assert_eq!(
            listed[0]["errors"][0],
            Value::String("classification was unavailable".to_owned())
        );
    }
}
