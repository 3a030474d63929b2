//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobId};
use crate::outcome::{JobResult, OutcomeKind};
use crate::service::ProcessingService;

#[derive(Debug, Deserialize)]
pub struct ProcessingRequest {
    pub id: Option<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    pub priority: Option<String>,
    pub client_id: Option<String>,
}

impl Default for ProcessingRequest {
    fn default() -> Self {
        Self {
            id: None,
            data: String::new(),
            iterations: default_iterations(),
            priority: None,
            client_id: None,
        }
    }
}

fn default_iterations() -> u32 {
    Job::DEFAULT_ITERATIONS
}

impl ProcessingRequest {
    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.data, self.iterations);
        if let Some(id) = self.id {
            job = job.with_id(id);
        }
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(client_id) = self.client_id {
            job = job.with_client_id(client_id);
        }
        job
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkProcessingRequest {
    #[serde(default)]
    pub requests: Vec<ProcessingRequest>,
}

/// Status code for a finished job.
pub fn status_for(kind: OutcomeKind) -> StatusCode {
    match kind {
        OutcomeKind::Success => StatusCode::OK,
        OutcomeKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        OutcomeKind::Cancelled => client_closed_request(),
        OutcomeKind::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Non-standard 499, used when the submitter went away or cancelled.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Cancels the submission on drop unless disarmed.
///
/// When the HTTP connection drops (client disconnect), axum drops the
/// handler future, which drops this guard and fires the token. The job keeps
/// running in its own task until the worker observes the cancellation, so
/// the slot is released by the normal path.
struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    fn new(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }

    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::info!("Client disconnected, cancelling submission");
            token.cancel();
        }
    }
}

async fn long_running(
    State(service): State<Arc<ProcessingService>>,
    body: Option<Json<ProcessingRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let job = request.into_job();
    let job_id = job.id().clone();

    tracing::info!(
        job_id = %job_id,
        client_id = job.client_id().unwrap_or("-"),
        iterations = job.iterations(),
        "Received long-running request"
    );

    let cancel = CancellationToken::new();
    let mut guard = CancelOnDrop::new(cancel.clone());

    let service_bg = Arc::clone(&service);
    let submission = tokio::spawn(async move { service_bg.submit(job, &cancel).await });
    let result = match submission.await {
        Ok(result) => result,
        Err(_) => JobResult::error(job_id, "Submission task lost"),
    };
    guard.disarm();

    if !result.is_success() {
        tracing::warn!(
            job_id = %result.job_id(),
            outcome = %result.kind(),
            reason = result.reason().unwrap_or_default(),
            "Request did not succeed"
        );
    }

    (status_for(result.kind()), Json(result.to_response()))
}

async fn bulk(
    State(service): State<Arc<ProcessingService>>,
    Json(request): Json<BulkProcessingRequest>,
) -> impl IntoResponse {
    let jobs: Vec<Job> = request
        .requests
        .into_iter()
        .map(ProcessingRequest::into_job)
        .collect();
    tracing::info!(count = jobs.len(), "Starting bulk processing");

    let cancel = CancellationToken::new();
    let mut guard = CancelOnDrop::new(cancel.clone());

    let service_bg = Arc::clone(&service);
    let submission = tokio::spawn(async move { service_bg.submit_bulk(jobs, &cancel).await });
    let response = match submission.await {
        Ok(outcome) => (StatusCode::OK, Json(outcome.to_response())),
        Err(e) => {
            tracing::error!(error = %e, "Bulk submission task lost");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Bulk processing failed" })),
            )
        }
    };
    guard.disarm();
    response
}

async fn status(State(service): State<Arc<ProcessingService>>) -> impl IntoResponse {
    Json(service.status())
}

async fn cancel_job(
    State(service): State<Arc<ProcessingService>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if service.cancel(&JobId::from(job_id)) {
        (StatusCode::OK, Json(serde_json::json!({})))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({})))
    }
}

async fn health(State(service): State<Arc<ProcessingService>>) -> impl IntoResponse {
    Json(service.health())
}

async fn shutdown(State(service): State<Arc<ProcessingService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<ProcessingService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .route("/api/processing/long-running", post(long_running))
        .route("/api/processing/bulk", post(bulk))
        .route("/api/processing/status", get(status))
        .route("/api/processing/{id}/cancel", post(cancel_job))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::ProcessorSettings;
    use crate::permit::SlotId;

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn create_service(slots: usize, tick: Duration, timeout: Duration) -> Arc<ProcessingService> {
        let settings = ProcessorSettings::default()
            .with_slots(slots)
            .with_workers(slots)
            .with_scan_interval(Duration::from_millis(5))
            .with_tick(tick)
            .with_acquisition_timeout(timeout);
        let service = Arc::new(ProcessingService::simulated(settings).unwrap());
        service.start();
        service
    }

    #[test]
    fn outcome_status_codes() {
        assert_eq!(status_for(OutcomeKind::Success), StatusCode::OK);
        assert_eq!(
            status_for(OutcomeKind::Busy),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(OutcomeKind::Cancelled).as_u16(), 499);
        assert_eq!(
            status_for(OutcomeKind::Error),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn request_defaults() {
        let request: ProcessingRequest = serde_json::from_str(r#"{"data": "x"}"#).unwrap();
        assert_eq!(request.iterations, 10);
        assert!(request.id.is_none());

        let job = ProcessingRequest {
            id: Some("fixed".to_string()),
            client_id: Some("client-7".to_string()),
            ..Default::default()
        }
        .into_job();
        assert_eq!(job.id().as_str(), "fixed");
        assert_eq!(job.client_id(), Some("client-7"));
        assert_eq!(job.iterations(), 10);
    }

    #[test]
    fn guard_cancels_unless_disarmed() {
        let token = CancellationToken::new();
        drop(CancelOnDrop::new(token.clone()));
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        let mut guard = CancelOnDrop::new(token.clone());
        guard.disarm();
        drop(guard);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn long_running_success() {
        let service = create_service(1, Duration::from_millis(1), Duration::from_secs(1));
        let app = routes(service);

        let response = app
            .oneshot(post_json(
                "/api/processing/long-running",
                serde_json::json!({ "id": "req-1", "data": "hello", "iterations": 2 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["job_id"], "req-1");
        assert_eq!(json["status"], "success");
        assert_eq!(json["slot_id"], 0);
        assert_eq!(
            json["result"],
            "Processed 'hello' through 2 iterations on slot 0"
        );
    }

    #[tokio::test]
    async fn long_running_busy_returns_503() {
        let service = create_service(1, Duration::from_millis(1), Duration::from_millis(20));
        assert!(
            service
                .manager()
                .try_acquire_specific(SlotId::new(0), &JobId::from("hog"))
                .unwrap()
        );
        let app = routes(service);

        let response = app
            .oneshot(post_json(
                "/api/processing/long-running",
                serde_json::json!({ "data": "late", "iterations": 1 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = response_json(response).await;
        assert_eq!(json["status"], "busy");
        assert_eq!(json["error"], "No slots available within timeout");
    }

    #[tokio::test]
    async fn client_disconnect_cancels_job_and_frees_slot() {
        let service = create_service(1, Duration::from_secs(60), Duration::from_secs(1));
        let app = routes(Arc::clone(&service));

        let request = tokio::spawn(app.oneshot(post_json(
            "/api/processing/long-running",
            serde_json::json!({ "data": "abandoned", "iterations": 5 }),
        )));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.manager().available_slots(), 0);

        request.abort();

        tokio::time::timeout(Duration::from_secs(2), async {
            while service.manager().available_slots() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot released after disconnect");
    }

    #[tokio::test]
    async fn bulk_returns_aggregate() {
        let service = create_service(2, Duration::from_millis(1), Duration::from_secs(1));
        let app = routes(service);

        let response = app
            .oneshot(post_json(
                "/api/processing/bulk",
                serde_json::json!({
                    "requests": [
                        { "data": "a", "iterations": 1 },
                        { "data": "b", "iterations": 1 },
                        { "data": "c", "iterations": 1 }
                    ]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["total_requests"], 3);
        assert_eq!(json["successful"], 3);
        assert_eq!(json["failed"], 0);
    }

    #[tokio::test]
    async fn status_reports_slots() {
        let service = create_service(2, Duration::from_millis(1), Duration::from_secs(1));
        let app = routes(service);

        let response = app
            .oneshot(
                Request::get("/api/processing/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["total_slots"], 2);
        assert_eq!(json["available_slots"], 2);
        assert_eq!(json["metrics"]["TotalProcessors"], "2");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_404() {
        let service = create_service(1, Duration::from_millis(1), Duration::from_secs(1));
        let app = routes(service);

        let response = app
            .oneshot(
                Request::post("/api/processing/nope/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_running_job_returns_499_to_submitter() {
        let service = create_service(1, Duration::from_secs(60), Duration::from_secs(1));

        let submit = tokio::spawn(routes(Arc::clone(&service)).oneshot(post_json(
            "/api/processing/long-running",
            serde_json::json!({ "id": "victim", "data": "x", "iterations": 3 }),
        )));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancel = routes(Arc::clone(&service))
            .oneshot(
                Request::post("/api/processing/victim/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);

        let response = submit.await.unwrap().unwrap();
        assert_eq!(response.status().as_u16(), 499);
        let json = response_json(response).await;
        assert_eq!(json["status"], "cancelled");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let service = create_service(1, Duration::from_millis(1), Duration::from_secs(1));
        let app = routes(service);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["data"]["total_processors"], 1);
    }

    #[tokio::test]
    async fn shutdown_triggers_service_shutdown() {
        let service = create_service(1, Duration::from_millis(1), Duration::from_secs(1));
        let mut rx = service.shutdown_rx();
        let app = routes(service);

        assert!(!*rx.borrow());

        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
