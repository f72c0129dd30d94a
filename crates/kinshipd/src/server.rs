use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use kinship_config::KinshipConfig;
use kinship_engine::{AckStatus, EventAck, IssueEventHandler, trigger_reply};
use kinship_github::IssueLabeler;
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
pub const GITHUB_DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Clone)]
struct AppState {
    handler: Arc<IssueEventHandler>,
    labeler: Option<Arc<dyn IssueLabeler>>,
    webhook_path: Arc<str>,
    reply_label: Arc<str>,
}

/// `labeler` is `None` when no GitHub credentials are available.
pub fn router(
    handler: Arc<IssueEventHandler>,
    labeler: Option<Arc<dyn IssueLabeler>>,
    config: &KinshipConfig,
) -> Router {
    let webhook_path = config.webhook.path.as_str();
    let state = AppState {
        handler,
        labeler,
        webhook_path: Arc::from(webhook_path),
        reply_label: Arc::from(config.triage.reply_label.as_str()),
    };

    Router::new()
        .route("/", get(status))
        .route("/trigger-reply/{issue_number}", get(trigger_reply_label))
        .route(webhook_path, post(webhook))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "listening for webhook deliveries");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "kinshipd",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "webhook_path": &*state.webhook_path,
    }))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<EventAck>) {
    let event = header_str(&headers, GITHUB_EVENT_HEADER);
    let delivery = header_str(&headers, GITHUB_DELIVERY_HEADER).unwrap_or("-");

    let Some(event) = event else {
        return respond(StatusCode::BAD_REQUEST, EventAck::error("missing X-GitHub-Event header"));
    };
    if event != "issues" {
        tracing::debug!(event, delivery, "ignoring non-issues delivery");
        return respond(
            StatusCode::OK,
            EventAck::ignored(format!("event '{event}' is not handled")),
        );
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(delivery, error = %err, "delivery body is not JSON");
            return respond(
                StatusCode::BAD_REQUEST,
                EventAck::error(format!("delivery body is not valid JSON: {err}")),
            );
        }
    };
    let Some(action) = payload.get("action").and_then(Value::as_str) else {
        return respond(
            StatusCode::BAD_REQUEST,
            EventAck::error("issues delivery carries no action"),
        );
    };

    tracing::info!(delivery, action, "handling issues delivery");
    let ack = state.handler.handle(action, &payload).await;
    let status = match ack.status {
        AckStatus::Success | AckStatus::Ignored => StatusCode::OK,
        AckStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond(status, ack)
}

async fn trigger_reply_label(
    State(state): State<AppState>,
    Path(issue_number): Path<i64>,
) -> (StatusCode, Json<Value>) {
    let Some(labeler) = state.labeler.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "message": "GitHub credentials are not configured",
            })),
        );
    };

    match trigger_reply(labeler.as_ref(), issue_number, &state.reply_label).await {
        Ok(trigger) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Reply label toggled",
                "issue_number": trigger.issue_number,
                "label": trigger.label,
                "was_labeled": trigger.was_labeled,
            })),
        ),
        Err(err) => {
            tracing::error!(issue_number, error = %err, "failed to trigger reply");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn respond(status: StatusCode, ack: EventAck) -> (StatusCode, Json<EventAck>) {
    (status, Json(ack))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use kinship_config::KinshipConfig;
    use kinship_github::{GithubError, IssueLabeler};
    use kinship_store::IssueStore;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    use super::router;
    use crate::commands::{build_event_handler, open_store};

    const WEBHOOK_PATH: &str = "/github/webhook";

    #[derive(Default)]
    struct FakeLabels {
        labels: Mutex<BTreeSet<(i64, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl IssueLabeler for FakeLabels {
        async fn remove_label(&self, issue_number: i64, label: &str) -> Result<bool, GithubError> {
            if self.fail {
                return Err(GithubError::UnexpectedResponse("404 issue not found".to_owned()));
            }
            Ok(self
                .labels
                .lock()
                .expect("lock")
                .remove(&(issue_number, label.to_owned())))
        }

        async fn add_labels(&self, issue_number: i64, labels: &[&str]) -> Result<(), GithubError> {
            let mut current = self.labels.lock().expect("lock");
            for label in labels {
                current.insert((issue_number, (*label).to_owned()));
            }
            Ok(())
        }
    }

    async fn router_with(
        labeler: Option<Arc<dyn IssueLabeler>>,
    ) -> (TempDir, Arc<kinship_store::IndexedIssueStore>, axum::Router) {
        let temp = tempdir().expect("tempdir");
        let config = KinshipConfig::default();
        let store = open_store(temp.path()).await.expect("open store");
        let handler = build_event_handler(&config, store.clone(), None);
        let app = router(Arc::new(handler), labeler, &config);
        (temp, store, app)
    }

    async fn test_router() -> (TempDir, Arc<kinship_store::IndexedIssueStore>, axum::Router) {
        router_with(None).await
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn delivery(action: &str) -> Value {
        json!({
            "action": action,
            "issue": {
                "id": 9001,
                "number": 12,
                "title": "Login fails with 401",
                "body": null,
                "state": "open",
                "locked": false,
                "user": { "login": "octocat" },
                "labels": [{ "name": "bug" }],
                "assignees": [],
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z",
                "closed_at": null,
                "html_url": "https://github.com/acme/widgets/issues/12",
                "comments": 0
            },
            "repository": { "full_name": "acme/widgets" }
        })
    }

    fn post(event: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("content-type", "application/json");
        if let Some(event) = event {
            builder = builder.header("x-github-event", event);
        }
        builder.body(Body::from(body)).expect("request")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn status_endpoint_reports_webhook_path() {
        let (_temp, _store, app) = test_router().await;

        let response = app
            .oneshot(get("/"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["webhook_path"], WEBHOOK_PATH);
    }

    #[tokio::test]
    async fn opened_delivery_is_persisted_and_acknowledged() {
        let (_temp, store, app) = test_router().await;

        let response = app
            .oneshot(post(Some("issues"), delivery("opened").to_string()))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["issue_number"], 12);
        assert_eq!(body["comment_posted"], false);

        let stored = store.get(9001).await.expect("read").expect("stored");
        assert_eq!(stored.title, "Login fails with 401");
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let (_temp, _store, app) = test_router().await;

        let response = app
            .oneshot(post(Some("ping"), json!({ "zen": "Keep it simple" }).to_string()))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ignored");
    }

    #[tokio::test]
    async fn malformed_deliveries_are_rejected() {
        let (_temp, _store, app) = test_router().await;

        let missing_header = app
            .clone()
            .oneshot(post(None, delivery("opened").to_string()))
            .await
            .expect("response");
        assert_eq!(missing_header.status(), StatusCode::BAD_REQUEST);

        let not_json = app
            .clone()
            .oneshot(post(Some("issues"), "{ nope".to_owned()))
            .await
            .expect("response");
        assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(not_json).await["status"], "error");

        let bad_issue = app
            .oneshot(post(
                Some("issues"),
                json!({ "action": "opened", "issue": { "id": 1 } }).to_string(),
            ))
            .await
            .expect("response");
        assert_eq!(bad_issue.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(bad_issue).await["status"], "error");
    }

    #[tokio::test]
    async fn trigger_reply_toggles_configured_label() {
        let labels = Arc::new(FakeLabels::default());
        labels
            .labels
            .lock()
            .expect("lock")
            .insert((12, "tiara".to_owned()));
        let (_temp, _store, app) = router_with(Some(labels.clone())).await;

        let response = app
            .clone()
            .oneshot(get("/trigger-reply/12"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["label"], "tiara");
        assert_eq!(body["was_labeled"], true);

        let unlabeled = app
            .oneshot(get("/trigger-reply/13"))
            .await
            .expect("response");
        assert_eq!(body_json(unlabeled).await["was_labeled"], false);
        assert!(labels.labels.lock().expect("lock").contains(&(13, "tiara".to_owned())));
    }

    #[tokio::test]
    async fn trigger_reply_reports_missing_credentials_and_failures() {
        let (_temp, _store, app) = test_router().await;
        let response = app
            .oneshot(get("/trigger-reply/12"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let failing = Arc::new(FakeLabels {
            fail: true,
            ..FakeLabels::default()
        });
        let (_temp, _store, app) = router_with(Some(failing)).await;
        let response = app
            .clone()
            .oneshot(get("/trigger-reply/12"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["status"], "error");

        let not_a_number = app
            .oneshot(get("/trigger-reply/abc"))
            .await
            .expect("response");
        assert_eq!(not_a_number.status(), StatusCode::BAD_REQUEST);
    }
}
