//! HTTP route handlers for the agent API.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use reconcile::error::Error;
use reconcile::manager::Tick;
use reconcile::scheduler::Beat;
use reconcile::status::State as Snapshot;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::AppState;

/// Build the API router, mounted under `/api`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/fetch", post(post_fetch))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - latest published snapshot.
async fn get_status(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.snapshot())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchRequest {
    remote: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
struct FetchReply {
    queued: bool,
    message: String,
}

fn fetch_reply(
    status: StatusCode,
    queued: bool,
    message: impl Into<String>,
) -> (StatusCode, Json<FetchReply>) {
    (
        status,
        Json(FetchReply {
            queued,
            message: message.into(),
        }),
    )
}

/// POST /api/fetch - request a fetch of all remotes, or of `{"remote": ..}`.
///
/// The request joins the same coalescing slot as the periodic ticker. When a
/// reconciliation is already waiting this one is folded into it and answered
/// with `Queued: false`; its remote filter is not applied.
async fn post_fetch(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<FetchReply>) {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        FetchRequest::default()
    } else {
        match serde_json::from_slice::<FetchRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return fetch_reply(
                    StatusCode::BAD_REQUEST,
                    false,
                    format!("invalid fetch request: {err}"),
                );
            }
        }
    };

    if let Some(remote) = request.remote.as_deref() {
        if !state.knows_remote(remote) {
            let err = Error::UnknownRemote {
                remote: remote.to_string(),
            };
            return fetch_reply(StatusCode::NOT_FOUND, false, err.to_string());
        }
    }

    info!(remote = ?request.remote, "fetch requested");
    match state.trigger.beat(Tick::Fetch {
        remote: request.remote,
    }) {
        Beat::Accepted => fetch_reply(StatusCode::ACCEPTED, true, "fetch queued"),
        Beat::Coalesced => fetch_reply(
            StatusCode::OK,
            false,
            "folded into the reconciliation already pending",
        ),
        Beat::Closed => fetch_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            false,
            "the reconciliation worker has stopped",
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use reconcile::core::types::{BranchStatus, RemoteStatus};
    use reconcile::scheduler::{Inbox, channel};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::*;

    fn app() -> (Router, Inbox<Tick>, watch::Sender<Snapshot>) {
        let mut snapshot = Snapshot::default();
        snapshot.builder.hostname = "web-1".to_string();
        snapshot.fetcher.repository_status.remotes.push(RemoteStatus {
            name: "origin".to_string(),
            main: BranchStatus::new("main"),
            ..RemoteStatus::default()
        });
        let (status_tx, status_rx) = watch::channel(snapshot);
        let (trigger, inbox) = channel::<Tick>();
        let router = Router::new()
            .nest("/api", api_router())
            .with_state(AppState::new(status_rx, trigger));
        (router, inbox, status_tx)
    }

    async fn send(router: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        (status, body.to_vec())
    }

    fn reply(body: &[u8]) -> FetchReply {
        serde_json::from_slice(body).expect("fetch reply")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (router, _inbox, _tx) = app();
        let (status, body) = send(router, "GET", "/api/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn status_serves_latest_snapshot() {
        let (router, _inbox, tx) = app();
        tx.send_modify(|snapshot| snapshot.builder.need_to_reboot = true);

        let (status, body) = send(router, "GET", "/api/status", "").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["Builder"]["Hostname"], "web-1");
        assert_eq!(value["Builder"]["NeedToReboot"], true);
        assert_eq!(
            value["Fetcher"]["RepositoryStatus"]["Remotes"][0]["Name"],
            "origin"
        );
    }

    #[tokio::test]
    async fn fetch_without_body_queues_full_fetch() {
        let (router, inbox, _tx) = app();
        let (status, body) = send(router, "POST", "/api/fetch", "").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(reply(&body).queued);
        assert_eq!(inbox.try_recv(), Some(Tick::Fetch { remote: None }));
    }

    #[tokio::test]
    async fn fetch_of_known_remote_is_queued() {
        let (router, inbox, _tx) = app();
        let (status, _) = send(router, "POST", "/api/fetch", r#"{"remote":"origin"}"#).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            inbox.try_recv(),
            Some(Tick::Fetch {
                remote: Some("origin".to_string())
            })
        );
    }

    #[tokio::test]
    async fn fetch_of_unknown_remote_is_rejected() {
        let (router, inbox, _tx) = app();
        let (status, body) = send(router, "POST", "/api/fetch", r#"{"remote":"nope"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let reply = reply(&body);
        assert!(!reply.queued);
        assert!(reply.message.contains("doesn't exist"));
        assert_eq!(inbox.try_recv(), None);
    }

    #[tokio::test]
    async fn fetch_while_one_is_pending_is_not_reported_queued() {
        let (router, inbox, _tx) = app();
        let (first, body) =
            send(router.clone(), "POST", "/api/fetch", r#"{"remote":"origin"}"#).await;
        assert_eq!(first, StatusCode::ACCEPTED);
        assert!(reply(&body).queued);

        let (second, body) = send(router, "POST", "/api/fetch", "").await;
        assert_eq!(second, StatusCode::OK);
        let reply = reply(&body);
        assert!(!reply.queued);
        assert!(reply.message.contains("folded"), "{}", reply.message);

        assert_eq!(
            inbox.try_recv(),
            Some(Tick::Fetch {
                remote: Some("origin".to_string())
            })
        );
        assert_eq!(inbox.try_recv(), None);
    }

    #[tokio::test]
    async fn fetch_after_worker_exit_is_unavailable() {
        let (router, inbox, _tx) = app();
        drop(inbox);
        let (status, body) = send(router, "POST", "/api/fetch", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!reply(&body).queued);
    }

    #[tokio::test]
    async fn malformed_fetch_body_is_bad_request() {
        let (router, _inbox, _tx) = app();
        let (status, _) = send(router, "POST", "/api/fetch", "{remote").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
