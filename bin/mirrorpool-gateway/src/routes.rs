//! HTTP routes
//!
//! Thin translation between HTTP and [`StorageService`]. Errors render as
//! JSON `{code, message, class}`; internal faults get a generic message so a
//! broken server never reads like a busy one.

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        DefaultBodyLimit, Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use mirrorpool_common::{Error, ErrorClass, ObjectId, OwnerId};
use mirrorpool_core::StorageService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

pub type AppState = Arc<StorageService>;

/// Build the gateway router
pub fn router(service: AppState) -> Router {
    // Room for one chunk plus framing
    let body_limit = service.config().upload.max_chunk_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/admin/status", get(admin_status))
        .route("/uploads", post(initiate_upload))
        .route(
            "/uploads/{id}",
            put(upload_chunk).get(upload_progress).delete(cancel_upload),
        )
        .route("/uploads/{id}/complete", post(complete_upload))
        .route("/objects/{id}", get(get_object))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Error response wrapper
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    class: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.0.class();
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if class == ErrorClass::ServerError {
            error!("Request failed: {}", self.0);
            class.user_message().to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            code: self.0.code(),
            message,
            class: class.as_str(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_object_id(raw: &str) -> ApiResult<ObjectId> {
    raw.parse()
        .map_err(|_| ApiError(Error::invalid_request(format!("invalid object id {raw:?}"))))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(service): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        service.export_metrics(),
    )
}

async fn admin_status(State(service): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.status()?))
}

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub owner_id: String,
    pub declared_size_bytes: u64,
}

async fn initiate_upload(
    State(service): State<AppState>,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(|e| ApiError(Error::invalid_request(e.body_text())))?;
    let owner_id = OwnerId::new(request.owner_id).map_err(Error::from)?;
    let upload = service
        .initiate_upload(&owner_id, request.declared_size_bytes)
        .await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub offset: u64,
}

#[derive(Debug, Serialize)]
struct ChunkAccepted {
    object_id: ObjectId,
    received_bytes: u64,
}

async fn upload_chunk(
    State(service): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let object_id = parse_object_id(&id)?;
    let Query(query) = query.map_err(|e| ApiError(Error::invalid_request(e.body_text())))?;
    let received_bytes = service
        .upload_chunk(object_id, query.offset, body)
        .await?;
    Ok(Json(ChunkAccepted {
        object_id,
        received_bytes,
    }))
}

async fn upload_progress(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let object_id = parse_object_id(&id)?;
    Ok(Json(service.upload_progress(object_id)?))
}

async fn complete_upload(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let object_id = parse_object_id(&id)?;
    Ok(Json(service.complete_upload(object_id).await?))
}

async fn cancel_upload(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let object_id = parse_object_id(&id)?;
    service.cancel_upload(object_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_object(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let object_id = parse_object_id(&id)?;
    let read = service.stream_download(object_id).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, read.meta.size_bytes)
        .header("x-mirrorpool-source", read.source.as_str())
        .header(
            "x-mirrorpool-replication",
            read.meta.replication_state.as_str(),
        )
        .body(Body::from_stream(read.stream))
        .map_err(|e| ApiError(Error::internal(format!("failed to build response: {e}"))))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use mirrorpool_common::Config;
    use mirrorpool_common::config::AccountConfig;
    use mirrorpool_core::{
        BudgetError, BudgetTracker, FixedBudget, MemoryPrimaryStore, MemorySecondaryStore,
        ServiceDeps,
    };
    use mirrorpool_meta_store::MemoryMetaStore;
    use serde_json::Value;
    use tower::ServiceExt;

    struct BrokenBudget;

    impl BudgetTracker for BrokenBudget {
        fn name(&self) -> &str {
            "broken"
        }

        fn available_margin(&self) -> Result<u64, BudgetError> {
            Err(BudgetError::Probe("injected".to_string()))
        }
    }

    fn service_with(budget: Arc<dyn BudgetTracker>, max_uploads: usize) -> AppState {
        let mut config = Config::default();
        config.pool.accounts = vec![AccountConfig {
            id: "a".to_string(),
            endpoint: "memory://a".to_string(),
            secret: None,
            quota_bytes: 1 << 20,
        }];
        config.admission.max_concurrent_uploads = max_uploads;
        config.admission.acquire_wait_ms = 0;
        let deps = ServiceDeps {
            primary: Arc::new(MemoryPrimaryStore::new()),
            secondary: Arc::new(MemorySecondaryStore::new()),
            meta: Arc::new(MemoryMetaStore::new()),
            budget,
        };
        Arc::new(StorageService::start(config, deps).unwrap())
    }

    fn service() -> AppState {
        service_with(Arc::new(FixedBudget::new(1 << 30)), 4)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    fn json(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    fn initiate(size: i64) -> Request<Body> {
        Request::post("/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(
                r#"{{"owner_id":"alice","declared_size_bytes":{size}}}"#
            )))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let app = router(service());

        let (status, body) = send(&app, initiate(11)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json(&body)["object_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            Request::put(format!("/uploads/{id}?offset=0"))
                .body(Body::from("hello world"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["received_bytes"], 11);

        let (status, body) = send(
            &app,
            Request::get(format!("/uploads/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["declared_size_bytes"], 11);

        let (status, _) = send(
            &app,
            Request::post(format!("/uploads/{id}/complete"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get(format!("/objects/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-mirrorpool-source"], "primary");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_negative_and_zero_sizes_rejected() {
        let app = router(service());
        for size in [-1, 0] {
            let (status, body) = send(&app, initiate(size)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json(&body)["class"], "bad_request");
        }
    }

    #[tokio::test]
    async fn test_capacity_renders_as_busy() {
        let app = router(service_with(Arc::new(FixedBudget::new(1 << 30)), 1));
        let (status, _) = send(&app, initiate(10)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, initiate(10)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body = json(&body);
        assert_eq!(body["code"], "CapacityExhausted");
        assert_eq!(body["class"], "try_again_shortly");
    }

    #[tokio::test]
    async fn test_internal_fault_renders_as_server_error() {
        let app = router(service_with(Arc::new(BrokenBudget), 4));
        let (status, body) = send(&app, initiate(10)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(&body);
        assert_eq!(body["class"], "server_error");
        assert_eq!(body["message"], "Server error");
        assert!(!body.to_string().contains("injected"));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let app = router(service());
        let (status, _) = send(
            &app,
            Request::get("/uploads/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Request::get(format!("/objects/{}", ObjectId::new()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["code"], "NoSuchObject");
    }

    #[tokio::test]
    async fn test_cancel_and_status() {
        let service = service();
        let app = router(Arc::clone(&service));
        let (_, body) = send(&app, initiate(10)).await;
        let id = json(&body)["object_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            Request::get("/admin/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["active_uploads"], 1);

        let (status, _) = send(
            &app,
            Request::delete(format!("/uploads/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(service.status().unwrap().active_uploads, 0);

        let (status, body) =
            send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("mirrorpool_uploads_total{outcome=\"cancelled\"} 1"));
    }
}
