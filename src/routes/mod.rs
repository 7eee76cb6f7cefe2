//! Router assembly: HTTP endpoints, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, patch},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - REST-ish API under `/api/v1/...`
/// - Static SPA from `./static` with index fallback
/// - CORS (allow any origin/method/headers)
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    // Static files with SPA fallback
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    Router::new()
        .route("/api/v1/health", get(http::http_health))
        .route(
            "/api/v1/corrections",
            get(http::http_list_corrections).post(http::http_post_corrections),
        )
        .route(
            "/api/v1/corrections/:uuid",
            get(http::http_get_correction).delete(http::http_delete_correction),
        )
        .route("/api/v1/corrections/:uuid/progress", get(http::http_get_progress))
        .route("/api/v1/corrections/:uuid/visibility", patch(http::http_patch_visibility))
        .route("/api/v1/quote", get(http::http_get_quote))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Frontend fallback
        .fallback_service(static_service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::llm::testing::{MockProvider, Reply};
    use crate::llm::ChatProvider;
    use crate::progress::LogSink;
    use crate::protocol::SubmitOut;
    use crate::store::MemoryStore;

    fn app(provider: Option<Vec<Reply>>) -> (Router, Arc<AppState>) {
        let provider = provider.map(|r| Arc::new(MockProvider::new(r)) as Arc<dyn ChatProvider>);
        let state = Arc::new(AppState::from_parts(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            provider,
            Arc::new(LogSink),
        ));
        (build_router(state.clone()), state)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut b = Request::builder().method(method).uri(uri);
        if let Some(u) = user {
            b = b.header("x-user-id", u);
        }
        match body {
            Some(v) => b
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => b.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_llm_availability() {
        let (router, _) = app(None);
        let res = router.oneshot(request("GET", "/api/v1/health", None, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await, json!({"ok": true, "llm": false}));
    }

    #[tokio::test]
    async fn submit_requires_user_header() {
        let (router, state) = app(Some(vec![]));
        let body = json!({"prompt": "续写", "essay": "I ran home."});
        let res = router.oneshot(request("POST", "/api/v1/corrections", None, Some(body))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(json_body(res).await["error"].as_str().unwrap().contains("x-user-id"));
        assert!(state.store.list_by_user("alice").await.is_empty());
    }

    #[tokio::test]
    async fn offline_submit_is_503() {
        let (router, _) = app(None);
        let body = json!({"prompt": "续写", "essay": "I ran home."});
        let res = router.oneshot(request("POST", "/api/v1/corrections", Some("alice"), Some(body))).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn submit_then_poll_progress_and_list() {
        let (router, _) = app(Some(vec![]));
        let body = json!({"prompt": "续写", "essay": "I ran home.", "tone": "strict"});
        let res = router
            .clone()
            .oneshot(request("POST", "/api/v1/corrections", Some("alice"), Some(body)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let out: SubmitOut = serde_json::from_value(json_body(res).await).unwrap();
        assert_eq!(out.uuids.len(), 1);
        let uuid = &out.uuids[0];

        let res = router
            .clone()
            .oneshot(request("GET", &format!("/api/v1/corrections/{uuid}/progress"), Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let progress = json_body(res).await;
        assert!(progress["percent"].as_u64().unwrap() >= 5);

        let res = router
            .clone()
            .oneshot(request("GET", "/api/v1/corrections", Some("alice"), None))
            .await
            .unwrap();
        let rows = json_body(res).await;
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["uuid"], json!(uuid));

        let res = router
            .oneshot(request("GET", &format!("/api/v1/corrections/{uuid}"), Some("bob"), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn visibility_and_delete_are_owner_only() {
        let (router, state) = app(Some(vec![]));
        let body = json!({"prompt": "续写", "essay": "I ran home."});
        let res = router
            .clone()
            .oneshot(request("POST", "/api/v1/corrections", Some("alice"), Some(body)))
            .await
            .unwrap();
        let out: SubmitOut = serde_json::from_value(json_body(res).await).unwrap();
        let uuid = out.uuids[0].clone();

        let patch_uri = format!("/api/v1/corrections/{uuid}/visibility");
        let res = router
            .clone()
            .oneshot(request("PATCH", &patch_uri, Some("bob"), Some(json!({"public": true}))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = router
            .clone()
            .oneshot(request("PATCH", &patch_uri, Some("alice"), Some(json!({"public": true}))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["public"], json!(true));

        let res = router
            .clone()
            .oneshot(request("GET", &format!("/api/v1/corrections/{uuid}"), None, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let item_uri = format!("/api/v1/corrections/{uuid}");
        let res = router.clone().oneshot(request("DELETE", &item_uri, Some("bob"), None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let res = router.clone().oneshot(request("DELETE", &item_uri, Some("alice"), None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(state.store.get_by_uuid(&uuid).await.is_none());
        let res = router.oneshot(request("DELETE", &item_uri, Some("alice"), None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quote_falls_back_when_offline() {
        let (router, _) = app(None);
        let res = router.oneshot(request("GET", "/api/v1/quote", None, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let q = json_body(res).await;
        assert_eq!(q["source"], json!("builtin"));
        assert!(!q["text"].as_str().unwrap().is_empty());
    }
}
