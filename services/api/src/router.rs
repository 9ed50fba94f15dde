//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application:
//! the `/realtime` endpoint, the static front-end, and the OpenAPI document.

use crate::{
    handlers,
    models::{ErrorResponse, RealtimeRequest, RealtimeResponse},
    state::AppState,
};

use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::handle_realtime),
    components(schemas(RealtimeRequest, RealtimeResponse, ErrorResponse)),
    tags(
        (name = "VoiceRAG API", description = "Grounded answers from the realtime model")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let static_dir = app_state.config.static_dir.clone();

    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/realtime", post(handlers::handle_realtime))
        .with_state(app_state);

    // Anything not matched above is looked up in the static directory.
    Router::new()
        .route("/api-docs/openapi.json", get(openapi_json))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .merge(api_router)
        .fallback_service(ServeDir::new(static_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::{path::Path, sync::Mutex, time::Duration};
    use tower::ServiceExt;
    use tracing::Level;
    use voicerag_core::{
        rag::RagToolConfig,
        realtime::{QueryProcessor, QueryResponse},
    };

    struct StubProcessor {
        result: Result<QueryResponse, String>,
        received: Mutex<Vec<String>>,
    }

    impl StubProcessor {
        fn new(result: Result<QueryResponse, String>) -> Self {
            Self {
                result,
                received: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryProcessor for StubProcessor {
        async fn process_query(&self, message: &str) -> anyhow::Result<QueryResponse> {
            self.received.lock().unwrap().push(message.to_string());
            self.result.clone().map_err(anyhow::Error::msg)
        }

        fn voice_choice(&self) -> &str {
            "shimmer"
        }
    }

    fn test_config(static_dir: &Path) -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            static_dir: static_dir.to_path_buf(),
            log_level: Level::INFO,
            running_in_production: false,
            openai_endpoint: "https://oai.example.com".to_string(),
            realtime_deployment: "gpt-4o-realtime-preview".to_string(),
            voice_choice: Some("shimmer".to_string()),
            openai_api_key: None,
            search_api_key: None,
            tenant_id: None,
            rag: RagToolConfig::new("https://search.example.com", "handbook"),
            query_timeout: Duration::from_secs(5),
        }
    }

    fn test_router(processor: Arc<StubProcessor>, static_dir: &Path) -> Router {
        create_router(Arc::new(AppState {
            processor,
            config: Arc::new(test_config(static_dir)),
        }))
    }

    fn answered() -> Arc<StubProcessor> {
        Arc::new(StubProcessor::new(Ok(QueryResponse {
            text: "Vision care is covered.".to_string(),
            sources: vec![json!({"chunk_id": "doc_1", "title": "Benefits", "chunk": "vision"})],
        })))
    }

    fn post_realtime(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/realtime")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(res: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(res: axum::response::Response) -> Value {
        serde_json::from_slice(&body_bytes(res).await).unwrap()
    }

    #[tokio::test]
    async fn test_realtime_returns_answer_sources_and_voice() {
        let dir = tempfile::tempdir().unwrap();
        let processor = answered();
        let app = test_router(processor.clone(), dir.path());

        let res = app
            .oneshot(post_realtime(r#"{"message": "Is vision covered?"}"#))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(
            json,
            json!({
                "response": "Vision care is covered.",
                "sources": [{"chunk_id": "doc_1", "title": "Benefits", "chunk": "vision"}],
                "voice": "shimmer"
            })
        );
        assert_eq!(
            *processor.received.lock().unwrap(),
            vec!["Is vision covered?".to_string()]
        );
    }

    #[tokio::test]
    async fn test_realtime_empty_message_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let processor = answered();

        for body in [r#"{"message": ""}"#, r#"{"message": null}"#, "{}"] {
            let app = test_router(processor.clone(), dir.path());
            let res = app.oneshot(post_realtime(body)).await.unwrap();

            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(res).await, json!({"error": "Empty message"}));
        }
        assert!(processor.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_realtime_malformed_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let processor = answered();

        let app = test_router(processor.clone(), dir.path());
        let res = app.oneshot(post_realtime("{not json")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(res).await["error"].is_string());

        let app = test_router(processor.clone(), dir.path());
        let res = app
            .oneshot(post_realtime(r#"{"message": 42}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let app = test_router(processor.clone(), dir.path());
        let req = Request::builder()
            .method("POST")
            .uri("/realtime")
            .body(Body::from(r#"{"message": "hi"}"#))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert!(processor.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_realtime_failure_is_generic_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = Arc::new(StubProcessor::new(Err(
            "realtime socket closed: secret detail".to_string(),
        )));
        let app = test_router(processor, dir.path());

        let res = app
            .oneshot(post_realtime(r#"{"message": "Hello"}"#))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(res).await,
            json!({"error": "Internal server error"})
        );
    }

    #[tokio::test]
    async fn test_root_serves_index_html() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>VoiceRAG</h1>").unwrap();
        let app = test_router(answered(), dir.path());

        let res = app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_bytes(res).await, b"<h1>VoiceRAG</h1>");
    }

    #[tokio::test]
    async fn test_static_files_are_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("app.js"), "console.log(1);").unwrap();
        let app = test_router(answered(), dir.path());

        let res = app.oneshot(get_request("/assets/app.js")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_bytes(res).await, b"console.log(1);");
    }

    #[tokio::test]
    async fn test_unknown_static_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(answered(), dir.path());

        let res = app.oneshot(get_request("/missing.css")).await.unwrap();

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_openapi_document_lists_realtime() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(answered(), dir.path());

        let res = app.oneshot(get_request("/api-docs/openapi.json")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert!(json["paths"]["/realtime"]["post"].is_object());
        assert!(json["components"]["schemas"]["RealtimeResponse"].is_object());
    }
}
