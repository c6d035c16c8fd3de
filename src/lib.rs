use std::sync::Arc;

use axum::{middleware, routing::get, Router};

pub mod auth;
pub mod call;
pub mod client;
pub mod config;
pub mod echo;
pub mod errors;
pub mod handler;
pub mod http;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod timer;
pub mod transport;

pub use call::{CallContext, CallOutcome, CallShape, CallState};
pub use errors::{AbortSignal, HandlerError, RpcError, ServerError};
pub use handler::{MethodHandler, ServiceHandlers};
pub use rpc::{Metadata, MetadataValue, Status, StatusCode};
pub use server::{PortInfo, Server, ServerOptions, ServerState};

/// Shared state of the admin HTTP surface.
#[derive(Clone)]
pub struct AdminState {
    pub server: Server,
    pub admin_token: Option<Arc<str>>,
}

impl AdminState {
    pub fn new(server: Server, admin_token: Option<String>) -> Self {
        Self {
            server,
            admin_token: admin_token.map(Arc::<str>::from),
        }
    }
}

pub fn build_admin_app(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/status", get(http::handlers::status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn app(server: Server) -> Router {
        build_admin_app(AdminState::new(
            server,
            Some("token-1234567890ab".to_string()),
        ))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("valid json response")
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app(Server::new())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(body, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn status_requires_token() {
        let response = app(Server::new())
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body_json = body_json(response).await;
        assert_eq!(body_json["code"], "missing_token");
    }

    #[tokio::test]
    async fn status_rejects_wrong_token() {
        let response = app(Server::new())
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .method("GET")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body_json = body_json(response).await;
        assert_eq!(body_json["code"], "invalid_token");
    }

    #[tokio::test]
    async fn status_reports_runtime_snapshot() {
        let server = Server::new();
        server
            .register_handlers(echo::service())
            .expect("register");
        server.bind_insecure_port("127.0.0.1:0").expect("bind");

        let response = app(server.clone())
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .method("GET")
                    .header(header::AUTHORIZATION, "Bearer token-1234567890ab")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        assert_eq!(body_json["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(body_json["state"], "CREATED");
        assert_eq!(body_json["active_calls"], 0);
        assert!(body_json["drain_remaining_ms"].is_null());
        assert_eq!(body_json["ports"][0]["secure"], false);
        assert_eq!(body_json["methods"][0], "/demo.Echo/Chat");
        assert_eq!(body_json["methods"].as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn status_is_open_without_admin_token() {
        let server = Server::new();
        server.stop(None).await;

        let response = build_admin_app(AdminState::new(server, None))
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        assert_eq!(body_json["state"], "STOPPED");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = app(Server::new())
            .oneshot(
                Request::builder()
                    .uri("/")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
