// HTTP API Server module

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod handlers;
pub mod harvester;
pub mod streaming;

use crate::auth::harvester::HarvesterHub;
use crate::auth::CredentialStore;
use crate::proxy::Gateway;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub store: Arc<CredentialStore>,
    pub hub: Arc<HarvesterHub>,
    pub api_keys: Arc<Vec<String>>,
}

/// API Key authentication middleware
async fn auth_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    // If no API keys configured, allow all requests
    if state.api_keys.is_empty() {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let is_valid = match auth_header {
        Some(auth) => {
            // Support both "Bearer <key>" and raw key
            let key = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
            state.api_keys.iter().any(|k| k == key)
        }
        None => false,
    };

    if is_valid {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [("Content-Type", "application/json")],
            r#"{"error":{"message":"Invalid API key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        )
            .into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require API key authentication
    let protected_routes = Router::new()
        .route("/v1/models", get(handlers::openai_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/admin/credentials", post(handlers::admin_credentials))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // The userscript harvester cannot set headers on a WebSocket
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/ws", get(harvester::harvester_ws));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

pub async fn start_server(addr: &str, state: AppState) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();

    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await?;

    Ok(())
}

pub async fn stop_server() -> Result<()> {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("API server stopped");
        }
    }
    Ok(())
}
