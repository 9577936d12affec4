//! HTTP surface: router wiring, bearer auth and handlers.

pub mod auth;
pub mod docs;
pub mod handlers;

use crate::config::Config;
use crate::gate::PathGate;
use crate::index::IndexStore;
use crate::upload::UploadEngine;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub gate: Arc<PathGate>,
    pub index: Option<Arc<IndexStore>>,
    pub uploads: Arc<UploadEngine>,
}

pub fn router(state: AppState) -> Router {
    let files = Router::new()
        .route("/info", get(handlers::info))
        .route(
            "/content",
            get(handlers::download).put(handlers::upload_single),
        )
        .route("/mkdir", post(handlers::mkdir))
        .route("/delete", delete(handlers::delete_path))
        .route("/transfer", post(handlers::transfer))
        .route("/search", get(handlers::search))
        .route("/upload/start", post(handlers::upload_start))
        .route("/upload/chunk", post(handlers::upload_chunk))
        .route("/thumbnail/image", get(handlers::thumbnail))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/docs", get(docs::markdown_digest))
        .route("/openapi.json", get(docs::openapi_json))
        .nest("/files", files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "filegate listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
