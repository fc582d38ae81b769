//! HTTP surface of the broker.
//!
//! - `/sso/*` - upstream login and the downstream authorization server
//! - `/healthz` - health check
//! - `/api-docs` - generated OpenAPI documentation

pub mod health;
pub mod openapi;

pub use crate::sso::endpoints::SSO_TAG;
pub use health::MISC_TAG;

use crate::AppContext;
use crate::sso::endpoints;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Full application router, including the API docs.
pub fn app_router(ctx: AppContext) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/sso", endpoints::router(ctx))
        .routes(routes!(health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(ctx))]
pub async fn start_webserver(ctx: AppContext, listen_addr: &str) -> color_eyre::Result<()> {
    let router = app_router(ctx);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = listen_addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
