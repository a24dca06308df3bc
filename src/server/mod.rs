mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use self::error::AppError;
pub use self::state::*;
pub use self::types::*;

/// 上传限制：10M
pub const UPLOAD_LIMIT: usize = 1024 * 1024 * 10;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::search_handler,
        api::embed_handler,
        api::search_url_handler,
        api::search_vector_handler,
        api::stats_handler,
        api::reload_handler,
    ),
    components(schemas(types::SearchForm, types::EmbedForm)),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/search", post(api::search_handler))
        .route("/embed", post(api::embed_handler))
        .route("/search/url", post(api::search_url_handler))
        .route("/search/vector", post(api::search_vector_handler))
        .route("/stats", get(api::stats_handler))
        .route("/reload", post(api::reload_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(UPLOAD_LIMIT))
        .with_state(state)
}
