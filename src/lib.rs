pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::services::edge_cache::EdgeCache;
use crate::services::executor::GenerationExecutor;
use crate::services::object_store::ObjectStore;
use crate::services::task_store::TaskStore;
use crate::services::vertex::ImageModel;

/// Request bodies carry base64 images; leave generous headroom.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::login,
        api::handlers::auth::me,
        api::handlers::users::list_users,
        api::handlers::users::create_user,
        api::handlers::users::update_user,
        api::handlers::users::delete_user,
        api::handlers::quota::get_quota,
        api::handlers::quota::consume_quota,
        api::handlers::codes::list_codes,
        api::handlers::codes::create_codes,
        api::handlers::codes::redeem,
        api::handlers::history::list_history,
        api::handlers::history::create_history,
        api::handlers::history::delete_history,
        api::handlers::upload::upload_image,
        api::handlers::generate::generate,
        api::handlers::generate::get_task,
        api::handlers::generate::b2_check,
        api::handlers::generate::vertex_check,
        api::handlers::health::health_check,
        api::handlers::proxy::proxy_object,
    ),
    components(
        schemas(
            api::handlers::auth::LoginRequest,
            api::handlers::auth::LoginResponse,
            api::handlers::auth::UserResponse,
            api::handlers::auth::MeResponse,
            api::handlers::users::CreateUserRequest,
            api::handlers::users::UpdateUserRequest,
            api::handlers::users::UserListResponse,
            api::handlers::quota::QuotaResponse,
            api::handlers::quota::ConsumeRequest,
            api::handlers::codes::CreateCodesRequest,
            api::handlers::codes::RedeemRequest,
            api::handlers::history::CreateHistoryRequest,
            api::handlers::history::HistoryEntry,
            api::handlers::upload::UploadImageRequest,
            api::handlers::generate::GenerateRequest,
            services::task_store::Task,
            services::task_store::TaskStatus,
            services::task_store::TaskOptions,
            services::task_store::TaskResult,
        )
    ),
    tags(
        (name = "auth", description = "Authentication endpoints"),
        (name = "users", description = "Account administration"),
        (name = "quota", description = "Credit accounting"),
        (name = "codes", description = "Redemption codes"),
        (name = "history", description = "Generation history"),
        (name = "generation", description = "Task intake and polling"),
        (name = "storage", description = "Public download proxy"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub object_store: Arc<dyn ObjectStore>,
    pub model: Arc<dyn ImageModel>,
    pub tasks: Arc<TaskStore>,
    pub edge_cache: Arc<EdgeCache>,
    pub executor: Arc<GenerationExecutor>,
    pub config: AppConfig,
}

pub fn create_app(state: AppState) -> Router {
    let auth_middleware = from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);

    // Public routes
    let public_routes = Router::new()
        .route("/api/auth/login", post(api::handlers::auth::login))
        .route("/__health", get(api::handlers::health::health_check))
        .route("/__b2check", get(api::handlers::generate::b2_check))
        .route("/__vertexcheck", get(api::handlers::generate::vertex_check))
        .route("/task/:id", get(api::handlers::generate::get_task))
        .route(
            "/i/*key",
            get(api::handlers::proxy::proxy_object).options(api::handlers::proxy::preflight),
        );

    // Protected routes
    let protected_routes = Router::new()
        .route("/api/auth/me", get(api::handlers::auth::me))
        .route(
            "/api/users",
            get(api::handlers::users::list_users).post(api::handlers::users::create_user),
        )
        .route(
            "/api/users/:id",
            put(api::handlers::users::update_user).delete(api::handlers::users::delete_user),
        )
        .route("/api/quota", get(api::handlers::quota::get_quota))
        .route(
            "/api/quota/consume",
            put(api::handlers::quota::consume_quota),
        )
        .route("/api/redeem", post(api::handlers::codes::redeem))
        .route(
            "/api/codes",
            get(api::handlers::codes::list_codes).post(api::handlers::codes::create_codes),
        )
        .route(
            "/api/history",
            get(api::handlers::history::list_history)
                .post(api::handlers::history::create_history),
        )
        .route(
            "/api/history/:id",
            axum::routing::delete(api::handlers::history::delete_history),
        )
        .route("/api/upload/image", post(api::handlers::upload::upload_image))
        .route("/generate", post(api::handlers::generate::generate))
        .layer(auth_middleware);

    // Configure CORS based on allowed_origins
    let cors_layer = if state.config.allowed_origins.contains(&"*".to_string()) {
        tracing::warn!(
            "CORS configured with wildcard (*) - set ALLOWED_ORIGINS to specific domains in production"
        );
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::header::ACCEPT,
                axum::http::header::ORIGIN,
                axum::http::header::RANGE,
            ])
            .expose_headers([
                axum::http::header::CONTENT_LENGTH,
                axum::http::header::CONTENT_TYPE,
                axum::http::header::CONTENT_RANGE,
                axum::http::header::ACCEPT_RANGES,
            ])
            .allow_credentials(true)
    };

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public_routes)
        .merge(protected_routes)
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer)
        .with_state(state)
}
