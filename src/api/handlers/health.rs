#[utoipa::path(
    get,
    path = "/__health",
    responses((status = 200, description = "Liveness probe"))
)]
pub async fn health_check() -> &'static str {
    "ok"
}
