use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let gateway = state.agent.gateway();
    let mut providers = gateway.providers();
    providers.sort();

    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "default_provider": gateway.default_provider(),
        "providers": providers,
        "active_pool_clients": state.pool.active_providers().len(),
    }))
}
