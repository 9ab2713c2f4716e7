use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::api::get_api_router;
use crate::app_state::AppState;

pub fn get_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .nest("/api", get_api_router(state))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> &'static str {
    "Welcome to online storage API"
}
