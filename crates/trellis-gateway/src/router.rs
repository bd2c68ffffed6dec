use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::SharedState;
use crate::ws;

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    let static_files = ServeDir::new(&state.config.server.static_dir);

    Router::new()
        .route("/", get(root))
        .route("/health", get(api::health))
        .route("/greet", get(api::greet))
        .route("/users", get(api::list_users).post(api::create_user))
        .route(
            "/users/{id}",
            get(api::get_user)
                .put(api::update_user)
                .delete(api::delete_user),
        )
        .route("/customer", get(api::get_customer))
        .route("/customer/{name}", post(api::create_customer))
        .route("/mongo", get(api::find_person).post(api::insert_person))
        .route("/redis", get(api::get_greeting))
        .route("/s3", get(api::list_software))
        .route("/ws", get(ws::ws_handler))
        .nest_service("/static", static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/static/")],
    )
}
