use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::rest::{agent, health, specialists};
use crate::state::AppState;
use crate::ws::handler::agent_or_upgrade;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(health::health))
        .route("/specialists", get(specialists::list))
        .route("/agent", get(agent::list_agents).post(agent::create_agent))
        .route(
            "/agent/{id}",
            get(agent_or_upgrade).delete(agent::delete_agent),
        )
        .route("/agent/{id}/conversation", get(agent::conversation))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
