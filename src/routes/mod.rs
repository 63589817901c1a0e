//! Router assembly: the proxy entry point plus the built-in endpoints.

use axum::{
    Json, Router,
    extract::State,
    routing::{any, get},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::{AppState, middleware, proxy};

/// Build the application router. `/debug` is mounted only when enabled in
/// the server configuration.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/{instance}", any(proxy::handle));

    if state.config.server.debug_endpoint.enabled {
        router = router.route("/debug", get(debug_instances));
    }

    router
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Current instance table. Token values are redacted unless the deployment
/// opted into exposing them.
async fn debug_instances(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let expose_tokens = state.config.server.debug_endpoint.expose_tokens;

    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort();

    let mut instances = serde_json::Map::new();
    for name in names {
        let config = &snapshot[name];
        let mut value = serde_json::to_value(config.as_ref()).unwrap_or_default();
        if !expose_tokens && let Some(tokens) = value.get_mut("tokens") {
            *tokens = json!(vec!["<redacted>"; config.tokens.len()]);
        }
        instances.insert(name.clone(), value);
    }

    Json(json!({ "instances": instances }))
}
